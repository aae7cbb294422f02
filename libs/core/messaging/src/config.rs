//! Broker-independent subscription options and retry backoff.

use std::time::Duration;

/// Options shared by every adapter's `subscribe`, plus the adapter-specific
/// part in `config`.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions<T> {
    /// Acknowledge on delivery instead of after the handler succeeds.
    pub auto_ack: bool,
    /// Number of concurrent handler invocations. Zero means "adapter default".
    pub concurrency: usize,
    pub config: T,
}

impl<T> SubscribeOptions<T> {
    pub fn new(config: T) -> Self {
        Self {
            auto_ack: false,
            concurrency: 0,
            config,
        }
    }

    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Concurrency to use, falling back to `default` when unset.
    pub fn concurrency_or(&self, default: usize) -> usize {
        if self.concurrency == 0 {
            default
        } else {
            self.concurrency
        }
    }
}

/// Delay schedule for redeliveries and task retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffStrategy {
    Fixed(Duration),

    /// `base * 2^n`, capped at `max`
    Exponential { base: Duration, max: Duration },

    /// `base * (n + 1)`, capped at `max`
    Linear { base: Duration, max: Duration },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl BackoffStrategy {
    /// Delay before the `n`-th retry (zero based).
    pub fn delay(&self, n: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(d) => *d,
            BackoffStrategy::Exponential { base, max } => base
                .saturating_mul(2u32.saturating_pow(n))
                .min(*max),
            BackoffStrategy::Linear { base, max } => {
                base.saturating_mul(n.saturating_add(1)).min(*max)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_fallback() {
        let opts = SubscribeOptions::new(());
        assert_eq!(opts.concurrency_or(1), 1);
        assert_eq!(opts.with_concurrency(5).concurrency_or(1), 5);
    }

    #[test]
    fn test_backoff_exponential_is_capped() {
        let backoff = BackoffStrategy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(10),
        };

        assert_eq!(backoff.delay(0), Duration::from_millis(500));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(10), Duration::from_secs(10));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_linear_and_fixed() {
        let linear = BackoffStrategy::Linear {
            base: Duration::from_secs(5),
            max: Duration::from_secs(60),
        };
        assert_eq!(linear.delay(1), Duration::from_secs(10));
        assert_eq!(linear.delay(20), Duration::from_secs(60));

        let fixed = BackoffStrategy::Fixed(Duration::from_secs(3));
        assert_eq!(fixed.delay(0), fixed.delay(7));
    }
}
