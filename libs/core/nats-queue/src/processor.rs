//! Settles a delivery according to the handler outcome.

use crate::delivery::Delivery;
use messaging::{BackoffStrategy, Dispatch, Dispatcher, HandlerOutcome};
use std::time::Duration;

/// Redelivery delay for a failed delivery.
///
/// The first failure is nacked immediately; later ones wait according to
/// `backoff` (attempt 2 uses `backoff.delay(0)`). Without metadata or
/// without a backoff the nak is immediate.
pub fn nack_delay(attempt: Option<u64>, backoff: Option<&BackoffStrategy>) -> Option<Duration> {
    match (attempt, backoff) {
        (Some(attempt), Some(backoff)) if attempt >= 2 => {
            let n = u32::try_from(attempt - 2).unwrap_or(u32::MAX);
            Some(backoff.delay(n))
        }
        _ => None,
    }
}

pub struct DeliveryHandler {
    dispatcher: Dispatcher,
    auto_ack: bool,
    backoff: Option<BackoffStrategy>,
}

impl DeliveryHandler {
    pub fn new(dispatcher: Dispatcher, auto_ack: bool, backoff: Option<BackoffStrategy>) -> Self {
        Self {
            dispatcher,
            auto_ack,
            backoff,
        }
    }

    pub async fn handle<D: Delivery>(&self, delivery: D) {
        let metrics = self.dispatcher.metrics();
        let logger = self.dispatcher.logger();
        let subject = delivery.subject().to_string();

        if self.auto_ack {
            if let Err(e) = delivery.ack().await {
                logger.error("Failed to ack message", Some(&e), &[("subject", &subject)]);
                metrics.settle_failed();
            }
        }

        let outcome = match self.dispatcher.dispatch(delivery.to_message()).await {
            Dispatch::Dropped(_) => {
                if !self.auto_ack {
                    if let Err(e) = delivery.term().await {
                        logger.error("Failed to term message", Some(&e), &[("subject", &subject)]);
                        metrics.settle_failed();
                    }
                }
                return;
            }
            Dispatch::Handled(outcome) => outcome,
        };

        if self.auto_ack {
            return;
        }

        if let HandlerOutcome::Ok = outcome {
            match delivery.ack().await {
                Ok(()) => metrics.message_acked(),
                Err(e) => {
                    logger.error("Failed to ack message", Some(&e), &[("subject", &subject)]);
                    metrics.settle_failed();
                }
            }
            return;
        }

        let attempt = delivery.attempt();
        if attempt.is_none() {
            logger.warn("Message metadata unavailable", None, &[("subject", &subject)]);
        }

        let delay = nack_delay(attempt, self.backoff.as_ref());
        match delivery.nak(delay).await {
            Ok(()) => metrics.message_nacked(delay.is_some()),
            Err(e) => {
                logger.error("Failed to nack message", Some(&e), &[("subject", &subject)]);
                metrics.settle_failed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeBroker, Settled};
    use messaging::testing::RecordingLogger;
    use messaging::{handler_fn, keys, HandlerError, Message, MiddlewareStack, QueueMetrics};
    use std::sync::Arc;

    fn handler(handler: messaging::HandlerFunc, auto_ack: bool) -> DeliveryHandler {
        let chain = MiddlewareStack::new().apply(handler, false);
        let dispatcher = Dispatcher::new(
            chain,
            Arc::new(RecordingLogger::default()),
            QueueMetrics::new("nats", "orders"),
        );
        DeliveryHandler::new(
            dispatcher,
            auto_ack,
            Some(BackoffStrategy::Fixed(Duration::from_secs(2))),
        )
    }

    #[test]
    fn test_nack_delay_policy() {
        let backoff = BackoffStrategy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(8),
        };

        assert_eq!(nack_delay(None, Some(&backoff)), None);
        assert_eq!(nack_delay(Some(1), Some(&backoff)), None);
        assert_eq!(nack_delay(Some(2), Some(&backoff)), Some(Duration::from_secs(1)));
        assert_eq!(nack_delay(Some(4), Some(&backoff)), Some(Duration::from_secs(4)));
        assert_eq!(nack_delay(Some(3), None), None);
    }

    #[tokio::test]
    async fn test_success_acks() {
        let broker = FakeBroker::new(5);
        let delivery = broker.delivery(Message::new("ok").with_topic("orders.created"));

        handler(handler_fn(|_, _| async { Ok(()) }), false)
            .handle(delivery)
            .await;

        assert_eq!(broker.settled(), vec![Settled::Ack]);
    }

    #[tokio::test]
    async fn test_failure_naks_with_backoff_after_first_attempt() {
        let broker = FakeBroker::new(5);
        let failing = || handler(handler_fn(|_, _| async { Err(HandlerError::failed("nope")) }), false);

        failing().handle(broker.delivery(Message::new("a"))).await;
        failing()
            .handle(broker.delivery_at(Message::new("b"), Some(3)))
            .await;
        failing()
            .handle(broker.delivery_at(Message::new("c"), None))
            .await;

        assert_eq!(
            broker.settled(),
            vec![
                Settled::Nak(None),
                Settled::Nak(Some(Duration::from_secs(2))),
                Settled::Nak(None),
            ]
        );
    }

    #[tokio::test]
    async fn test_undecodable_body_is_terminated() {
        let broker = FakeBroker::new(5);
        let message = Message::new("not gzip").with_header(keys::COMPRESSION, "gzip");

        handler(handler_fn(|_, _| async { Ok(()) }), false)
            .handle(broker.delivery(message))
            .await;

        assert_eq!(broker.settled(), vec![Settled::Term]);
    }

    #[tokio::test]
    async fn test_auto_ack_settles_once_before_handler() {
        let broker = FakeBroker::new(5);

        handler(handler_fn(|_, _| async { Err(HandlerError::failed("ignored")) }), true)
            .handle(broker.delivery(Message::new("x")))
            .await;

        assert_eq!(broker.settled(), vec![Settled::Ack]);
    }
}
