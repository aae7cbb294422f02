//! Configuration for the task adapter.

use core_config::{env_optional, env_or_default, env_parse, ConfigError, FromEnv};
use messaging::BackoffStrategy;
use std::collections::BTreeMap;
use std::time::Duration;

/// Default queue weights: `critical:6, default:3, low:1`.
pub fn default_queues() -> BTreeMap<String, u32> {
    [("critical", 6), ("default", 3), ("low", 1)]
        .into_iter()
        .map(|(name, weight)| (name.to_string(), weight))
        .collect()
}

/// Redis connection plus worker pool settings.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: i64,
    /// Maximum tasks processed at once.
    pub concurrency: usize,
    /// Queue name to priority weight.
    pub queues: BTreeMap<String, u32>,
    /// How often due scheduled and retry tasks are moved to pending.
    pub forward_interval: Duration,
    /// Idle wait when every queue is empty.
    pub poll_interval: Duration,
    /// How long `shutdown` waits for in-flight tasks.
    pub shutdown_timeout: Duration,
    /// How long a dequeued task stays claimed without a heartbeat. Tasks
    /// whose lease runs out are recovered by the forwarder.
    pub lease_duration: Duration,
    pub retry_backoff: BackoffStrategy,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            username: None,
            password: None,
            db: 0,
            concurrency: 20,
            queues: default_queues(),
            forward_interval: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(8),
            lease_duration: Duration::from_secs(30),
            retry_backoff: BackoffStrategy::Exponential {
                base: Duration::from_secs(10),
                max: Duration::from_secs(3600),
            },
        }
    }
}

impl TaskConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// `redis://[user:pass@]host:port/db`
    pub fn url(&self) -> String {
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(password)) => format!(
                "{}:{}@",
                urlencoding::encode(user),
                urlencoding::encode(password)
            ),
            (None, Some(password)) => format!(":{}@", urlencoding::encode(password)),
            _ => String::new(),
        };
        format!("redis://{}{}:{}/{}", auth, self.host, self.port, self.db)
    }

    pub fn with_credentials(mut self, username: Option<String>, password: impl Into<String>) -> Self {
        self.username = username;
        self.password = Some(password.into());
        self
    }

    pub fn with_db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_queue(mut self, name: impl Into<String>, weight: u32) -> Self {
        self.queues.insert(name.into(), weight);
        self
    }

    /// Replace the whole weight map.
    pub fn with_queues(mut self, queues: BTreeMap<String, u32>) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_forward_interval(mut self, interval: Duration) -> Self {
        self.forward_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

/// Parse `name:weight,name:weight`.
pub fn parse_queues(raw: &str) -> Result<BTreeMap<String, u32>, String> {
    let mut queues = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, weight) = entry
            .split_once(':')
            .ok_or_else(|| format!("expected name:weight, got '{entry}'"))?;
        let weight: u32 = weight
            .trim()
            .parse()
            .map_err(|e| format!("invalid weight for queue '{}': {e}", name.trim()))?;
        if weight == 0 {
            return Err(format!("weight for queue '{}' must be positive", name.trim()));
        }
        queues.insert(name.trim().to_string(), weight);
    }

    if queues.is_empty() {
        return Err("at least one queue is required".to_string());
    }
    Ok(queues)
}

impl FromEnv for TaskConfig {
    /// Reads `TASK_REDIS_HOST` (localhost), `TASK_REDIS_PORT` (6379),
    /// `TASK_REDIS_USERNAME`, `TASK_REDIS_PASSWORD`, `TASK_REDIS_DB` (0),
    /// `TASK_CONCURRENCY` (20) and `TASK_QUEUES` (critical:6,default:3,low:1).
    fn from_env() -> Result<Self, ConfigError> {
        let queues = match env_optional("TASK_QUEUES") {
            Some(raw) => parse_queues(&raw).map_err(|details| ConfigError::ParseError {
                key: "TASK_QUEUES".to_string(),
                details,
            })?,
            None => default_queues(),
        };

        let concurrency = env_parse("TASK_CONCURRENCY", 20usize)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid(
                "TASK_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            host: env_or_default("TASK_REDIS_HOST", "localhost"),
            port: env_parse("TASK_REDIS_PORT", 6379)?,
            username: env_optional("TASK_REDIS_USERNAME"),
            password: env_optional("TASK_REDIS_PASSWORD"),
            db: env_parse("TASK_REDIS_DB", 0)?,
            concurrency,
            queues,
            ..Default::default()
        })
    }
}

/// Per-handler settings for `subscribe`.
#[derive(Debug, Clone, Default)]
pub struct TaskSubscribeConfig {
    /// Skip the default panic-recovery middleware.
    pub no_recovery: bool,
}
