//! Configuration for the JetStream adapter.

use async_nats::jetstream::stream::{Config as StreamConfig, RetentionPolicy, StorageType};
use core_config::{env_optional, env_or_default, env_parse, ConfigError, FromEnv};
use messaging::BackoffStrategy;
use std::time::Duration;

/// Connection settings plus the streams provisioned at connect time.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Takes precedence over username/password when set.
    pub token: Option<String>,
    pub client_name: Option<String>,
    /// Upper bound for draining subscriptions and waiting for the close event.
    pub drain_timeout: Duration,
    pub topics: Vec<TopicConfig>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4222,
            username: None,
            password: None,
            token: None,
            client_name: None,
            drain_timeout: Duration::from_secs(30),
            topics: Vec::new(),
        }
    }
}

impl NatsConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn url(&self) -> String {
        format!("nats://{}:{}", self.host, self.port)
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_topic(mut self, topic: TopicConfig) -> Self {
        self.topics.push(topic);
        self
    }
}

impl FromEnv for NatsConfig {
    /// Reads `NATS_HOST` (localhost), `NATS_PORT` (4222), `NATS_USERNAME`,
    /// `NATS_PASSWORD`, `NATS_TOKEN` and `NATS_DRAIN_TIMEOUT_SECS` (30).
    /// Topics are not read from the environment.
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_or_default("NATS_HOST", "localhost"),
            port: env_parse("NATS_PORT", 4222)?,
            username: env_optional("NATS_USERNAME"),
            password: env_optional("NATS_PASSWORD"),
            token: env_optional("NATS_TOKEN"),
            client_name: None,
            drain_timeout: Duration::from_secs(env_parse("NATS_DRAIN_TIMEOUT_SECS", 30)?),
            topics: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorageKind {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetentionKind {
    #[default]
    Limits,
    Interest,
    WorkQueue,
}

/// A JetStream stream definition. Negative limits mean unlimited.
#[derive(Debug, Clone)]
pub struct TopicConfig {
    pub name: String,
    pub description: Option<String>,
    pub subjects: Vec<String>,
    pub max_messages: i64,
    /// Zero keeps messages forever.
    pub max_age: Duration,
    pub max_bytes: i64,
    pub storage: StorageKind,
    pub retention: RetentionKind,
    pub replicas: usize,
}

impl TopicConfig {
    pub fn new<S: Into<String>>(name: impl Into<String>, subjects: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            description: None,
            subjects: subjects.into_iter().map(Into::into).collect(),
            max_messages: -1,
            max_age: Duration::ZERO,
            max_bytes: -1,
            storage: StorageKind::File,
            retention: RetentionKind::Limits,
            replicas: 1,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_limits(mut self, max_messages: i64, max_bytes: i64, max_age: Duration) -> Self {
        self.max_messages = max_messages;
        self.max_bytes = max_bytes;
        self.max_age = max_age;
        self
    }

    pub fn with_storage(mut self, storage: StorageKind) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_retention(mut self, retention: RetentionKind) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub(crate) fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            name: self.name.clone(),
            description: self.description.clone(),
            subjects: self.subjects.clone(),
            max_messages: self.max_messages,
            max_bytes: self.max_bytes,
            max_age: self.max_age,
            storage: match self.storage {
                StorageKind::File => StorageType::File,
                StorageKind::Memory => StorageType::Memory,
            },
            retention: match self.retention {
                RetentionKind::Limits => RetentionPolicy::Limits,
                RetentionKind::Interest => RetentionPolicy::Interest,
                RetentionKind::WorkQueue => RetentionPolicy::WorkQueue,
            },
            num_replicas: self.replicas.max(1),
            ..Default::default()
        }
    }
}

/// Durable consumer settings for `subscribe`, `subscribe_messages` and
/// `subscribe_consumer`.
#[derive(Debug, Clone)]
pub struct JetStreamSubscribeConfig {
    /// Durable consumer name. Defaults to `{topic}-workers`.
    pub durable_name: Option<String>,
    pub ack_wait: Duration,
    /// Broker-side delivery cap, `-1` for unlimited.
    pub max_deliver: i64,
    /// Empty means every subject of the stream.
    pub filter_subject: String,
    pub max_ack_pending: i64,
    pub pull_max_messages: usize,
    /// Delay schedule for redeliveries from the second attempt on.
    pub redelivery_backoff: Option<BackoffStrategy>,
    pub no_recovery: bool,
}

impl Default for JetStreamSubscribeConfig {
    fn default() -> Self {
        Self {
            durable_name: None,
            ack_wait: Duration::from_secs(30),
            max_deliver: 5,
            filter_subject: String::new(),
            max_ack_pending: 1000,
            pull_max_messages: 100,
            redelivery_backoff: None,
            no_recovery: false,
        }
    }
}

impl JetStreamSubscribeConfig {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            durable_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: i64) -> Self {
        self.max_deliver = max_deliver;
        self
    }

    pub fn with_filter_subject(mut self, subject: impl Into<String>) -> Self {
        self.filter_subject = subject.into();
        self
    }

    pub fn with_max_ack_pending(mut self, max_ack_pending: i64) -> Self {
        self.max_ack_pending = max_ack_pending;
        self
    }

    pub fn with_pull_max_messages(mut self, n: usize) -> Self {
        self.pull_max_messages = n;
        self
    }

    pub fn with_redelivery_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.redelivery_backoff = Some(backoff);
        self
    }

    pub fn without_recovery(mut self) -> Self {
        self.no_recovery = true;
        self
    }

    pub(crate) fn durable_name_for(&self, topic: &str) -> String {
        self.durable_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("{topic}-workers"))
    }

    pub(crate) fn batch_size(&self) -> usize {
        if self.pull_max_messages == 0 {
            100
        } else {
            self.pull_max_messages
        }
    }
}

/// Settings for plain (non-durable) subject subscriptions.
#[derive(Debug, Clone)]
pub struct SubjectSubscribeConfig {
    /// Load-balance across subscribers sharing this group.
    pub queue_group: Option<String>,
    /// Buffer between the subscription and its workers.
    pub channel_capacity: usize,
    pub no_recovery: bool,
}

impl Default for SubjectSubscribeConfig {
    fn default() -> Self {
        Self {
            queue_group: None,
            channel_capacity: 10,
            no_recovery: false,
        }
    }
}

impl SubjectSubscribeConfig {
    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }
}
