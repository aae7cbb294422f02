//! Task storage operations and their Redis implementation.

use crate::config::TaskConfig;
use crate::keys;
use crate::task::TaskMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use messaging::QueueError;
use redis::aio::ConnectionManager;
use redis::{RedisError, Script};
use tracing::debug;

/// Tasks moved per forwarding pass and set.
const FORWARD_BATCH: usize = 100;

/// A task taken off a pending list, with the exact stored string so it can
/// be removed from the active list afterwards.
#[derive(Debug, Clone)]
pub struct Dequeued {
    pub message: TaskMessage,
    pub raw: String,
}

/// The operations the client, server and forwarder need.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn ping(&self) -> Result<(), QueueError>;

    /// Append to the queue's pending list.
    async fn enqueue(&self, message: &TaskMessage) -> Result<(), QueueError>;

    /// Park in the scheduled set until `at`.
    async fn schedule(&self, message: &TaskMessage, at: DateTime<Utc>) -> Result<(), QueueError>;

    /// Move the oldest pending task to the active list, leased until
    /// `lease_until`.
    async fn dequeue(&self, queue: &str, lease_until: DateTime<Utc>) -> Result<Option<Dequeued>, QueueError>;

    /// Push the lease of an active task out to `until`.
    async fn extend_lease(&self, task: &Dequeued, until: DateTime<Utc>) -> Result<(), QueueError>;

    /// Active tasks of `queue` whose lease ran out before `now`.
    async fn expired_leases(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<Dequeued>, QueueError>;

    /// Remove a finished task from the active list.
    async fn done(&self, task: &Dequeued) -> Result<(), QueueError>;

    /// Move an active task to the retry set, due at `at`.
    async fn retry(&self, task: &Dequeued, at: DateTime<Utc>, error: &str) -> Result<(), QueueError>;

    /// Move an active task to the archive.
    async fn archive(&self, task: &Dequeued, error: &str) -> Result<(), QueueError>;

    /// Move due scheduled and retry tasks of `queue` to pending. Returns how
    /// many moved.
    async fn forward(&self, queue: &str, now: DateTime<Utc>) -> Result<usize, QueueError>;
}

/// Next stored form after a failed attempt.
pub(crate) fn failed_copy(message: &TaskMessage, error: &str, count_retry: bool) -> TaskMessage {
    let mut next = message.clone();
    if count_retry {
        next.retried = next.retried.saturating_add(1);
    }
    next.error_msg = Some(error.to_string());
    next
}

fn redis_error(operation: &str, e: RedisError) -> QueueError {
    QueueError::connection(format!("redis {operation} failed: {e}"))
}

const FORWARD_SCRIPT: &str = r#"
local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, ARGV[2])
for _, raw in ipairs(due) do
    redis.call("LPUSH", KEYS[2], raw)
    redis.call("ZREM", KEYS[1], raw)
end
return #due
"#;

const DEQUEUE_SCRIPT: &str = r#"
local raw = redis.call("LMOVE", KEYS[1], KEYS[2], "RIGHT", "LEFT")
if raw then
    redis.call("ZADD", KEYS[3], ARGV[1], raw)
end
return raw
"#;

/// Redis-backed store using a shared `ConnectionManager`.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    forward: Script,
    dequeue: Script,
}

impl RedisStore {
    /// Connect and ping; an unreachable server fails here.
    pub async fn connect(config: &TaskConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.url())
            .map_err(|e| QueueError::connection(format!("invalid redis url: {e}")))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::connection(format!("failed to connect redis: {e}")))?;

        let store = Self::new(redis);
        store.ping().await?;
        Ok(store)
    }

    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            forward: Script::new(FORWARD_SCRIPT),
            dequeue: Script::new(DEQUEUE_SCRIPT),
        }
    }

    pub fn redis(&self) -> ConnectionManager {
        self.redis.clone()
    }

    /// Archive an entry that cannot be decoded so it does not sit in the
    /// active list forever.
    async fn discard(&self, queue: &str, raw: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(keys::active(queue))
            .arg(1)
            .arg(raw)
            .ignore()
            .cmd("ZREM")
            .arg(keys::lease(queue))
            .arg(raw)
            .ignore()
            .cmd("ZADD")
            .arg(keys::archived(queue))
            .arg(Utc::now().timestamp())
            .arg(raw)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("archive", e))?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for RedisStore {
    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("PING", e))?;
        Ok(())
    }

    async fn enqueue(&self, message: &TaskMessage) -> Result<(), QueueError> {
        let raw = message.encode()?;
        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(keys::queues())
            .arg(&message.queue)
            .ignore()
            .cmd("LPUSH")
            .arg(keys::pending(&message.queue))
            .arg(raw)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("enqueue", e))?;
        Ok(())
    }

    async fn schedule(&self, message: &TaskMessage, at: DateTime<Utc>) -> Result<(), QueueError> {
        let raw = message.encode()?;
        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(keys::queues())
            .arg(&message.queue)
            .ignore()
            .cmd("ZADD")
            .arg(keys::scheduled(&message.queue))
            .arg(at.timestamp())
            .arg(raw)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("schedule", e))?;
        Ok(())
    }

    async fn dequeue(&self, queue: &str, lease_until: DateTime<Utc>) -> Result<Option<Dequeued>, QueueError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = self
            .dequeue
            .key(keys::pending(queue))
            .key(keys::active(queue))
            .key(keys::lease(queue))
            .arg(lease_until.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("dequeue", e))?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match TaskMessage::decode(&raw) {
            Ok(message) => Ok(Some(Dequeued { message, raw })),
            Err(e) => {
                self.discard(queue, &raw).await?;
                Err(e)
            }
        }
    }

    async fn extend_lease(&self, task: &Dequeued, until: DateTime<Utc>) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(keys::lease(&task.message.queue))
            .arg("XX")
            .arg(until.timestamp_millis())
            .arg(&task.raw)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("ZADD", e))?;
        Ok(())
    }

    async fn expired_leases(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<Dequeued>, QueueError> {
        let mut conn = self.redis.clone();
        let raws: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(keys::lease(queue))
            .arg("-inf")
            .arg(now.timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(FORWARD_BATCH)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("ZRANGEBYSCORE", e))?;

        let mut expired = Vec::with_capacity(raws.len());
        for raw in raws {
            match TaskMessage::decode(&raw) {
                Ok(message) => expired.push(Dequeued { message, raw }),
                Err(_) => self.discard(queue, &raw).await?,
            }
        }
        Ok(expired)
    }

    async fn done(&self, task: &Dequeued) -> Result<(), QueueError> {
        let queue = &task.message.queue;
        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(keys::active(queue))
            .arg(1)
            .arg(&task.raw)
            .ignore()
            .cmd("ZREM")
            .arg(keys::lease(queue))
            .arg(&task.raw)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("done", e))?;
        Ok(())
    }

    async fn retry(&self, task: &Dequeued, at: DateTime<Utc>, error: &str) -> Result<(), QueueError> {
        let queue = &task.message.queue;
        let next = failed_copy(&task.message, error, true).encode()?;
        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(keys::active(queue))
            .arg(1)
            .arg(&task.raw)
            .ignore()
            .cmd("ZREM")
            .arg(keys::lease(queue))
            .arg(&task.raw)
            .ignore()
            .cmd("ZADD")
            .arg(keys::retry(queue))
            .arg(at.timestamp())
            .arg(next)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("retry", e))?;
        Ok(())
    }

    async fn archive(&self, task: &Dequeued, error: &str) -> Result<(), QueueError> {
        let queue = &task.message.queue;
        let archived = failed_copy(&task.message, error, false).encode()?;
        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(keys::active(queue))
            .arg(1)
            .arg(&task.raw)
            .ignore()
            .cmd("ZREM")
            .arg(keys::lease(queue))
            .arg(&task.raw)
            .ignore()
            .cmd("ZADD")
            .arg(keys::archived(queue))
            .arg(Utc::now().timestamp())
            .arg(archived)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("archive", e))?;
        Ok(())
    }

    async fn forward(&self, queue: &str, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let mut moved = 0;
        for source in [keys::scheduled(queue), keys::retry(queue)] {
            let count: usize = self
                .forward
                .key(&source)
                .key(keys::pending(queue))
                .arg(now.timestamp())
                .arg(FORWARD_BATCH)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| redis_error("forward", e))?;
            moved += count;
        }

        if moved > 0 {
            debug!(queue = %queue, moved, "Forwarded due tasks");
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::build_task;

    #[test]
    fn test_failed_copy_counts_retries() {
        let message = build_task("a", Vec::new(), None).to_message();

        let retried = failed_copy(&message, "boom", true);
        assert_eq!(retried.retried, 1);
        assert_eq!(retried.error_msg.as_deref(), Some("boom"));
        assert_eq!(retried.id, message.id);

        let archived = failed_copy(&message, "gone", false);
        assert_eq!(archived.retried, 0);
    }
}
