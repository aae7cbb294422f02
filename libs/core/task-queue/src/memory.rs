//! In-memory task store for unit tests.

use crate::store::{failed_copy, Dequeued, TaskStore};
use crate::task::TaskMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use messaging::QueueError;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
struct Queue {
    pending: VecDeque<String>,
    active: Vec<String>,
    /// Lease expiry in unix millis per active entry.
    leases: Vec<(i64, String)>,
    scheduled: Vec<(i64, String)>,
    retry: Vec<(i64, String)>,
    archived: Vec<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    queues: Mutex<HashMap<String, Queue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&mut Queue) -> T) -> T {
        let mut queues = self.queues.lock().unwrap();
        f(queues.entry(queue.to_string()).or_default())
    }

    fn decode_all<'a>(raws: impl Iterator<Item = &'a String>) -> Vec<TaskMessage> {
        raws.map(|raw| TaskMessage::decode(raw).unwrap()).collect()
    }

    pub fn pending(&self, queue: &str) -> Vec<TaskMessage> {
        self.with_queue(queue, |q| Self::decode_all(q.pending.iter()))
    }

    pub fn active(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.active.len())
    }

    pub fn lease(&self, queue: &str) -> Option<i64> {
        self.with_queue(queue, |q| q.leases.first().map(|(until, _)| *until))
    }

    pub fn scheduled(&self, queue: &str) -> Vec<(i64, TaskMessage)> {
        self.with_queue(queue, |q| {
            q.scheduled
                .iter()
                .map(|(at, raw)| (*at, TaskMessage::decode(raw).unwrap()))
                .collect()
        })
    }

    pub fn retry(&self, queue: &str) -> Vec<(i64, TaskMessage)> {
        self.with_queue(queue, |q| {
            q.retry
                .iter()
                .map(|(at, raw)| (*at, TaskMessage::decode(raw).unwrap()))
                .collect()
        })
    }

    pub fn archived(&self, queue: &str) -> Vec<TaskMessage> {
        self.with_queue(queue, |q| Self::decode_all(q.archived.iter()))
    }
}

fn remove_active(queue: &mut Queue, raw: &str) {
    if let Some(pos) = queue.active.iter().position(|r| r == raw) {
        queue.active.remove(pos);
    }
    queue.leases.retain(|(_, r)| r != raw);
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn enqueue(&self, message: &TaskMessage) -> Result<(), QueueError> {
        let raw = message.encode()?;
        self.with_queue(&message.queue, |q| q.pending.push_front(raw));
        Ok(())
    }

    async fn schedule(&self, message: &TaskMessage, at: DateTime<Utc>) -> Result<(), QueueError> {
        let raw = message.encode()?;
        self.with_queue(&message.queue, |q| q.scheduled.push((at.timestamp(), raw)));
        Ok(())
    }

    async fn dequeue(&self, queue: &str, lease_until: DateTime<Utc>) -> Result<Option<Dequeued>, QueueError> {
        let raw = self.with_queue(queue, |q| {
            let raw = q.pending.pop_back()?;
            q.active.push(raw.clone());
            q.leases.push((lease_until.timestamp_millis(), raw.clone()));
            Some(raw)
        });
        let Some(raw) = raw else {
            return Ok(None);
        };

        match TaskMessage::decode(&raw) {
            Ok(message) => Ok(Some(Dequeued { message, raw })),
            Err(e) => {
                self.with_queue(queue, |q| {
                    remove_active(q, &raw);
                    q.archived.push(raw.clone());
                });
                Err(e)
            }
        }
    }

    async fn extend_lease(&self, task: &Dequeued, until: DateTime<Utc>) -> Result<(), QueueError> {
        self.with_queue(&task.message.queue, |q| {
            for (expiry, raw) in q.leases.iter_mut() {
                if *raw == task.raw {
                    *expiry = until.timestamp_millis();
                }
            }
        });
        Ok(())
    }

    async fn expired_leases(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<Dequeued>, QueueError> {
        let now = now.timestamp_millis();
        let raws: Vec<String> = self.with_queue(queue, |q| {
            q.leases
                .iter()
                .filter(|(until, _)| *until <= now)
                .map(|(_, raw)| raw.clone())
                .collect()
        });
        raws.into_iter()
            .map(|raw| Ok(Dequeued { message: TaskMessage::decode(&raw)?, raw }))
            .collect()
    }

    async fn done(&self, task: &Dequeued) -> Result<(), QueueError> {
        self.with_queue(&task.message.queue, |q| remove_active(q, &task.raw));
        Ok(())
    }

    async fn retry(&self, task: &Dequeued, at: DateTime<Utc>, error: &str) -> Result<(), QueueError> {
        let next = failed_copy(&task.message, error, true).encode()?;
        self.with_queue(&task.message.queue, |q| {
            remove_active(q, &task.raw);
            q.retry.push((at.timestamp(), next));
        });
        Ok(())
    }

    async fn archive(&self, task: &Dequeued, error: &str) -> Result<(), QueueError> {
        let archived = failed_copy(&task.message, error, false).encode()?;
        self.with_queue(&task.message.queue, |q| {
            remove_active(q, &task.raw);
            q.archived.push(archived);
        });
        Ok(())
    }

    async fn forward(&self, queue: &str, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let now = now.timestamp();
        Ok(self.with_queue(queue, |q| {
            let mut moved = 0;
            for set in [&mut q.scheduled, &mut q.retry] {
                let (due, later): (Vec<_>, Vec<_>) = set.drain(..).partition(|(at, _)| *at <= now);
                *set = later;
                for (_, raw) in due {
                    q.pending.push_front(raw);
                    moved += 1;
                }
            }
            moved
        }))
    }
}
