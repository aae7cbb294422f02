//! Bookkeeping for active subscriptions so shutdown can stop them in order.

use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Delivery shape of a subscription. Shutdown stops them in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Shared pull cursor (`subscribe_messages`).
    Pull,
    /// Continuous consume loops (`subscribe`, `subscribe_consumer`).
    Push,
    /// Plain subject subscription.
    Subject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Created,
    Consuming,
    Draining,
    Stopped,
}

struct Subscription {
    id: u64,
    topic: String,
    kind: SubscriptionKind,
    state: SubscriptionState,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Snapshot of one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub topic: String,
    pub kind: SubscriptionKind,
    pub state: SubscriptionState,
    /// Workers that are still running.
    pub live_workers: usize,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<Vec<Subscription>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription in `Created` state and hand back its stop signal.
    pub async fn create(&self, topic: &str, kind: SubscriptionKind) -> (u64, watch::Receiver<bool>) {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (stop, stop_rx) = watch::channel(false);
        self.inner.lock().await.push(Subscription {
            id,
            topic: topic.to_string(),
            kind,
            state: SubscriptionState::Created,
            stop,
            tasks: Vec::new(),
        });
        (id, stop_rx)
    }

    /// Attach the running workers and move to `Consuming`.
    pub async fn start(&self, id: u64, tasks: Vec<JoinHandle<()>>) {
        let mut inner = self.inner.lock().await;
        if let Some(sub) = inner.iter_mut().find(|s| s.id == id) {
            sub.tasks.extend(tasks);
            sub.state = SubscriptionState::Consuming;
        }
    }

    /// Drop a subscription whose setup failed, stopping any workers it had.
    pub async fn discard(&self, id: u64, tasks: Vec<JoinHandle<()>>) {
        let mut inner = self.inner.lock().await;
        if let Some(pos) = inner.iter().position(|s| s.id == id) {
            let sub = inner.remove(pos);
            sub.stop.send_replace(true);
        }
        for task in tasks {
            task.abort();
        }
    }

    /// Stop every subscription of `kind`, waiting up to `grace` for its
    /// workers to finish their current message. Returns how many were stopped.
    pub async fn stop_kind(&self, kind: SubscriptionKind, grace: Duration) -> usize {
        let draining: Vec<(String, Vec<JoinHandle<()>>)> = {
            let mut inner = self.inner.lock().await;
            inner
                .iter_mut()
                .filter(|s| s.kind == kind && s.state != SubscriptionState::Stopped)
                .map(|s| {
                    s.state = SubscriptionState::Draining;
                    s.stop.send_replace(true);
                    (s.topic.clone(), std::mem::take(&mut s.tasks))
                })
                .collect()
        };

        let stopped = draining.len();
        for (topic, tasks) in draining {
            let wait = futures::future::join_all(tasks);
            if tokio::time::timeout(grace, wait).await.is_err() {
                warn!(topic = %topic, kind = ?kind, "Workers still busy after drain timeout, detaching");
            } else {
                debug!(topic = %topic, kind = ?kind, "Subscription drained");
            }
        }

        let mut inner = self.inner.lock().await;
        for sub in inner
            .iter_mut()
            .filter(|s| s.kind == kind && s.state == SubscriptionState::Draining)
        {
            sub.state = SubscriptionState::Stopped;
        }
        stopped
    }

    pub async fn statuses(&self) -> Vec<SubscriptionStatus> {
        self.inner
            .lock()
            .await
            .iter()
            .map(|s| SubscriptionStatus {
                topic: s.topic.clone(),
                kind: s.kind,
                state: s.state,
                live_workers: s.tasks.iter().filter(|t| !t.is_finished()).count(),
            })
            .collect()
    }
}
