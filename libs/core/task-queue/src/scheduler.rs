//! Cron-driven periodic enqueueing.

use crate::client::TaskClient;
use crate::task::Task;
use messaging::{QueueError, QueueLogger};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::debug;
use uuid::Uuid;

/// A registered periodic task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub id: String,
    pub cron_spec: String,
    pub type_name: String,
}

/// Enqueues tasks on cron schedules through a [`TaskClient`].
///
/// Specs are evaluated in UTC and carry a leading seconds field:
/// `"0 */5 * * * *"` fires every five minutes.
pub struct TaskScheduler {
    scheduler: JobScheduler,
    client: Arc<TaskClient>,
    logger: Arc<dyn QueueLogger>,
    entries: Mutex<BTreeMap<String, ScheduleEntry>>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl TaskScheduler {
    pub async fn new(client: Arc<TaskClient>, logger: Arc<dyn QueueLogger>) -> Result<Self, QueueError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| QueueError::config(format!("failed to create task scheduler: {e}")))?;
        Ok(Self {
            scheduler,
            client,
            logger,
            entries: Mutex::new(BTreeMap::new()),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Enqueue `task` on every tick of `cron_spec`. Returns the entry id.
    pub async fn register(&self, cron_spec: &str, task: Task) -> Result<String, QueueError> {
        let client = self.client.clone();
        let logger = self.logger.clone();
        let type_name = task.type_name.clone();

        let job = Job::new_async(cron_spec, move |_id, _scheduler| {
            let client = client.clone();
            let logger = logger.clone();
            let task = task.clone();
            Box::pin(async move {
                match client.enqueue(&task).await {
                    Ok(info) => debug!(task_id = %info.id, task_type = %info.type_name, "Enqueued scheduled task"),
                    Err(e) => logger.error(
                        "Failed to enqueue scheduled task",
                        Some(&e),
                        &[("type", &task.type_name)],
                    ),
                }
            })
        })
        .map_err(|e| QueueError::config(format!("invalid cron spec '{cron_spec}': {e}")))?;

        let id = self
            .scheduler
            .add(job)
            .await
            .map_err(|e| QueueError::config(format!("failed to register '{cron_spec}': {e}")))?
            .to_string();

        self.logger.info(
            "Registered scheduled task",
            &[("entry_id", &id), ("cron", &cron_spec), ("type", &type_name)],
        );
        self.lock_entries().insert(
            id.clone(),
            ScheduleEntry {
                id: id.clone(),
                cron_spec: cron_spec.to_string(),
                type_name,
            },
        );
        Ok(id)
    }

    pub async fn unregister(&self, entry_id: &str) -> Result<(), QueueError> {
        if !self.lock_entries().contains_key(entry_id) {
            return Err(QueueError::config(format!("no scheduled entry with id {entry_id}")));
        }
        let uuid = Uuid::parse_str(entry_id)
            .map_err(|e| QueueError::config(format!("invalid entry id {entry_id}: {e}")))?;

        self.scheduler
            .remove(&uuid)
            .await
            .map_err(|e| QueueError::config(format!("failed to unregister {entry_id}: {e}")))?;
        self.lock_entries().remove(entry_id);
        Ok(())
    }

    pub fn entries(&self) -> Vec<ScheduleEntry> {
        self.lock_entries().values().cloned().collect()
    }

    /// Start ticking. Calling it again is a no-op.
    pub async fn start(&self) -> Result<(), QueueError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(QueueError::shutdown("task scheduler has been shut down"));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.scheduler
            .start()
            .await
            .map_err(|e| QueueError::config(format!("failed to start task scheduler: {e}")))
    }

    /// Stop ticking. Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut scheduler = self.scheduler.clone();
        scheduler
            .shutdown()
            .await
            .map_err(|e| QueueError::shutdown(format!("failed to stop task scheduler: {e}")))?;
        self.logger.info("Task scheduler stopped", &[]);
        Ok(())
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ScheduleEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}
