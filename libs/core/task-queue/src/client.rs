//! Enqueues tasks for immediate or delayed processing.

use crate::store::TaskStore;
use crate::task::{build_task, Task, TaskInfo, TaskState, TypedTask};
use chrono::Utc;
use messaging::{
    prepare_publish, Message, QueueError, QueueLogger, QueueMetrics, RequestContext,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const BROKER: &str = "task";

pub struct TaskClient {
    store: Arc<dyn TaskStore>,
    logger: Arc<dyn QueueLogger>,
    closed: AtomicBool,
}

impl TaskClient {
    pub fn new(store: Arc<dyn TaskStore>, logger: Arc<dyn QueueLogger>) -> Self {
        Self {
            store,
            logger,
            closed: AtomicBool::new(false),
        }
    }

    /// Store the task as pending, or as scheduled when `process_at` is in
    /// the future.
    pub async fn enqueue(&self, task: &Task) -> Result<TaskInfo, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::publish(&task.type_name, "task client is closed"));
        }

        let message = task.to_message();
        let now = Utc::now();
        let (state, process_at) = match task.options.process_at {
            Some(at) if at > now => {
                self.store
                    .schedule(&message, at)
                    .await
                    .map_err(|e| self.enqueue_failed(task, e))?;
                (TaskState::Scheduled, at)
            }
            _ => {
                self.store
                    .enqueue(&message)
                    .await
                    .map_err(|e| self.enqueue_failed(task, e))?;
                (TaskState::Pending, now)
            }
        };

        QueueMetrics::new(BROKER, &task.type_name).message_published();
        Ok(TaskInfo {
            id: message.id,
            queue: message.queue,
            type_name: message.type_name,
            state,
            max_retry: message.max_retry,
            process_at,
        })
    }

    pub async fn enqueue_typed<T: TypedTask>(&self, payload: &T) -> Result<TaskInfo, QueueError> {
        self.enqueue(&payload.to_task()?).await
    }

    /// Enqueue an envelope as a task of type `type_name`, carrying the
    /// request context in the task headers.
    pub async fn enqueue_message(
        &self,
        ctx: &RequestContext,
        type_name: &str,
        mut message: Message,
    ) -> Result<TaskInfo, QueueError> {
        prepare_publish(ctx, &mut message)?;
        let mut task = build_task(type_name, message.body, None);
        if !message.no_header {
            task.headers = message.headers;
        }
        if let Some(id) = message.id.filter(|id| !id.is_empty()) {
            task.options.task_id = Some(id);
        }
        self.enqueue(&task).await
    }

    /// Reject further enqueues.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.logger.info("Task client closed", &[]);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn enqueue_failed(&self, task: &Task, e: QueueError) -> QueueError {
        self.logger
            .error("Failed to enqueue task", Some(&e), &[("type", &task.type_name)]);
        QueueError::publish(&task.type_name, format!("failed to enqueue task: {e}"))
    }
}
