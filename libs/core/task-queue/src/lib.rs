//! Redis-backed task queue for the `messaging` core.
//!
//! ```text
//! ┌────────────┐ enqueue  ┌──────────────────────┐ LMOVE ┌────────────────┐
//! │ TaskClient │─────────▶│ tq:{queue}:pending   │──────▶│  TaskServer    │
//! └────────────┘          └──────────────────────┘       │  (N permits)   │
//!       ▲   process_at          ▲        ▲               └───────┬────────┘
//!       │   in the future       │forward │forward        done /  │ retry / archive
//! ┌─────┴────────┐       ┌──────┴─────┐ ┌┴────────────┐          │
//! │TaskScheduler │       │ scheduled  │ │   retry     │◀─────────┘
//! │   (cron)     │       └────────────┘ └─────────────┘
//! └──────────────┘
//! ```
//!
//! Queues are polled by smooth weighted round-robin over the configured
//! weights (`critical:6, default:3, low:1` by default). Each task runs under
//! its own deadline. A failed task is retried with exponential backoff until
//! `max_retry` is used up, then archived. Tasks with no registered handler
//! are archived straight away.
//!
//! A dequeued task is leased for `lease_duration` and the lease is renewed
//! while its handler runs. When a worker dies mid-task the lease runs out and
//! the forwarder of any server on the same Redis retries the task.
//!
//! # Example
//!
//! ```rust,ignore
//! use task_queue::{build_task, TaskConfig, TaskConnection, TaskOptions};
//! use messaging::handler_fn;
//! use std::time::Duration;
//!
//! let tasks = TaskConnection::connect(TaskConfig::from_env()?).await?;
//!
//! tasks.server().handle("email:welcome", handler_fn(|ctx, msg| async move {
//!     tracing::info!(cid = %ctx.cid, "welcome {}", msg.body_str());
//!     Ok(())
//! }))?;
//!
//! let scheduler = tasks.new_scheduler().await?;
//! scheduler.register("0 0 3 * * *", build_task("report:nightly", Vec::new(), None)).await?;
//!
//! tasks.run().await?;
//!
//! let later = TaskOptions::new().queue("low").process_in(Duration::from_secs(300));
//! tasks.client().enqueue(&build_task("email:welcome", "u-42", Some(later))).await?;
//!
//! tasks.shutdown().await?;
//! ```

mod client;
mod config;
mod connection;
pub mod keys;
mod priority;
mod scheduler;
mod server;
mod store;
mod task;

#[cfg(test)]
mod memory;

pub use client::TaskClient;
pub use config::{default_queues, parse_queues, TaskConfig, TaskSubscribeConfig};
pub use connection::TaskConnection;
pub use priority::WeightedRoundRobin;
pub use scheduler::{ScheduleEntry, TaskScheduler};
pub use server::{failure_action, FailureAction, TaskServer};
pub use store::{Dequeued, RedisStore, TaskStore};
pub use task::{
    build_task, typed_handler, Task, TaskInfo, TaskMessage, TaskOptions, TaskState, TypedTask,
    BUILD_TASK_MAX_RETRY, DEFAULT_MAX_RETRY, DEFAULT_QUEUE, DEFAULT_TIMEOUT,
};
