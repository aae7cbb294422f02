//! Task definitions and their stored form.

use chrono::{DateTime, Utc};
use messaging::{Header, HandlerError, HandlerFunc, Message, QueueError, RequestContext};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_QUEUE: &str = "default";

/// Retries granted when options are given without `max_retry`.
pub const DEFAULT_MAX_RETRY: u32 = 25;

/// Retries granted by [`build_task`] when no options are given.
pub const BUILD_TASK_MAX_RETRY: u32 = 3;

/// Deadline applied by [`build_task`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-task enqueue options. Unset fields fall back to defaults when the
/// task is stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOptions {
    pub queue: Option<String>,
    pub max_retry: Option<u32>,
    pub timeout: Option<Duration>,
    /// Process at or after this time instead of immediately.
    pub process_at: Option<DateTime<Utc>>,
    /// Explicit id; a fresh UUID otherwise.
    pub task_id: Option<String>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.process_at = Some(at);
        self
    }

    /// Process after `delay` from now.
    pub fn process_in(self, delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.process_at(at)
    }

    pub fn task_id(mut self, id: impl Into<String>) -> Self {
        self.task_id = Some(id.into());
        self
    }

    pub fn queue_name(&self) -> &str {
        self.queue.as_deref().unwrap_or(DEFAULT_QUEUE)
    }
}

/// A unit of work: a type name routed to a handler plus an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub type_name: String,
    pub payload: Vec<u8>,
    pub headers: Header,
    pub options: TaskOptions,
}

impl Task {
    pub fn new(type_name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            type_name: type_name.into(),
            payload: payload.into(),
            headers: Header::new(),
            options: TaskOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_headers(mut self, headers: Header) -> Self {
        self.headers = headers;
        self
    }

    /// The stored form, with a fresh id unless one was given.
    pub fn to_message(&self) -> TaskMessage {
        TaskMessage {
            id: self
                .options
                .task_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            type_name: self.type_name.clone(),
            payload: self.payload.clone(),
            headers: self.headers.clone(),
            queue: self.options.queue_name().to_string(),
            retried: 0,
            max_retry: self.options.max_retry.unwrap_or(DEFAULT_MAX_RETRY),
            timeout_ms: self
                .options
                .timeout
                .map_or(0, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX).max(1)),
            error_msg: None,
        }
    }
}

/// Build a task with a 60 second deadline. Without options it may be
/// retried three times.
pub fn build_task(type_name: &str, payload: impl Into<Vec<u8>>, options: Option<TaskOptions>) -> Task {
    let options = match options {
        Some(options) => TaskOptions {
            timeout: options.timeout.or(Some(DEFAULT_TIMEOUT)),
            ..options
        },
        None => TaskOptions {
            timeout: Some(DEFAULT_TIMEOUT),
            max_retry: Some(BUILD_TASK_MAX_RETRY),
            ..Default::default()
        },
    };
    Task::new(type_name, payload).with_options(options)
}

/// A task as stored in Redis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub headers: Header,
    pub queue: String,
    #[serde(default)]
    pub retried: u32,
    pub max_retry: u32,
    /// Zero means no deadline.
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl TaskMessage {
    pub fn encode(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, QueueError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    /// The envelope handed to handlers.
    pub fn to_envelope(&self) -> Message {
        Message::new(self.payload.clone())
            .with_id(self.id.clone())
            .with_topic(self.type_name.clone())
            .with_headers(self.headers.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Scheduled,
    Active,
    Retry,
    Archived,
    Completed,
}

/// What `enqueue` reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: String,
    pub queue: String,
    pub type_name: String,
    pub state: TaskState,
    pub max_retry: u32,
    pub process_at: DateTime<Utc>,
}

/// A task whose payload is a serde type.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct WelcomeEmail { user_id: String }
///
/// impl TypedTask for WelcomeEmail {
///     const TASK_TYPE: &'static str = "email:welcome";
/// }
///
/// client.enqueue_typed(&WelcomeEmail { user_id }).await?;
/// server.handle(WelcomeEmail::TASK_TYPE, typed_handler(|ctx, email: WelcomeEmail| async move {
///     send(email.user_id).await
/// }))?;
/// ```
pub trait TypedTask: Serialize + DeserializeOwned + Send + 'static {
    const TASK_TYPE: &'static str;

    /// Enqueue options; `None` gets [`build_task`] defaults.
    fn options(&self) -> Option<TaskOptions> {
        None
    }

    fn to_task(&self) -> Result<Task, QueueError> {
        Ok(build_task(
            Self::TASK_TYPE,
            serde_json::to_vec(self)?,
            self.options(),
        ))
    }
}

/// Handler that decodes the JSON payload before calling `f`.
pub fn typed_handler<T, F, Fut>(f: F) -> HandlerFunc
where
    T: TypedTask,
    F: Fn(RequestContext, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    let f = Arc::new(f);
    messaging::handler_fn(move |ctx, message: Message| {
        let f = f.clone();
        async move {
            let payload: T = serde_json::from_slice(&message.body)?;
            f(ctx, payload).await
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Welcome {
        user_id: String,
    }

    impl TypedTask for Welcome {
        const TASK_TYPE: &'static str = "email:welcome";
    }

    #[test]
    fn test_build_task_defaults() {
        let task = build_task("email:send", b"{}".to_vec(), None);
        assert_eq!(task.options.timeout, Some(Duration::from_secs(60)));
        assert_eq!(task.options.max_retry, Some(3));
        assert_eq!(task.options.queue_name(), "default");
    }

    #[test]
    fn test_build_task_with_options_keeps_deadline_only() {
        let task = build_task("email:send", Vec::new(), Some(TaskOptions::new().queue("critical")));
        assert_eq!(task.options.timeout, Some(Duration::from_secs(60)));
        assert_eq!(task.options.max_retry, None);
        assert_eq!(task.to_message().max_retry, DEFAULT_MAX_RETRY);

        let task = build_task(
            "email:send",
            Vec::new(),
            Some(TaskOptions::new().timeout(Duration::from_secs(5)).max_retry(1)),
        );
        assert_eq!(task.options.timeout, Some(Duration::from_secs(5)));
        assert_eq!(task.to_message().max_retry, 1);
    }

    #[test]
    fn test_task_message_encoding() {
        let mut headers = Header::new();
        headers.set("x-request-id", "cid-1");
        let task = build_task("report:build", b"payload".to_vec(), None)
            .with_headers(headers)
            .with_options(TaskOptions::new().task_id("task-1").timeout(Duration::from_secs(30)));

        let message = task.to_message();
        assert_eq!(message.id, "task-1");
        assert_eq!(message.queue, "default");
        assert_eq!(message.timeout(), Some(Duration::from_secs(30)));

        let raw = message.encode().unwrap();
        assert!(raw.contains("\"type\":\"report:build\""));
        assert!(!raw.contains("error_msg"));
        assert_eq!(TaskMessage::decode(&raw).unwrap(), message);

        let envelope = message.to_envelope();
        assert_eq!(envelope.topic, "report:build");
        assert_eq!(envelope.id.as_deref(), Some("task-1"));
        assert_eq!(envelope.headers.get("x-request-id"), "cid-1");
    }

    #[test]
    fn test_sub_second_deadline_is_kept() {
        let task = build_task(
            "thumbnail",
            Vec::new(),
            Some(TaskOptions::new().timeout(Duration::from_millis(500))),
        );
        let message = task.to_message();
        assert_eq!(message.timeout_ms, 500);
        assert_eq!(message.timeout(), Some(Duration::from_millis(500)));

        let tiny = Task::new("a", Vec::new())
            .with_options(TaskOptions::new().timeout(Duration::from_micros(10)))
            .to_message();
        assert_eq!(tiny.timeout(), Some(Duration::from_millis(1)));
    }

    #[test]
    fn test_fresh_ids_per_message() {
        let task = Task::new("a", Vec::new());
        assert_ne!(task.to_message().id, task.to_message().id);
        assert_eq!(task.to_message().timeout(), None);
    }

    #[tokio::test]
    async fn test_typed_task_roundtrip() {
        let task = Welcome {
            user_id: "u-1".to_string(),
        }
        .to_task()
        .unwrap();
        assert_eq!(task.type_name, "email:welcome");
        assert_eq!(task.options.max_retry, Some(3));

        let handler = typed_handler(|_, welcome: Welcome| async move {
            assert_eq!(welcome.user_id, "u-1");
            Ok(())
        });
        let message = task.to_message().to_envelope();
        handler(RequestContext::default(), message).await.unwrap();

        let err = handler(RequestContext::default(), Message::new("not json"))
            .await
            .unwrap_err();
        assert!(!err.is_panic());
    }

    #[test]
    fn test_process_in_is_in_future() {
        let options = TaskOptions::new().process_in(Duration::from_secs(60));
        assert!(options.process_at.unwrap() > Utc::now());
    }
}
