//! Error types shared by every queue adapter.

use std::fmt;
use thiserror::Error;

/// A panic recovered from a handler.
///
/// The payload is rendered to a string (`&str` and `String` payloads are kept
/// verbatim) and the backtrace is captured at the recovery point.
#[derive(Debug, Clone, Error)]
#[error("panic in queue handler: {message}")]
pub struct PanicError {
    pub message: String,
    pub backtrace: String,
}

impl PanicError {
    pub fn new(message: impl Into<String>, backtrace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            backtrace: backtrace.into(),
        }
    }
}

/// Error returned by application handlers.
///
/// Any `Err` drives a negative acknowledgment; the adapter decides whether that
/// means an immediate nak, a delayed nak or a requeue.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler ran and reported a failure.
    #[error("handler failed: {message}")]
    Failed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The handler panicked and the recovery middleware converted it.
    #[error(transparent)]
    Panic(#[from] PanicError),
}

impl HandlerError {
    /// Create a failure without an underlying cause.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a failure wrapping an underlying cause.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Failed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, HandlerError::Panic(_))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_source("invalid message payload", error)
    }
}

/// Body (de)compression failure. The message carrying it is dropped.
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("unsupported compression type: {0} (expected none, gzip or zstd)")]
    Unsupported(String),

    #[error("failed to {operation} {algorithm} body: {source}")]
    Corrupt {
        algorithm: &'static str,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level error taxonomy for queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Broker unreachable at construction time.
    #[error("connection error: {0}")]
    Connection(String),

    /// Subscription could not be started.
    #[error("failed to subscribe to {topic}: {message}")]
    Subscribe { topic: String, message: String },

    /// Message could not be published.
    #[error("failed to publish to {topic}: {message}")]
    Publish { topic: String, message: String },

    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// Teardown failure (only the drain/close step is reported).
    #[error("shutdown error: {0}")]
    Shutdown(String),

    #[error(transparent)]
    Compression(#[from] CompressionError),

    /// `use_middleware` called with a full stack.
    #[error("middleware limit of {limit} reached")]
    MiddlewareLimit { limit: usize },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    pub fn connection(error: impl fmt::Display) -> Self {
        Self::Connection(error.to_string())
    }

    pub fn subscribe(topic: impl Into<String>, error: impl fmt::Display) -> Self {
        Self::Subscribe {
            topic: topic.into(),
            message: error.to_string(),
        }
    }

    pub fn publish(topic: impl Into<String>, error: impl fmt::Display) -> Self {
        Self::Publish {
            topic: topic.into(),
            message: error.to_string(),
        }
    }

    pub fn shutdown(error: impl fmt::Display) -> Self {
        Self::Shutdown(error.to_string())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Short, stable label used in metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueError::Connection(_) => "connection",
            QueueError::Subscribe { .. } => "subscribe",
            QueueError::Publish { .. } => "publish",
            QueueError::Handler(_) => "handler",
            QueueError::Shutdown(_) => "shutdown",
            QueueError::Compression(_) => "compression",
            QueueError::MiddlewareLimit { .. } => "middleware_limit",
            QueueError::Timeout(_) => "timeout",
            QueueError::Config(_) => "config",
            QueueError::Serialization(_) => "serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_from_panic() {
        let err: HandlerError = PanicError::new("boom", "").into();
        assert!(err.is_panic());
        assert_eq!(err.to_string(), "panic in queue handler: boom");
    }

    #[test]
    fn test_handler_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = HandlerError::with_source("write failed", io);
        assert!(!err.is_panic());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_queue_error_constructors() {
        let err = QueueError::subscribe("orders", "stream not found");
        assert_eq!(
            err.to_string(),
            "failed to subscribe to orders: stream not found"
        );
        assert_eq!(err.kind(), "subscribe");

        let err = QueueError::MiddlewareLimit { limit: 10 };
        assert_eq!(err.kind(), "middleware_limit");
        assert!(err.to_string().contains("10"));
    }

    #[test]
    fn test_compression_error_converts() {
        let err: QueueError = CompressionError::Unsupported("lz4".to_string()).into();
        assert_eq!(err.kind(), "compression");
        assert!(err.to_string().contains("lz4"));
    }
}
