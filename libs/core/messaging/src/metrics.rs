//! Queue metrics recorded through the `metrics` facade.
//!
//! No exporter is installed here; the host service decides where they go.

use metrics::{counter, histogram};
use std::time::Duration;

/// Per-subscription metric handle.
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    broker: &'static str,
    topic: String,
}

impl QueueMetrics {
    pub fn new(broker: &'static str, topic: &str) -> Self {
        Self {
            broker,
            topic: topic.to_string(),
        }
    }

    pub fn broker(&self) -> &'static str {
        self.broker
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn message_received(&self) {
        counter!(
            "queue_messages_received_total",
            "broker" => self.broker,
            "topic" => self.topic.clone()
        )
        .increment(1);
    }

    /// Record how long the handler chain took.
    pub fn handler_duration(&self, outcome: &'static str, duration: Duration) {
        histogram!(
            "queue_handler_duration_seconds",
            "broker" => self.broker,
            "topic" => self.topic.clone(),
            "outcome" => outcome
        )
        .record(duration.as_secs_f64());
    }

    pub fn message_acked(&self) {
        counter!(
            "queue_messages_acked_total",
            "broker" => self.broker,
            "topic" => self.topic.clone()
        )
        .increment(1);
    }

    pub fn message_nacked(&self, delayed: bool) {
        counter!(
            "queue_messages_nacked_total",
            "broker" => self.broker,
            "topic" => self.topic.clone(),
            "delayed" => if delayed { "true" } else { "false" }
        )
        .increment(1);
    }

    pub fn message_dropped(&self, reason: &'static str) {
        counter!(
            "queue_messages_dropped_total",
            "broker" => self.broker,
            "topic" => self.topic.clone(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn handler_panicked(&self) {
        counter!(
            "queue_handler_panics_total",
            "broker" => self.broker,
            "topic" => self.topic.clone()
        )
        .increment(1);
    }

    pub fn message_published(&self) {
        counter!(
            "queue_messages_published_total",
            "broker" => self.broker,
            "topic" => self.topic.clone()
        )
        .increment(1);
    }

    pub fn settle_failed(&self) {
        counter!(
            "queue_settle_failures_total",
            "broker" => self.broker,
            "topic" => self.topic.clone()
        )
        .increment(1);
    }
}
