//! Idempotent stream and consumer provisioning.

use crate::config::{JetStreamSubscribeConfig, TopicConfig};
use async_nats::jetstream::consumer::pull::Config as ConsumerConfig;
use async_nats::jetstream::consumer::{AckPolicy, Consumer};
use async_nats::jetstream::stream::Stream;
use async_nats::jetstream::Context;
use messaging::QueueError;
use tracing::{debug, info};

/// Fetch the stream, creating it when missing. A create that loses a race
/// with another process falls back to fetching.
pub async fn ensure_stream(jetstream: &Context, topic: &TopicConfig) -> Result<Stream, QueueError> {
    if let Ok(stream) = jetstream.get_stream(&topic.name).await {
        debug!(stream = %topic.name, "Stream already exists");
        return Ok(stream);
    }

    info!(stream = %topic.name, subjects = ?topic.subjects, "Creating stream");
    match jetstream.create_stream(topic.stream_config()).await {
        Ok(stream) => Ok(stream),
        Err(e) if e.to_string().contains("already") => {
            debug!(stream = %topic.name, "Stream created concurrently, fetching");
            jetstream
                .get_stream(&topic.name)
                .await
                .map_err(|e| QueueError::connection(format!("failed to get stream {}: {e}", topic.name)))
        }
        Err(e) => Err(QueueError::connection(format!(
            "failed to create jetstream stream {}: {e}",
            topic.name
        ))),
    }
}

pub(crate) fn consumer_config(topic: &str, config: &JetStreamSubscribeConfig) -> ConsumerConfig {
    let durable = config.durable_name_for(topic);
    ConsumerConfig {
        durable_name: Some(durable.clone()),
        name: Some(durable),
        ack_policy: AckPolicy::Explicit,
        ack_wait: config.ack_wait,
        max_deliver: config.max_deliver,
        filter_subject: config.filter_subject.clone(),
        max_ack_pending: config.max_ack_pending,
        ..Default::default()
    }
}

/// Get or create the durable pull consumer for `topic`.
pub async fn ensure_consumer(
    stream: &Stream,
    topic: &str,
    config: &JetStreamSubscribeConfig,
) -> Result<Consumer<ConsumerConfig>, QueueError> {
    let consumer_config = consumer_config(topic, config);
    let name = consumer_config.durable_name.clone().unwrap_or_default();

    stream
        .get_or_create_consumer(&name, consumer_config)
        .await
        .map_err(|e| QueueError::subscribe(topic, format!("failed to create consumer {name}: {e}")))
}
