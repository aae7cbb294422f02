//! Publish acknowledgements.

use messaging::QueueError;
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;

/// Broker acknowledgement of a stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
    /// The server already had a message with the same `Nats-Msg-Id`.
    pub duplicate: bool,
}

impl From<async_nats::jetstream::publish::PublishAck> for PublishAck {
    fn from(ack: async_nats::jetstream::publish::PublishAck) -> Self {
        Self {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        }
    }
}

/// Pending acknowledgement of an asynchronous publish.
///
/// The acknowledgement is collected in the background whether or not the
/// future is awaited.
#[derive(Debug)]
pub struct PublishFuture {
    topic: String,
    rx: oneshot::Receiver<Result<PublishAck, QueueError>>,
}

impl PublishFuture {
    pub(crate) fn spawn<F>(topic: &str, ack: F) -> Self
    where
        F: Future<Output = Result<PublishAck, QueueError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(ack.await);
        });
        Self {
            topic: topic.to_string(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the acknowledgement, at most `timeout`.
    pub async fn wait(self, timeout: Duration) -> Result<PublishAck, QueueError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(QueueError::publish(&self.topic, "acknowledgement task dropped")),
            Err(_) => Err(QueueError::timeout(format!(
                "no publish acknowledgement for {} within {:?}",
                self.topic, timeout
            ))),
        }
    }

    /// The result if it already arrived, without waiting.
    pub fn try_result(&mut self) -> Option<Result<PublishAck, QueueError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(QueueError::publish(
                &self.topic,
                "acknowledgement already taken or dropped",
            ))),
        }
    }
}
