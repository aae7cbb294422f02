//! Inbound deliveries and NATS header mapping.

use async_nats::jetstream::AckKind;
use async_nats::HeaderMap;
use async_trait::async_trait;
use messaging::{keys, Header, Message, QueueError};
use std::time::Duration;

/// One inbound message together with the means to settle it.
#[async_trait]
pub trait Delivery: Send + Sync + 'static {
    fn subject(&self) -> &str;

    fn headers(&self) -> Header;

    fn payload(&self) -> Vec<u8>;

    /// Delivery attempt (1 on first delivery), `None` when the metadata is
    /// unavailable.
    fn attempt(&self) -> Option<u64>;

    async fn ack(&self) -> Result<(), QueueError>;

    async fn nak(&self, delay: Option<Duration>) -> Result<(), QueueError>;

    /// Settle without redelivery.
    async fn term(&self) -> Result<(), QueueError>;

    fn to_message(&self) -> Message {
        let mut message = Message::new(self.payload())
            .with_topic(self.subject())
            .with_headers(self.headers());
        let id = message.headers.get(keys::MESSAGE_ID);
        if !id.is_empty() {
            message.id = Some(id);
        }
        message
    }
}

/// Inbound NATS headers are always strings; the first value wins.
pub fn header_from_nats(headers: Option<&HeaderMap>) -> Header {
    let mut header = Header::new();
    if let Some(headers) = headers {
        for (name, values) in headers.iter() {
            if let Some(value) = values.first() {
                header.add(name.to_string(), value.as_str());
            }
        }
    }
    header
}

pub fn header_to_nats(header: &Header) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (key, value) in header {
        headers.insert(key.as_str(), value.to_wire_string().as_str());
    }
    headers
}

fn settle_error(subject: &str, action: &str, e: impl std::fmt::Display) -> QueueError {
    QueueError::subscribe(subject, format!("failed to {action} message: {e}"))
}

#[async_trait]
impl Delivery for async_nats::jetstream::Message {
    fn subject(&self) -> &str {
        self.message.subject.as_str()
    }

    fn headers(&self) -> Header {
        header_from_nats(self.message.headers.as_ref())
    }

    fn payload(&self) -> Vec<u8> {
        self.message.payload.to_vec()
    }

    fn attempt(&self) -> Option<u64> {
        self.info().ok().map(|info| info.delivered.max(1) as u64)
    }

    async fn ack(&self) -> Result<(), QueueError> {
        async_nats::jetstream::Message::ack(self)
            .await
            .map_err(|e| settle_error(Delivery::subject(self), "ack", e))
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), QueueError> {
        self.ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| settle_error(Delivery::subject(self), "nak", e))
    }

    async fn term(&self) -> Result<(), QueueError> {
        self.ack_with(AckKind::Term)
            .await
            .map_err(|e| settle_error(Delivery::subject(self), "term", e))
    }
}

/// A core NATS message. Settling answers on the reply subject, if any.
pub struct CoreDelivery {
    client: async_nats::Client,
    message: async_nats::Message,
}

impl CoreDelivery {
    pub fn new(client: async_nats::Client, message: async_nats::Message) -> Self {
        Self { client, message }
    }

    async fn reply(&self, body: &'static str, action: &str) -> Result<(), QueueError> {
        let Some(reply) = self.message.reply.clone() else {
            return Ok(());
        };
        self.client
            .publish(reply, body.into())
            .await
            .map_err(|e| settle_error(self.subject(), action, e))
    }
}

#[async_trait]
impl Delivery for CoreDelivery {
    fn subject(&self) -> &str {
        self.message.subject.as_str()
    }

    fn headers(&self) -> Header {
        header_from_nats(self.message.headers.as_ref())
    }

    fn payload(&self) -> Vec<u8> {
        self.message.payload.to_vec()
    }

    fn attempt(&self) -> Option<u64> {
        Some(1)
    }

    async fn ack(&self) -> Result<(), QueueError> {
        self.reply("+ACK", "ack").await
    }

    async fn nak(&self, _delay: Option<Duration>) -> Result<(), QueueError> {
        self.reply("-NAK", "nak").await
    }

    async fn term(&self) -> Result<(), QueueError> {
        self.reply("+TERM", "term").await
    }
}
