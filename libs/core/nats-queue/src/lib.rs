//! NATS JetStream adapter for the `messaging` core.
//!
//! ```text
//! ┌────────────┐ publish ┌────────────────────┐  pull  ┌──────────────┐
//! │  Producer  │────────▶│  JetStream stream  │───────▶│ worker group │
//! └────────────┘         │ (durable consumer) │        │  middleware  │
//!                        └────────────────────┘        │   handler    │
//!                                  ▲   ack / nak(delay) └──────────────┘
//!                                  └───────────────────────────┘
//! ```
//!
//! Three delivery shapes share the same per-message pipeline:
//!
//! - [`NatsConnection::subscribe`]: `concurrency` consume loops, each with
//!   its own pull stream
//! - [`NatsConnection::subscribe_messages`]: one pull cursor shared by a
//!   bounded worker group
//! - [`NatsConnection::subscribe_subject`]: plain core-NATS subscription
//!
//! Failed messages are nacked; the first failure is redelivered
//! immediately, later ones after the configured `redelivery_backoff`. The
//! broker enforces `max_deliver`.
//!
//! # Example
//!
//! ```rust,ignore
//! use messaging::{handler_fn, Message, RequestContext, SubscribeOptions};
//! use nats_queue::{JetStreamSubscribeConfig, NatsConfig, NatsConnection, TopicConfig};
//!
//! let config = NatsConfig::from_env()?.with_topic(TopicConfig::new("ORDERS", ["orders.>"]));
//! let nats = NatsConnection::connect(config).await?;
//!
//! nats.subscribe(
//!     "ORDERS",
//!     SubscribeOptions::new(JetStreamSubscribeConfig::durable("billing")).with_concurrency(4),
//!     handler_fn(|ctx, msg| async move {
//!         tracing::info!(cid = %ctx.cid, subject = %msg.topic, "order event");
//!         Ok(())
//!     }),
//! )
//! .await?;
//!
//! nats.publish(&RequestContext::default(), "orders.created", Message::new(body)).await?;
//! nats.shutdown().await?;
//! ```

mod config;
mod connection;
mod delivery;
mod pool;
mod processor;
mod provision;
mod publish;
mod subscription;

#[cfg(test)]
mod fake;

pub use config::{
    JetStreamSubscribeConfig, NatsConfig, RetentionKind, StorageKind, SubjectSubscribeConfig,
    TopicConfig,
};
pub use connection::NatsConnection;
pub use delivery::{header_from_nats, header_to_nats, CoreDelivery, Delivery};
pub use processor::{nack_delay, DeliveryHandler};
pub use publish::{PublishAck, PublishFuture};
pub use subscription::{SubscriptionKind, SubscriptionState, SubscriptionStatus};
