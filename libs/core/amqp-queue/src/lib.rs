//! RabbitMQ adapter for the messaging core.
//!
//! Each subscription owns one channel and one consumer, registered per queue
//! so shutdown can cancel and close them in order:
//!
//! ```text
//! subscribe("orders") ─┬─ channel #1 ── consumer "orders_1" ── handler
//!                      ├─ channel #2 ── consumer "orders_2" ── handler
//!                      └─ ...
//! ```
//!
//! Failed deliveries are always requeued; there is no redelivery counter at
//! this layer. Applications that need bounded retries should count attempts
//! in a header from their own middleware.
//!
//! # Example
//!
//! ```ignore
//! use amqp_queue::{AmqpConfig, AmqpConnection, AmqpSubscribeConfig};
//! use messaging::{handler_fn, SubscribeOptions};
//!
//! let conn = AmqpConnection::connect(AmqpConfig::from_env()?).await?;
//! conn.subscribe_replicated(
//!     "emails",
//!     SubscribeOptions::new(AmqpSubscribeConfig::declared()).with_concurrency(4),
//!     handler_fn(|ctx, msg| async move {
//!         tracing::info!(cid = %ctx.cid, "sending {}", msg.body_str());
//!         Ok(())
//!     }),
//! )
//! .await?;
//! ```

mod config;
mod connection;
mod processor;
mod registry;
mod wire;

pub use config::{AmqpConfig, AmqpSubscribeConfig};
pub use connection::{AmqpConnection, DEFAULT_REPLICAS};
pub use processor::{Acknowledger, DeliveryHandler};
pub use registry::{ChannelRegistry, Registered};
pub use wire::{header_from_table, header_to_table, message_from_parts, publish_properties};
