//! Broker-agnostic message queue core.
//!
//! Every adapter (`nats-queue`, `amqp-queue`, `task-queue`) speaks in the
//! types defined here:
//!
//! - [`Message`] and [`Header`]: the envelope handed to handlers
//! - [`RequestContext`]: request metadata carried across brokers in headers
//! - [`HandlerFunc`] / [`Middleware`]: handler composition, capped at
//!   [`MAX_MIDDLEWARES`] per connection
//! - [`Compression`]: transparent body compression keyed by `x-compression`
//!   (`gzip` or `zstd`; `s2` from other producers is rejected)
//! - [`Dispatcher`]: the inbound pipeline (context, decompression, panic
//!   recovery, handler) shared by all adapters
//!
//! # Example
//!
//! ```ignore
//! use messaging::{handler_fn, middleware_fn, Broker, Message, RequestContext};
//!
//! let logging = middleware_fn(|next| {
//!     handler_fn(move |ctx, msg| {
//!         let next = next.clone();
//!         async move {
//!             tracing::info!(cid = %ctx.cid, topic = %msg.topic, "handling");
//!             next(ctx, msg).await
//!         }
//!     })
//! });
//! broker.use_middleware(logging)?;
//!
//! broker
//!     .publish(&RequestContext::default(), "orders.created", Message::new(body))
//!     .await?;
//! ```

mod broker;
mod compression;
mod config;
mod context;
mod dispatch;
mod envelope;
mod error;
mod logger;
mod metrics;
mod middleware;
mod recover;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use broker::Broker;
pub use compression::{compress, decompress, Compression};
pub use config::{BackoffStrategy, SubscribeOptions};
pub use context::{decode_context, encode_context, RequestContext, UserInfo};
pub use dispatch::{prepare_publish, Dispatch, Dispatcher};
pub use envelope::{keys, Header, HeaderValue, Message, RecoverFn};
pub use error::{CompressionError, HandlerError, PanicError, QueueError};
pub use logger::{Fields, QueueLogger, TracingLogger};
pub use metrics::QueueMetrics;
pub use middleware::{
    chain_middlewares, handler_fn, middleware_fn, HandlerFunc, HandlerResult, Middleware,
    MiddlewareStack, MAX_MIDDLEWARES,
};
pub use recover::{recover_middleware, HandlerOutcome};
