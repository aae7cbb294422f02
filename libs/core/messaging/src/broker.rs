//! The contract every broker adapter fulfils.

use crate::config::SubscribeOptions;
use crate::context::RequestContext;
use crate::envelope::Message;
use crate::error::QueueError;
use crate::middleware::{HandlerFunc, Middleware};
use async_trait::async_trait;

/// A connected broker adapter.
///
/// Subscriptions compose the handler with the middleware snapshot taken at
/// subscribe time. Publishing encodes the request context into headers
/// unless the message opted out.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Adapter-specific subscription settings.
    type SubscribeConfig: Send + 'static;

    /// What a successful publish returns.
    type PublishReceipt: Send;

    async fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions<Self::SubscribeConfig>,
        handler: HandlerFunc,
    ) -> Result<(), QueueError>;

    async fn publish(
        &self,
        ctx: &RequestContext,
        topic: &str,
        message: Message,
    ) -> Result<Self::PublishReceipt, QueueError>;

    /// Stop consuming and release the connection. Calling it again is a no-op.
    async fn shutdown(&self) -> Result<(), QueueError>;

    fn use_middleware(&self, middleware: Middleware) -> Result<(), QueueError>;

    fn middlewares(&self) -> Vec<Middleware>;
}
