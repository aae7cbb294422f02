//! Handler and middleware composition.

use crate::context::RequestContext;
use crate::envelope::Message;
use crate::error::{HandlerError, QueueError};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, RwLock};

/// Maximum number of middlewares a connection accepts.
pub const MAX_MIDDLEWARES: usize = 10;

pub type HandlerResult = Result<(), HandlerError>;

/// Message handler. `Ok(())` acknowledges the message, `Err` rejects it.
pub type HandlerFunc =
    Arc<dyn Fn(RequestContext, Message) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wraps a handler into another handler.
pub type Middleware = Arc<dyn Fn(HandlerFunc) -> HandlerFunc + Send + Sync>;

/// Build a [`HandlerFunc`] from an async closure.
///
/// ```rust,ignore
/// let handler = handler_fn(|ctx, msg| async move {
///     tracing::info!(cid = %ctx.cid, topic = %msg.topic, "got message");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFunc
where
    F: Fn(RequestContext, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |ctx, msg| Box::pin(f(ctx, msg)))
}

/// Build a [`Middleware`] from a closure over the next handler.
pub fn middleware_fn<F>(f: F) -> Middleware
where
    F: Fn(HandlerFunc) -> HandlerFunc + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap `handler` so that `middlewares[0]` runs first (outermost).
pub fn chain_middlewares(handler: HandlerFunc, middlewares: &[Middleware]) -> HandlerFunc {
    middlewares
        .iter()
        .rev()
        .fold(handler, |next, middleware| middleware(next))
}

/// Ordered middleware list owned by a connection.
///
/// Subscriptions take a [`snapshot`](Self::snapshot) when they start, so
/// middlewares added later only apply to later subscriptions.
#[derive(Default)]
pub struct MiddlewareStack {
    middlewares: RwLock<Vec<Middleware>>,
}

impl MiddlewareStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware.
    ///
    /// Fails with [`QueueError::MiddlewareLimit`] once [`MAX_MIDDLEWARES`] are
    /// registered; the stack is left unchanged.
    pub fn use_middleware(&self, middleware: Middleware) -> Result<(), QueueError> {
        let mut guard = self
            .middlewares
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if guard.len() >= MAX_MIDDLEWARES {
            return Err(QueueError::MiddlewareLimit {
                limit: MAX_MIDDLEWARES,
            });
        }
        guard.push(middleware);
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<Middleware> {
        self.middlewares
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.middlewares
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compose `handler` with the current snapshot, preceded by the panic
    /// recovery middleware unless `no_recovery` is set.
    pub fn apply(&self, handler: HandlerFunc, no_recovery: bool) -> HandlerFunc {
        let mut chain = Vec::with_capacity(MAX_MIDDLEWARES + 1);
        if !no_recovery {
            chain.push(crate::recover::recover_middleware());
        }
        chain.extend(self.snapshot());
        chain_middlewares(handler, &chain)
    }
}
