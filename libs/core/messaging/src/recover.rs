//! Panic recovery around handlers.

use crate::context::RequestContext;
use crate::envelope::Message;
use crate::error::{HandlerError, PanicError};
use crate::middleware::{middleware_fn, HandlerFunc, HandlerResult, Middleware};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Result of running a handler chain, as seen by the adapter's ack/nack logic.
#[derive(Debug)]
pub enum HandlerOutcome {
    Ok,
    Failed(HandlerError),
    Panicked(PanicError),
}

impl HandlerOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, HandlerOutcome::Ok)
    }

    pub fn label(&self) -> &'static str {
        match self {
            HandlerOutcome::Ok => "ok",
            HandlerOutcome::Failed(_) => "failed",
            HandlerOutcome::Panicked(_) => "panicked",
        }
    }
}

impl From<HandlerResult> for HandlerOutcome {
    fn from(result: HandlerResult) -> Self {
        match result {
            Ok(()) => HandlerOutcome::Ok,
            Err(HandlerError::Panic(panic)) => HandlerOutcome::Panicked(panic),
            Err(err) => HandlerOutcome::Failed(err),
        }
    }
}

/// Middleware that turns panics, raised either while building the handler
/// future or while polling it, into a failure result.
///
/// When the message carries a [`RecoverFn`](crate::RecoverFn) it decides the
/// failure; otherwise the result is `HandlerError::Panic`.
pub fn recover_middleware() -> Middleware {
    middleware_fn(|next: HandlerFunc| -> HandlerFunc {
        Arc::new(move |ctx: RequestContext, msg: Message| -> BoxFuture<'static, HandlerResult> {
            let next = next.clone();
            Box::pin(async move {
                let recover = msg.recover.clone();
                let panic_ctx = ctx.clone();

                let caught = match std::panic::catch_unwind(AssertUnwindSafe(|| next(ctx, msg))) {
                    Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                    Err(payload) => Err(payload),
                };

                match caught {
                    Ok(result) => result,
                    Err(payload) => {
                        let panic = PanicError::new(
                            panic_message(payload.as_ref()),
                            Backtrace::force_capture().to_string(),
                        );
                        match recover {
                            Some(recover) => Err(recover(&panic_ctx, &panic)),
                            None => Err(HandlerError::Panic(panic)),
                        }
                    }
                }
            })
        })
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{chain_middlewares, handler_fn};

    async fn explode(_: RequestContext, _: Message) -> HandlerResult {
        panic!("boom")
    }

    fn wrapped(handler: HandlerFunc) -> HandlerFunc {
        chain_middlewares(handler, &[recover_middleware()])
    }

    #[tokio::test]
    async fn test_panic_in_future_becomes_panicked_outcome() {
        let handler = wrapped(handler_fn(explode));

        let outcome = HandlerOutcome::from(handler(RequestContext::default(), Message::new("x")).await);
        match outcome {
            HandlerOutcome::Panicked(panic) => {
                assert_eq!(panic.message, "boom");
                assert!(!panic.backtrace.is_empty());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_synchronous_panic_is_caught() {
        let handler: HandlerFunc =
            Arc::new(|_: RequestContext, _: Message| -> BoxFuture<'static, HandlerResult> {
                panic!("before future")
            });
        let result = wrapped(handler)(RequestContext::default(), Message::new("x")).await;
        assert!(matches!(result, Err(HandlerError::Panic(ref p)) if p.message == "before future"));
    }

    #[tokio::test]
    async fn test_message_recover_decides_result() {
        let handler = wrapped(handler_fn(explode));
        let message = Message::new("x").with_recover(Arc::new(|ctx, panic| {
            HandlerError::failed(format!("{} recovered {}", ctx.cid, panic.message))
        }));

        let ctx = RequestContext::new(Some("cid-1".to_string()));
        let err = handler(ctx, message).await.unwrap_err();
        assert_eq!(err.to_string(), "handler failed: cid-1 recovered boom");
    }

    #[tokio::test]
    async fn test_success_and_failure_pass_through() {
        let ok = wrapped(handler_fn(|_, _| async { Ok(()) }));
        assert!(HandlerOutcome::from(ok(RequestContext::default(), Message::new("x")).await).is_ok());

        let failing = wrapped(handler_fn(|_, _| async { Err(HandlerError::failed("nope")) }));
        let outcome = HandlerOutcome::from(failing(RequestContext::default(), Message::new("x")).await);
        assert_eq!(outcome.label(), "failed");
    }
}
