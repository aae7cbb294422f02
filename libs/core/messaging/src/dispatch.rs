//! The per-message step every adapter funnels deliveries through.

use crate::compression;
use crate::context::{decode_context, encode_context, RequestContext};
use crate::envelope::{keys, Message};
use crate::error::{CompressionError, HandlerError, PanicError};
use crate::logger::QueueLogger;
use crate::metrics::QueueMetrics;
use crate::middleware::HandlerFunc;
use crate::recover::HandlerOutcome;
use std::sync::Arc;
use std::time::Instant;

/// What happened to an inbound message.
#[derive(Debug)]
pub enum Dispatch {
    /// The handler chain ran.
    Handled(HandlerOutcome),
    /// The body could not be decoded; the message must not be redelivered.
    Dropped(CompressionError),
}

/// Runs a composed handler chain against inbound messages.
#[derive(Clone)]
pub struct Dispatcher {
    handler: HandlerFunc,
    logger: Arc<dyn QueueLogger>,
    metrics: QueueMetrics,
}

impl Dispatcher {
    pub fn new(handler: HandlerFunc, logger: Arc<dyn QueueLogger>, metrics: QueueMetrics) -> Self {
        Self {
            handler,
            logger,
            metrics,
        }
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    pub fn logger(&self) -> &Arc<dyn QueueLogger> {
        &self.logger
    }

    /// Decode context, decompress, then run the chain.
    pub async fn dispatch(&self, mut message: Message) -> Dispatch {
        self.metrics.message_received();

        let ctx = decode_context(&message.headers);

        if let Err(e) = compression::decompress(&mut message) {
            self.logger.error(
                "Failed to decompress message body",
                Some(&e),
                &[("topic", &message.topic), ("cid", &ctx.cid)],
            );
            self.metrics.message_dropped("compression");
            return Dispatch::Dropped(e);
        }

        if message.recover.is_none() {
            message.recover = Some(self.panic_reporter(&message.topic));
        }

        let topic = message.topic.clone();
        let cid = ctx.cid.clone();
        let started = Instant::now();
        let outcome = HandlerOutcome::from((self.handler)(ctx, message).await);
        self.metrics.handler_duration(outcome.label(), started.elapsed());

        match &outcome {
            HandlerOutcome::Ok => {}
            HandlerOutcome::Failed(e) => {
                self.logger
                    .warn("Queue handler failed", Some(e), &[("topic", &topic), ("cid", &cid)]);
            }
            HandlerOutcome::Panicked(_) => self.metrics.handler_panicked(),
        }

        Dispatch::Handled(outcome)
    }

    fn panic_reporter(&self, topic: &str) -> crate::RecoverFn {
        let logger = self.logger.clone();
        let msg = format!(
            "Recovered from panic in {} handler: {}",
            self.metrics.broker(),
            topic
        );
        Arc::new(move |ctx: &RequestContext, panic: &PanicError| {
            logger.panic_report(ctx, &msg, panic);
            HandlerError::Panic(panic.clone())
        })
    }
}

/// Prepare an outgoing message: compress the body and, unless the message
/// opted out, attach context and id headers.
pub fn prepare_publish(ctx: &RequestContext, message: &mut Message) -> Result<(), CompressionError> {
    compression::compress(message)?;

    if message.no_header {
        return Ok(());
    }

    encode_context(ctx, &mut message.headers);
    if let Some(id) = message.id.as_ref().filter(|id| !id.is_empty()) {
        message.headers.set(keys::MESSAGE_ID, id.clone());
    }
    Ok(())
}
