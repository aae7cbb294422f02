//! Settles AMQP deliveries according to the handler outcome.
//!
//! There is no redelivery counter to inspect here, so every failure is
//! requeued. Bounded retry belongs in application middleware.

use async_trait::async_trait;
use lapin::acker::Acker;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions};
use messaging::{Dispatch, Dispatcher, HandlerOutcome, Message};

/// Settlement operations on one delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), lapin::Error>;

    /// Negative acknowledgement with requeue.
    async fn requeue(&self) -> Result<(), lapin::Error>;

    /// Reject without requeue.
    async fn reject(&self) -> Result<(), lapin::Error>;
}

#[async_trait]
impl Acknowledger for Acker {
    async fn ack(&self) -> Result<(), lapin::Error> {
        Acker::ack(self, BasicAckOptions::default()).await.map(|_| ())
    }

    async fn requeue(&self) -> Result<(), lapin::Error> {
        self.nack(BasicNackOptions {
            multiple: false,
            requeue: true,
        })
        .await
        .map(|_| ())
    }

    async fn reject(&self) -> Result<(), lapin::Error> {
        Acker::reject(self, BasicRejectOptions { requeue: false })
            .await
            .map(|_| ())
    }
}

pub struct DeliveryHandler {
    dispatcher: Dispatcher,
    auto_ack: bool,
}

impl DeliveryHandler {
    pub fn new(dispatcher: Dispatcher, auto_ack: bool) -> Self {
        Self {
            dispatcher,
            auto_ack,
        }
    }

    pub async fn handle<A: Acknowledger>(&self, message: Message, acker: &A) {
        let metrics = self.dispatcher.metrics();
        let logger = self.dispatcher.logger();
        let topic = message.topic.clone();

        let outcome = match self.dispatcher.dispatch(message).await {
            Dispatch::Dropped(_) => {
                if !self.auto_ack {
                    if let Err(e) = acker.reject().await {
                        logger.error("Failed to reject message", Some(&e), &[("topic", &topic)]);
                        metrics.settle_failed();
                    }
                }
                return;
            }
            Dispatch::Handled(outcome) => outcome,
        };

        // The broker settled the delivery when it was sent.
        if self.auto_ack {
            return;
        }

        let settled = match outcome {
            HandlerOutcome::Ok => acker.ack().await.map(|()| metrics.message_acked()),
            HandlerOutcome::Failed(_) | HandlerOutcome::Panicked(_) => {
                acker.requeue().await.map(|()| metrics.message_nacked(false))
            }
        };

        if let Err(e) = settled {
            logger.error("RabbitMQ error", Some(&e), &[("topic", &topic)]);
            metrics.settle_failed();
        }
    }
}
