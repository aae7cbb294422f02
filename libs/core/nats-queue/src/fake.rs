//! In-memory broker used by unit tests.

use crate::delivery::Delivery;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use messaging::{Header, Message, QueueError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    Ack,
    Nak(Option<Duration>),
    Term,
}

#[derive(Default)]
struct State {
    queue: VecDeque<FakeDelivery>,
    settled: Vec<(String, Settled)>,
    outstanding: usize,
}

/// Redelivers nacked messages until `max_deliver` attempts were made.
#[derive(Clone)]
pub struct FakeBroker {
    state: Arc<Mutex<State>>,
    max_deliver: u64,
}

impl FakeBroker {
    pub fn new(max_deliver: u64) -> Self {
        Self {
            state: Arc::default(),
            max_deliver,
        }
    }

    pub fn delivery(&self, message: Message) -> FakeDelivery {
        self.delivery_at(message, Some(1))
    }

    pub fn delivery_at(&self, message: Message, attempt: Option<u64>) -> FakeDelivery {
        self.state.lock().unwrap().outstanding += 1;
        FakeDelivery {
            broker: self.clone(),
            message,
            attempt,
        }
    }

    pub fn publish(&self, message: Message) {
        let delivery = self.delivery(message);
        self.state.lock().unwrap().queue.push_back(delivery);
    }

    pub fn settled(&self) -> Vec<Settled> {
        self.state
            .lock()
            .unwrap()
            .settled
            .iter()
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn settled_for(&self, id: &str) -> Vec<Settled> {
        self.state
            .lock()
            .unwrap()
            .settled
            .iter()
            .filter(|(msg_id, _)| msg_id == id)
            .map(|(_, s)| s.clone())
            .collect()
    }

    /// Yields queued deliveries, ending once every delivery is settled for good.
    pub fn source(&self) -> BoxStream<'static, Result<FakeDelivery, QueueError>> {
        futures::stream::unfold(self.clone(), |broker| async move {
            loop {
                let next = {
                    let mut state = broker.state.lock().unwrap();
                    match state.queue.pop_front() {
                        Some(delivery) => Some(Some(delivery)),
                        None if state.outstanding == 0 => Some(None),
                        None => None,
                    }
                };
                match next {
                    Some(Some(delivery)) => return Some((Ok(delivery), broker)),
                    Some(None) => return None,
                    None => tokio::time::sleep(Duration::from_millis(1)).await,
                }
            }
        })
        .boxed()
    }

    fn settle(&self, delivery: &FakeDelivery, settled: Settled) {
        let mut state = self.state.lock().unwrap();
        let id = delivery.message.id.clone().unwrap_or_default();
        let redeliver = matches!(settled, Settled::Nak(_))
            && delivery.attempt.unwrap_or(1) < self.max_deliver;
        state.settled.push((id, settled));

        if redeliver {
            state.queue.push_back(FakeDelivery {
                broker: self.clone(),
                message: delivery.message.clone(),
                attempt: delivery.attempt.map(|n| n + 1),
            });
        } else {
            state.outstanding = state.outstanding.saturating_sub(1);
        }
    }
}

pub struct FakeDelivery {
    broker: FakeBroker,
    message: Message,
    attempt: Option<u64>,
}

#[async_trait]
impl Delivery for FakeDelivery {
    fn subject(&self) -> &str {
        &self.message.topic
    }

    fn headers(&self) -> Header {
        let mut headers = self.message.headers.clone();
        if let Some(id) = &self.message.id {
            headers.set(messaging::keys::MESSAGE_ID, id.clone());
        }
        headers
    }

    fn payload(&self) -> Vec<u8> {
        self.message.body.clone()
    }

    fn attempt(&self) -> Option<u64> {
        self.attempt
    }

    async fn ack(&self) -> Result<(), QueueError> {
        self.broker.settle(self, Settled::Ack);
        Ok(())
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), QueueError> {
        self.broker.settle(self, Settled::Nak(delay));
        Ok(())
    }

    async fn term(&self) -> Result<(), QueueError> {
        self.broker.settle(self, Settled::Term);
        Ok(())
    }
}
