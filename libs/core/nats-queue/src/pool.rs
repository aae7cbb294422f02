//! Bounded worker group over a shared delivery source.

use crate::delivery::Delivery;
use crate::processor::DeliveryHandler;
use futures::stream::{BoxStream, StreamExt};
use messaging::QueueError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub(crate) type DeliverySource<D> = BoxStream<'static, Result<D, QueueError>>;

const SOURCE_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Spawn `workers` tasks pulling from one `source`.
///
/// A worker settles its delivery before it pulls the next one, so at most
/// `workers` handler calls are in flight. Workers exit when the source ends
/// or `stop` flips to `true`.
pub(crate) fn spawn_workers<D: Delivery>(
    topic: &str,
    source: DeliverySource<D>,
    workers: usize,
    handler: Arc<DeliveryHandler>,
    stop: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let source = Arc::new(Mutex::new(source));

    (0..workers.max(1))
        .map(|worker| {
            let source = source.clone();
            let handler = handler.clone();
            let stop = stop.clone();
            let topic = topic.to_string();
            tokio::spawn(async move { worker_loop(topic, worker, source, handler, stop).await })
        })
        .collect()
}

async fn worker_loop<D: Delivery>(
    topic: String,
    worker: usize,
    source: Arc<Mutex<DeliverySource<D>>>,
    handler: Arc<DeliveryHandler>,
    mut stop: watch::Receiver<bool>,
) {
    debug!(topic = %topic, worker, "Worker started");

    loop {
        if *stop.borrow() {
            break;
        }

        let next = {
            let mut source = source.lock().await;
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                next = source.next() => next,
            }
        };

        match next {
            Some(Ok(delivery)) => handler.handle(delivery).await,
            Some(Err(e)) => {
                warn!(topic = %topic, worker, error = %e, "Error receiving message");
                tokio::time::sleep(SOURCE_ERROR_BACKOFF).await;
            }
            None => break,
        }
    }

    debug!(topic = %topic, worker, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeBroker, Settled};
    use messaging::testing::RecordingLogger;
    use messaging::{
        handler_fn, Dispatcher, HandlerError, HandlerFunc, Message, MiddlewareStack, QueueMetrics,
        RequestContext,
    };
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn delivery_handler(handler: HandlerFunc) -> Arc<DeliveryHandler> {
        let chain = MiddlewareStack::new().apply(handler, false);
        let dispatcher = Dispatcher::new(
            chain,
            Arc::new(RecordingLogger::default()),
            QueueMetrics::new("nats", "orders"),
        );
        Arc::new(DeliveryHandler::new(dispatcher, false, None))
    }

    async fn join(handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_five_workers_fifty_messages() {
        let broker = FakeBroker::new(5);
        for i in 0..50 {
            broker.publish(Message::new(format!("m{i}")).with_id(format!("m{i}")));
        }

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(StdMutex::new(HashSet::new()));
        let handled = Arc::new(StdMutex::new(HashMap::<String, usize>::new()));

        let handler = {
            let (in_flight, peak, active, handled) =
                (in_flight.clone(), peak.clone(), active.clone(), handled.clone());
            handler_fn(move |_, msg: Message| {
                let (in_flight, peak, active, handled) =
                    (in_flight.clone(), peak.clone(), active.clone(), handled.clone());
                async move {
                    let id = msg.id.clone().unwrap_or_default();
                    assert!(active.lock().unwrap().insert(id.clone()), "{id} handled twice at once");
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);

                    tokio::time::sleep(Duration::from_millis(2)).await;

                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    active.lock().unwrap().remove(&id);
                    *handled.lock().unwrap().entry(id).or_default() += 1;
                    Ok(())
                }
            })
        };

        let (_stop_tx, stop_rx) = watch::channel(false);
        join(spawn_workers("orders", broker.source(), 5, delivery_handler(handler), stop_rx)).await;

        let handled = handled.lock().unwrap();
        assert_eq!(handled.len(), 50);
        assert!(handled.values().all(|count| *count == 1));
        assert!(peak.load(Ordering::SeqCst) <= 5);
        assert_eq!(broker.settled().iter().filter(|s| **s == Settled::Ack).count(), 50);
    }

    #[tokio::test]
    async fn test_fails_then_succeeds_is_acked_once() {
        let broker = FakeBroker::new(5);
        broker.publish(Message::new("flaky").with_id("flaky"));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = handler_fn(move |_, _| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 < 3 {
                    Err(HandlerError::failed("not yet"))
                } else {
                    Ok(())
                }
            }
        });

        let (_stop_tx, stop_rx) = watch::channel(false);
        join(spawn_workers("orders", broker.source(), 1, delivery_handler(handler), stop_rx)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            broker.settled_for("flaky"),
            vec![Settled::Nak(None), Settled::Nak(None), Settled::Ack]
        );
    }

    #[tokio::test]
    async fn test_always_failing_is_capped_by_max_deliver() {
        let broker = FakeBroker::new(4);
        broker.publish(Message::new("poison").with_id("poison"));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = handler_fn(move |_, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::failed("always"))
            }
        });

        let (_stop_tx, stop_rx) = watch::channel(false);
        join(spawn_workers("orders", broker.source(), 2, delivery_handler(handler), stop_rx)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(!broker.settled().contains(&Settled::Ack));
    }

    #[tokio::test]
    async fn test_panic_does_not_stop_worker() {
        let broker = FakeBroker::new(1);
        broker.publish(Message::new("boom").with_id("boom"));
        broker.publish(Message::new("fine").with_id("fine"));

        async fn handle(_: RequestContext, msg: Message) -> Result<(), HandlerError> {
            if msg.body_str() == "boom" {
                panic!("handler blew up");
            }
            Ok(())
        }

        let (_stop_tx, stop_rx) = watch::channel(false);
        join(spawn_workers("orders", broker.source(), 1, delivery_handler(handler_fn(handle)), stop_rx))
            .await;

        assert_eq!(broker.settled_for("boom"), vec![Settled::Nak(None)]);
        assert_eq!(broker.settled_for("fine"), vec![Settled::Ack]);
    }

    #[tokio::test]
    async fn test_stop_signal_ends_idle_workers() {
        let broker = FakeBroker::new(1);
        // An unsettled delivery keeps the source open forever.
        let _pending = broker.delivery(Message::new("held"));

        let (stop_tx, stop_rx) = watch::channel(false);
        let handles = spawn_workers(
            "orders",
            broker.source(),
            3,
            delivery_handler(handler_fn(|_, _| async { Ok(()) })),
            stop_rx,
        );

        stop_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), join(handles))
            .await
            .expect("workers did not stop");
    }
}
