//! The JetStream connection: provisioning, subscriptions, publishing and
//! ordered shutdown.

use crate::config::{JetStreamSubscribeConfig, NatsConfig, SubjectSubscribeConfig};
use crate::delivery::{header_to_nats, CoreDelivery};
use crate::pool::{spawn_workers, DeliverySource};
use crate::processor::DeliveryHandler;
use crate::provision::{ensure_consumer, ensure_stream};
use crate::publish::{PublishAck, PublishFuture};
use crate::subscription::{SubscriptionKind, SubscriptionRegistry, SubscriptionStatus};
use async_nats::connection::State;
use async_nats::jetstream::{self, stream::Stream};
use async_nats::{ConnectOptions, Event, HeaderMap};
use async_trait::async_trait;
use futures::stream::StreamExt;
use futures::TryStreamExt;
use messaging::{
    prepare_publish, Broker, Dispatcher, HandlerFunc, Message, Middleware, MiddlewareStack,
    QueueError, QueueLogger, QueueMetrics, RequestContext, SubscribeOptions, TracingLogger,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

const BROKER: &str = "nats";

/// A NATS connection with JetStream enabled.
pub struct NatsConnection {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: NatsConfig,
    streams: RwLock<HashMap<String, Stream>>,
    middlewares: MiddlewareStack,
    subscriptions: SubscriptionRegistry,
    logger: Arc<dyn QueueLogger>,
    async_errors: Arc<Mutex<Vec<String>>>,
    closed: watch::Receiver<bool>,
    shut_down: AtomicBool,
}

impl NatsConnection {
    /// Connect and provision every configured stream.
    pub async fn connect(config: NatsConfig) -> Result<Self, QueueError> {
        Self::connect_with_logger(config, Arc::new(TracingLogger)).await
    }

    pub async fn connect_with_logger(
        config: NatsConfig,
        logger: Arc<dyn QueueLogger>,
    ) -> Result<Self, QueueError> {
        if config.topics.is_empty() {
            return Err(QueueError::config("at least one topic is required"));
        }

        let async_errors = Arc::new(Mutex::new(Vec::new()));
        let (closed_tx, closed) = watch::channel(false);
        let options = connect_options(&config, async_errors.clone(), Arc::new(closed_tx));

        let client = options.connect(config.url()).await.map_err(|e| {
            logger.error("Failed to connect to NATS", Some(&e), &[("url", &config.url())]);
            QueueError::connection(format!("failed to connect nats: {e}"))
        })?;
        let jetstream = jetstream::new(client.clone());

        let mut streams = HashMap::with_capacity(config.topics.len());
        for topic in &config.topics {
            let stream = ensure_stream(&jetstream, topic).await?;
            streams.insert(topic.name.clone(), stream);
        }

        logger.info(
            "Successfully connected to NATS JetStream server",
            &[("url", &config.url()), ("streams", &streams.len())],
        );

        Ok(Self {
            client,
            jetstream,
            config,
            streams: RwLock::new(streams),
            middlewares: MiddlewareStack::new(),
            subscriptions: SubscriptionRegistry::new(),
            logger,
            async_errors,
            closed,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }

    pub fn use_middleware(&self, middleware: Middleware) -> Result<(), QueueError> {
        self.middlewares.use_middleware(middleware)
    }

    pub fn middlewares(&self) -> Vec<Middleware> {
        self.middlewares.snapshot()
    }

    fn stream(&self, topic: &str) -> Result<Stream, QueueError> {
        self.streams
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(topic)
            .cloned()
            .ok_or_else(|| QueueError::subscribe(topic, format!("stream {topic} not found")))
    }

    fn ensure_open(&self, topic: &str) -> Result<(), QueueError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(QueueError::subscribe(topic, "connection is shut down"));
        }
        Ok(())
    }

    fn delivery_handler(
        &self,
        topic: &str,
        auto_ack: bool,
        no_recovery: bool,
        backoff: Option<messaging::BackoffStrategy>,
        handler: HandlerFunc,
    ) -> Arc<DeliveryHandler> {
        let chain = self.middlewares.apply(handler, no_recovery);
        let dispatcher = Dispatcher::new(chain, self.logger.clone(), QueueMetrics::new(BROKER, topic));
        Arc::new(DeliveryHandler::new(dispatcher, auto_ack, backoff))
    }

    /// Continuous delivery from a configured stream: `concurrency` consume
    /// loops (default 1), each pulling up to `pull_max_messages` per batch.
    pub async fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions<JetStreamSubscribeConfig>,
        handler: HandlerFunc,
    ) -> Result<(), QueueError> {
        self.ensure_open(topic)?;
        let stream = self.stream(topic)?;
        self.consume(topic, &stream, SubscriptionKind::Push, options, handler)
            .await
    }

    /// Pull iteration: one cursor shared by `concurrency` workers. Each worker
    /// settles its message before pulling the next.
    pub async fn subscribe_messages(
        &self,
        topic: &str,
        options: SubscribeOptions<JetStreamSubscribeConfig>,
        handler: HandlerFunc,
    ) -> Result<(), QueueError> {
        self.ensure_open(topic)?;
        let stream = self.stream(topic)?;
        self.consume(topic, &stream, SubscriptionKind::Pull, options, handler)
            .await
    }

    /// Like [`subscribe`](Self::subscribe) for a stream provisioned elsewhere.
    pub async fn subscribe_consumer(
        &self,
        stream_name: &str,
        options: SubscribeOptions<JetStreamSubscribeConfig>,
        handler: HandlerFunc,
    ) -> Result<(), QueueError> {
        self.ensure_open(stream_name)?;
        let stream = self
            .jetstream
            .get_stream(stream_name)
            .await
            .map_err(|e| QueueError::subscribe(stream_name, format!("failed to get stream: {e}")))?;
        self.consume(stream_name, &stream, SubscriptionKind::Push, options, handler)
            .await
    }

    async fn consume(
        &self,
        topic: &str,
        stream: &Stream,
        kind: SubscriptionKind,
        options: SubscribeOptions<JetStreamSubscribeConfig>,
        handler: HandlerFunc,
    ) -> Result<(), QueueError> {
        let consumer = ensure_consumer(stream, topic, &options.config).await?;
        let handler = self.delivery_handler(
            topic,
            options.auto_ack,
            options.config.no_recovery,
            options.config.redelivery_backoff.clone(),
            handler,
        );
        let concurrency = options.concurrency_or(1);
        let batch = options.config.batch_size();

        // Push loops each own a pull stream; the pull shape shares one.
        let (streams, workers_per_stream) = match kind {
            SubscriptionKind::Pull => (1, concurrency),
            _ => (concurrency, 1),
        };

        let (id, stop) = self.subscriptions.create(topic, kind).await;
        let mut tasks = Vec::new();
        for _ in 0..streams {
            let messages = match consumer.stream().max_messages_per_batch(batch).messages().await {
                Ok(messages) => messages,
                Err(e) => {
                    self.logger
                        .error("Failed to subscribe to topic", Some(&e), &[("topic", &topic)]);
                    self.subscriptions.discard(id, tasks).await;
                    return Err(QueueError::subscribe(
                        topic,
                        format!("failed to subscribe to topic {topic}: {e}"),
                    ));
                }
            };
            let owned_topic = topic.to_string();
            let source: DeliverySource<jetstream::Message> = messages
                .map(move |item| item.map_err(|e| QueueError::subscribe(&owned_topic, e)))
                .boxed();
            tasks.extend(spawn_workers(
                topic,
                source,
                workers_per_stream,
                handler.clone(),
                stop.clone(),
            ));
        }

        self.subscriptions.start(id, tasks).await;
        info!(topic = %topic, kind = ?kind, concurrency, "Subscribed to stream");
        Ok(())
    }

    /// Plain (non-durable) subject subscription, optionally load-balanced
    /// through a queue group. Messages are buffered in a channel of
    /// `channel_capacity` feeding `concurrency` workers.
    pub async fn subscribe_subject(
        &self,
        subject: &str,
        options: SubscribeOptions<SubjectSubscribeConfig>,
        handler: HandlerFunc,
    ) -> Result<(), QueueError> {
        self.ensure_open(subject)?;

        let subscriber = match &options.config.queue_group {
            Some(group) => self.client.queue_subscribe(subject.to_string(), group.clone()).await,
            None => self.client.subscribe(subject.to_string()).await,
        }
        .map_err(|e| {
            self.logger
                .error("Failed to subscribe to topic", Some(&e), &[("topic", &subject)]);
            QueueError::subscribe(subject, format!("failed to subscribe to topic {subject}: {e}"))
        })?;

        let handler = self.delivery_handler(
            subject,
            options.auto_ack,
            options.config.no_recovery,
            None,
            handler,
        );
        let capacity = options.config.channel_capacity.max(1);
        let (tx, rx) = mpsc::channel::<CoreDelivery>(capacity);

        let (id, stop) = self.subscriptions.create(subject, SubscriptionKind::Subject).await;
        let pump = tokio::spawn(pump_subject(
            self.client.clone(),
            subject.to_string(),
            subscriber,
            tx,
            stop.clone(),
        ));

        let source: DeliverySource<CoreDelivery> = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        })
        .boxed();
        let mut tasks = spawn_workers(subject, source, options.concurrency_or(1), handler, stop);
        tasks.push(pump);

        self.subscriptions.start(id, tasks).await;
        info!(subject = %subject, "Subscribed to subject");
        Ok(())
    }

    fn outgoing(
        &self,
        ctx: &RequestContext,
        topic: &str,
        mut message: Message,
    ) -> Result<(HeaderMap, Vec<u8>), QueueError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(QueueError::publish(topic, "connection is shut down"));
        }
        prepare_publish(ctx, &mut message)?;
        let headers = if message.no_header {
            HeaderMap::new()
        } else {
            header_to_nats(&message.headers)
        };
        Ok((headers, message.body))
    }

    /// Publish to JetStream and wait for the stream's acknowledgement.
    pub async fn publish(
        &self,
        ctx: &RequestContext,
        topic: &str,
        message: Message,
    ) -> Result<PublishAck, QueueError> {
        let (headers, body) = self.outgoing(ctx, topic, message)?;

        let ack = self
            .jetstream
            .publish_with_headers(topic.to_string(), headers, body.into())
            .await
            .map_err(|e| self.publish_failed(topic, e))?
            .await
            .map_err(|e| self.publish_failed(topic, e))?;

        QueueMetrics::new(BROKER, topic).message_published();
        Ok(ack.into())
    }

    /// Publish without waiting; the returned future resolves to the ack.
    pub async fn publish_async(
        &self,
        ctx: &RequestContext,
        topic: &str,
        message: Message,
    ) -> Result<PublishFuture, QueueError> {
        let (headers, body) = self.outgoing(ctx, topic, message)?;

        let pending = self
            .jetstream
            .publish_with_headers(topic.to_string(), headers, body.into())
            .await
            .map_err(|e| self.publish_failed(topic, e))?;

        let metrics = QueueMetrics::new(BROKER, topic);
        let owned_topic = topic.to_string();
        Ok(PublishFuture::spawn(topic, async move {
            let ack = pending
                .await
                .map_err(|e| QueueError::publish(&owned_topic, e))?;
            metrics.message_published();
            Ok(PublishAck::from(ack))
        }))
    }

    /// Core NATS publish, no persistence or acknowledgement.
    pub async fn publish_subject(
        &self,
        ctx: &RequestContext,
        subject: &str,
        message: Message,
    ) -> Result<(), QueueError> {
        let (headers, body) = self.outgoing(ctx, subject, message)?;
        self.client
            .publish_with_headers(subject.to_string(), headers, body.into())
            .await
            .map_err(|e| self.publish_failed(subject, e))?;
        QueueMetrics::new(BROKER, subject).message_published();
        Ok(())
    }

    fn publish_failed(&self, topic: &str, e: impl std::error::Error) -> QueueError {
        self.logger
            .error("Failed to publish message", Some(&e), &[("topic", &topic)]);
        QueueError::publish(topic, format!("failed to publish message: {e}"))
    }

    /// Delete a stream provisioned by this connection.
    pub async fn delete_stream(&self, name: &str) -> Result<(), QueueError> {
        if !self
            .streams
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(name)
        {
            return Err(QueueError::config(format!("stream {name} not found")));
        }

        self.jetstream.delete_stream(name).await.map_err(|e| {
            self.logger
                .error("Failed to delete stream", Some(&e), &[("stream", &name)]);
            QueueError::connection(format!("failed to delete stream {name}: {e}"))
        })?;

        self.streams
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name);
        Ok(())
    }

    /// Delete every stream on the server.
    pub async fn delete_all_streams(&self) -> Result<(), QueueError> {
        let names: Vec<String> = self
            .jetstream
            .stream_names()
            .try_collect()
            .await
            .map_err(|e| QueueError::connection(format!("failed to list streams: {e}")))?;

        for name in names {
            self.jetstream.delete_stream(&name).await.map_err(|e| {
                self.logger
                    .error("Failed to delete stream", Some(&e), &[("stream", &name)]);
                QueueError::connection(format!("failed to delete stream {name}: {e}"))
            })?;
            self.logger
                .info("Deleted stream", &[("stream", &name)]);
        }

        self.streams
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        self.logger.info("All streams deleted successfully", &[]);
        Ok(())
    }

    pub async fn subscriptions(&self) -> Vec<SubscriptionStatus> {
        self.subscriptions.statuses().await
    }

    /// Fails when the client is not connected or a consuming subscription
    /// has lost all its workers.
    pub async fn health_check(&self) -> Result<(), QueueError> {
        match self.client.connection_state() {
            State::Connected => {}
            state => {
                return Err(QueueError::connection(format!(
                    "nats connection is not connected: {state:?}"
                )))
            }
        }

        let dead: Vec<String> = self
            .subscriptions
            .statuses()
            .await
            .into_iter()
            .filter(|s| {
                s.state == crate::subscription::SubscriptionState::Consuming && s.live_workers == 0
            })
            .map(|s| s.topic)
            .collect();
        if !dead.is_empty() {
            return Err(QueueError::connection(format!(
                "subscriptions without workers: {}",
                dead.join(", ")
            )));
        }
        Ok(())
    }

    /// Stop pull iterators, then consume loops, then subject subscriptions;
    /// drain the connection and wait (bounded by `drain_timeout`) for it to
    /// close. Errors captured from the connection during the session are
    /// reported here. Calling it again returns `Ok(())`.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let grace = self.config.drain_timeout;
        for kind in [
            SubscriptionKind::Pull,
            SubscriptionKind::Push,
            SubscriptionKind::Subject,
        ] {
            let stopped = self.subscriptions.stop_kind(kind, grace).await;
            debug!(kind = ?kind, stopped, "Stopped subscriptions");
        }

        if let Err(e) = self.client.drain().await {
            self.logger.error("Nats drain error", Some(&e), &[]);
            return Err(QueueError::shutdown(format!(
                "failed to drain nats connection: {e}"
            )));
        }

        let mut closed = self.closed.clone();
        if tokio::time::timeout(grace, closed.wait_for(|closed| *closed))
            .await
            .is_err()
        {
            self.logger
                .warn("Timed out waiting for NATS connection to close", None, &[]);
        }

        let async_error = self
            .async_errors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .last()
            .cloned();
        if let Some(err) = async_error {
            return Err(QueueError::shutdown(format!(
                "nats connection reported an error: {err}"
            )));
        }

        self.logger.info("NATS connection shut down", &[]);
        Ok(())
    }
}

fn connect_options(
    config: &NatsConfig,
    async_errors: Arc<Mutex<Vec<String>>>,
    closed: Arc<watch::Sender<bool>>,
) -> ConnectOptions {
    let options = if let Some(token) = &config.token {
        ConnectOptions::with_token(token.clone())
    } else if let (Some(user), Some(password)) = (&config.username, &config.password) {
        ConnectOptions::with_user_and_password(user.clone(), password.clone())
    } else {
        ConnectOptions::new()
    };

    let options = match &config.client_name {
        Some(name) => options.name(name),
        None => options,
    };

    options.event_callback(move |event| {
        let async_errors = async_errors.clone();
        let closed = closed.clone();
        async move {
            match event {
                Event::Closed => {
                    closed.send_replace(true);
                }
                Event::ServerError(e) => {
                    tracing::error!(error = %e, "NATS server error");
                    async_errors
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .push(e.to_string());
                }
                Event::ClientError(e) => {
                    tracing::error!(error = %e, "NATS client error");
                    async_errors
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .push(e.to_string());
                }
                other => debug!(event = %other, "NATS connection event"),
            }
        }
    })
}

/// Forward subject messages into the worker channel until stopped, then
/// unsubscribe.
async fn pump_subject(
    client: async_nats::Client,
    subject: String,
    mut subscriber: async_nats::Subscriber,
    tx: mpsc::Sender<CoreDelivery>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            message = subscriber.next() => match message {
                Some(message) => {
                    if tx.send(CoreDelivery::new(client.clone(), message)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    if let Err(e) = subscriber.unsubscribe().await {
        tracing::warn!(subject = %subject, error = %e, "Failed to unsubscribe");
    }
}

#[async_trait]
impl Broker for NatsConnection {
    type SubscribeConfig = JetStreamSubscribeConfig;
    type PublishReceipt = PublishAck;

    async fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions<Self::SubscribeConfig>,
        handler: HandlerFunc,
    ) -> Result<(), QueueError> {
        NatsConnection::subscribe(self, topic, options, handler).await
    }

    async fn publish(
        &self,
        ctx: &RequestContext,
        topic: &str,
        message: Message,
    ) -> Result<Self::PublishReceipt, QueueError> {
        NatsConnection::publish(self, ctx, topic, message).await
    }

    async fn shutdown(&self) -> Result<(), QueueError> {
        NatsConnection::shutdown(self).await
    }

    fn use_middleware(&self, middleware: Middleware) -> Result<(), QueueError> {
        NatsConnection::use_middleware(self, middleware)
    }

    fn middlewares(&self) -> Vec<Middleware> {
        NatsConnection::middlewares(self)
    }
}
