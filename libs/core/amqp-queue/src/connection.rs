//! The AMQP connection: one channel per subscription, publishing and
//! shutdown.

use crate::config::{AmqpConfig, AmqpSubscribeConfig};
use crate::processor::DeliveryHandler;
use crate::registry::{ChannelRegistry, Registered};
use crate::wire::{message_from_parts, publish_properties};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use messaging::{
    prepare_publish, Broker, Dispatcher, HandlerFunc, Message, Middleware, MiddlewareStack,
    QueueError, QueueLogger, QueueMetrics, RequestContext, SubscribeOptions, TracingLogger,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const BROKER: &str = "rabbitmq";

/// Default number of replicated consumers for `subscribe_replicated`.
pub const DEFAULT_REPLICAS: usize = 10;

const REPLY_SUCCESS: u16 = 200;

/// A consuming channel and the task reading from it.
pub(crate) struct ConsumerChannel {
    channel: Channel,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// A RabbitMQ connection.
pub struct AmqpConnection {
    connection: Connection,
    config: AmqpConfig,
    middlewares: MiddlewareStack,
    channels: ChannelRegistry<ConsumerChannel>,
    publisher: Mutex<Option<Channel>>,
    logger: Arc<dyn QueueLogger>,
    shut_down: AtomicBool,
}

impl AmqpConnection {
    pub async fn connect(config: AmqpConfig) -> Result<Self, QueueError> {
        Self::connect_with_logger(config, Arc::new(TracingLogger)).await
    }

    pub async fn connect_with_logger(
        config: AmqpConfig,
        logger: Arc<dyn QueueLogger>,
    ) -> Result<Self, QueueError> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &config.connection_name {
            properties = properties.with_connection_name(name.as_str().into());
        }

        let connection = Connection::connect(&config.url(), properties)
            .await
            .map_err(|e| {
                logger.error(
                    "Failed to connect to RabbitMQ",
                    Some(&e),
                    &[("host", &config.host), ("port", &config.port)],
                );
                QueueError::connection(format!("failed to connect rabbitmq: {e}"))
            })?;

        logger.info(
            "Successfully connected to RabbitMQ server",
            &[("host", &config.host), ("vhost", &config.vhost)],
        );

        Ok(Self {
            connection,
            config,
            middlewares: MiddlewareStack::new(),
            channels: ChannelRegistry::new(),
            publisher: Mutex::new(None),
            logger,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn use_middleware(&self, middleware: Middleware) -> Result<(), QueueError> {
        self.middlewares.use_middleware(middleware)
    }

    pub fn middlewares(&self) -> Vec<Middleware> {
        self.middlewares.snapshot()
    }

    /// Consumer tags registered for `queue`, in subscription order.
    pub async fn consumer_tags(&self, queue: &str) -> Vec<String> {
        self.channels.tags(queue).await
    }

    /// Open a dedicated channel, optionally declare the queue, and start a
    /// consumer tagged `{queue}_{n}`.
    pub async fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions<AmqpSubscribeConfig>,
        handler: HandlerFunc,
    ) -> Result<(), QueueError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(QueueError::subscribe(topic, "connection is shut down"));
        }

        let channel = self.connection.create_channel().await.map_err(|e| {
            self.logger
                .error("failed to create channel", Some(&e), &[("topic", &topic)]);
            QueueError::subscribe(topic, format!("failed to create channel for topic {topic}: {e}"))
        })?;

        match self.start_consumer(&channel, topic, options, handler).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(close_err) = channel.close(REPLY_SUCCESS, "subscribe failed").await {
                    debug!(topic = %topic, error = %close_err, "Failed to close channel");
                }
                Err(e)
            }
        }
    }

    async fn start_consumer(
        &self,
        channel: &Channel,
        topic: &str,
        options: SubscribeOptions<AmqpSubscribeConfig>,
        handler: HandlerFunc,
    ) -> Result<(), QueueError> {
        let config = &options.config;

        if let Some(prefetch) = config.prefetch_count {
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| QueueError::subscribe(topic, format!("failed to set prefetch: {e}")))?;
        }

        let mut queue = topic.to_string();
        if config.declare_queue {
            let declared = channel
                .queue_declare(
                    topic,
                    QueueDeclareOptions {
                        durable: config.durable,
                        auto_delete: config.auto_delete,
                        exclusive: config.exclusive,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    self.logger
                        .error("failed to declare queue", Some(&e), &[("topic", &topic)]);
                    QueueError::subscribe(
                        topic,
                        format!("failed to declare queue for topic {topic}: {e}"),
                    )
                })?;
            queue = declared.name().as_str().to_string();
        }

        let tag = self.channels.next_tag(&queue).await;
        let consumer = channel
            .basic_consume(
                &queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: options.auto_ack,
                    exclusive: config.consumer_exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                self.logger.error(
                    "failed to consume messages from queue",
                    Some(&e),
                    &[("queue", &queue)],
                );
                QueueError::subscribe(
                    &queue,
                    format!("failed to consume messages from queue {queue}: {e}"),
                )
            })?;

        let chain = self.middlewares.apply(handler, config.no_recovery);
        let dispatcher = Dispatcher::new(chain, self.logger.clone(), QueueMetrics::new(BROKER, &queue));
        let handler = DeliveryHandler::new(dispatcher, options.auto_ack);

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(consume(queue.clone(), tag.clone(), consumer, handler, stop_rx));

        debug!(queue = %queue, tag = %tag, "Consumer started");
        self.channels
            .register(
                &queue,
                tag,
                ConsumerChannel {
                    channel: channel.clone(),
                    stop,
                    task,
                },
            )
            .await;
        Ok(())
    }

    /// Run `concurrency` (default 10) independent subscriptions on `topic`,
    /// each with its own channel.
    pub async fn subscribe_replicated(
        &self,
        topic: &str,
        options: SubscribeOptions<AmqpSubscribeConfig>,
        handler: HandlerFunc,
    ) -> Result<(), QueueError> {
        let replicas = options.concurrency_or(DEFAULT_REPLICAS);

        for _ in 0..replicas {
            let replica = SubscribeOptions {
                auto_ack: options.auto_ack,
                concurrency: 1,
                config: options.config.clone(),
            };
            if let Err(e) = self.subscribe(topic, replica, handler.clone()).await {
                self.logger
                    .error("failed to subscribe to topic", Some(&e), &[("topic", &topic)]);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Publish to the configured exchange with `topic` as routing key. With
    /// confirms enabled this waits for the broker's confirmation.
    pub async fn publish(
        &self,
        ctx: &RequestContext,
        topic: &str,
        mut message: Message,
    ) -> Result<(), QueueError> {
        if message.topic.is_empty() {
            message.topic = topic.to_string();
        }
        prepare_publish(ctx, &mut message)?;
        let properties = publish_properties(&message, self.config.persistent);

        let channel = self.publish_channel().await?;
        let confirm = channel
            .basic_publish(
                &self.config.exchange,
                topic,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| self.publish_failed(topic, e))?;

        if self.config.confirms {
            let confirmation = confirm.await.map_err(|e| self.publish_failed(topic, e))?;
            if let Confirmation::Nack(_) = confirmation {
                self.logger
                    .error("Broker rejected published message", None, &[("topic", &topic)]);
                return Err(QueueError::publish(topic, "broker nacked the message"));
            }
        }

        QueueMetrics::new(BROKER, topic).message_published();
        Ok(())
    }

    async fn publish_channel(&self) -> Result<Channel, QueueError> {
        let mut publisher = self.publisher.lock().await;
        if let Some(channel) = publisher.as_ref().filter(|c| c.status().connected()) {
            return Ok(channel.clone());
        }

        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| QueueError::publish("", format!("failed to create publish channel: {e}")))?;
        if self.config.confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| QueueError::publish("", format!("failed to enable confirms: {e}")))?;
        }

        *publisher = Some(channel.clone());
        Ok(channel)
    }

    fn publish_failed(&self, topic: &str, e: lapin::Error) -> QueueError {
        self.logger
            .error("Failed to publish message", Some(&e), &[("topic", &topic)]);
        QueueError::publish(topic, format!("failed to publish message: {e}"))
    }

    /// Close the first `n` channels of `topic` (all of them when `n` covers
    /// the list).
    pub async fn remove_channels(&self, topic: &str, n: usize) {
        for registered in self.channels.take(topic, n).await {
            self.close_consumer(topic, registered).await;
        }
    }

    /// Fails when the connection is down or any registered channel closed.
    pub async fn health_check(&self) -> Result<(), QueueError> {
        if !self.connection.status().connected() {
            return Err(QueueError::connection("RabbitMQ connection is closed"));
        }

        let unhealthy = self
            .channels
            .find_tags(|c| !c.channel.status().connected())
            .await;
        if !unhealthy.is_empty() {
            return Err(QueueError::connection(format!(
                "unhealthy channels found: {}",
                unhealthy.join(", ")
            )));
        }

        self.logger.info("RabbitMQ health check passed", &[]);
        Ok(())
    }

    /// Cancel every consumer and close its channel, tolerating channels the
    /// broker already closed, then close the connection. Calling it again
    /// returns `Ok(())`.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.logger.info("Starting RabbitMQ shutdown...", &[]);

        for (queue, consumers) in self.channels.take_all().await {
            for registered in consumers {
                self.close_consumer(&queue, registered).await;
            }
        }

        if let Some(publisher) = self.publisher.lock().await.take() {
            if let Err(e) = publisher.close(REPLY_SUCCESS, "shutdown").await {
                debug!(error = %e, "Failed to close publish channel");
            }
        }

        if self.connection.status().connected() {
            if let Err(e) = self.connection.close(REPLY_SUCCESS, "shutdown").await {
                if is_closed_error(&e) {
                    self.logger.warn("connection already closed", Some(&e), &[]);
                } else {
                    self.logger.error("failed to close connection", Some(&e), &[]);
                    return Err(QueueError::shutdown(format!(
                        "failed to close connection: {e}"
                    )));
                }
            }
        }

        self.logger.info("RabbitMQ shutdown completed", &[]);
        Ok(())
    }

    /// Stop reading, cancel the consumer, let the in-flight delivery settle,
    /// then close the channel.
    async fn close_consumer(&self, queue: &str, registered: Registered<ConsumerChannel>) {
        let Registered { tag, consumer } = registered;
        let ConsumerChannel {
            channel,
            stop,
            task,
        } = consumer;

        stop.send_replace(true);

        if let Err(e) = channel
            .basic_cancel(&tag, BasicCancelOptions::default())
            .await
        {
            if is_closed_error(&e) {
                self.logger
                    .warn("channel already closed when canceling", Some(&e), &[("tag", &tag)]);
            } else {
                self.logger
                    .warn("failed to cancel channel", Some(&e), &[("tag", &tag)]);
            }
        }

        if tokio::time::timeout(self.config.shutdown_timeout, task)
            .await
            .is_err()
        {
            self.logger
                .warn("Timed out waiting for consumer to finish", None, &[("tag", &tag)]);
        }

        match channel.close(REPLY_SUCCESS, "closing").await {
            Ok(()) => self.logger.info("Closed channel", &[("queue", &queue), ("tag", &tag)]),
            Err(e) if is_closed_error(&e) => {
                self.logger
                    .warn("channel already closed", Some(&e), &[("tag", &tag)]);
            }
            Err(e) => {
                self.logger
                    .error("failed to close channel", Some(&e), &[("tag", &tag)]);
            }
        }
    }
}

/// Errors caused by a channel or connection that is already gone.
pub(crate) fn is_closed_error(error: &lapin::Error) -> bool {
    if matches!(
        error,
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_)
    ) {
        return true;
    }

    let message = error.to_string();
    [
        "channel/connection is not open",
        "channel is closed",
        "connection is closed",
        "Exception (504)",
    ]
    .iter()
    .any(|pattern| message.contains(pattern))
}

/// Read deliveries one at a time until stopped or the consumer ends.
async fn consume(
    queue: String,
    tag: String,
    mut consumer: Consumer,
    handler: DeliveryHandler,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.changed() => break,
            next = consumer.next() => next,
        };

        match next {
            Some(Ok(mut delivery)) => {
                let body = std::mem::take(&mut delivery.data);
                let message =
                    message_from_parts(delivery.routing_key.as_str(), &delivery.properties, body);
                handler.handle(message, &delivery.acker).await;
            }
            Some(Err(e)) => {
                warn!(queue = %queue, tag = %tag, error = %e, "Consumer error, stopping");
                break;
            }
            None => break,
        }
    }

    debug!(queue = %queue, tag = %tag, "Consumer stopped");
}

#[async_trait]
impl Broker for AmqpConnection {
    type SubscribeConfig = AmqpSubscribeConfig;
    type PublishReceipt = ();

    async fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions<Self::SubscribeConfig>,
        handler: HandlerFunc,
    ) -> Result<(), QueueError> {
        AmqpConnection::subscribe(self, topic, options, handler).await
    }

    async fn publish(
        &self,
        ctx: &RequestContext,
        topic: &str,
        message: Message,
    ) -> Result<Self::PublishReceipt, QueueError> {
        AmqpConnection::publish(self, ctx, topic, message).await
    }

    async fn shutdown(&self) -> Result<(), QueueError> {
        AmqpConnection::shutdown(self).await
    }

    fn use_middleware(&self, middleware: Middleware) -> Result<(), QueueError> {
        AmqpConnection::use_middleware(self, middleware)
    }

    fn middlewares(&self) -> Vec<Middleware> {
        AmqpConnection::middlewares(self)
    }
}
