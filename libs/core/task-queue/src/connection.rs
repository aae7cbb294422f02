//! The task adapter as a whole: client, server and optional scheduler over
//! one Redis store.

use crate::client::TaskClient;
use crate::config::{TaskConfig, TaskSubscribeConfig};
use crate::scheduler::TaskScheduler;
use crate::server::TaskServer;
use crate::store::{RedisStore, TaskStore};
use crate::task::TaskInfo;
use async_trait::async_trait;
use messaging::{
    Broker, HandlerFunc, Message, Middleware, QueueError, QueueLogger, RequestContext,
    SubscribeOptions, TracingLogger,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct TaskConnection {
    store: Arc<dyn TaskStore>,
    client: Arc<TaskClient>,
    server: TaskServer,
    scheduler: Mutex<Option<Arc<TaskScheduler>>>,
    logger: Arc<dyn QueueLogger>,
    shut_down: AtomicBool,
}

impl TaskConnection {
    /// Connect to Redis; an unreachable server fails here.
    pub async fn connect(config: TaskConfig) -> Result<Self, QueueError> {
        Self::connect_with_logger(config, Arc::new(TracingLogger)).await
    }

    pub async fn connect_with_logger(
        config: TaskConfig,
        logger: Arc<dyn QueueLogger>,
    ) -> Result<Self, QueueError> {
        let store = RedisStore::connect(&config).await.map_err(|e| {
            logger.error(
                "Failed to connect to Redis",
                Some(&e),
                &[("host", &config.host), ("port", &config.port)],
            );
            e
        })?;
        logger.info(
            "Connected to Redis task store",
            &[("host", &config.host), ("db", &config.db)],
        );
        Ok(Self::with_store(Arc::new(store), config, logger))
    }

    /// Build over an existing store.
    pub fn with_store(store: Arc<dyn TaskStore>, config: TaskConfig, logger: Arc<dyn QueueLogger>) -> Self {
        let client = Arc::new(TaskClient::new(store.clone(), logger.clone()));
        let server = TaskServer::new(store.clone(), config, logger.clone());
        Self {
            store,
            client,
            server,
            scheduler: Mutex::new(None),
            logger,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> Arc<TaskClient> {
        self.client.clone()
    }

    pub fn server(&self) -> &TaskServer {
        &self.server
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        self.store.clone()
    }

    /// Create the scheduler. Only one may exist per connection.
    pub async fn new_scheduler(&self) -> Result<Arc<TaskScheduler>, QueueError> {
        let mut slot = self.scheduler.lock().await;
        if slot.is_some() {
            return Err(QueueError::config("task scheduler already created"));
        }
        let scheduler = Arc::new(TaskScheduler::new(self.client.clone(), self.logger.clone()).await?);
        *slot = Some(scheduler.clone());
        Ok(scheduler)
    }

    pub async fn scheduler(&self) -> Option<Arc<TaskScheduler>> {
        self.scheduler.lock().await.clone()
    }

    pub fn use_middleware(&self, middleware: Middleware) -> Result<(), QueueError> {
        self.server.use_middleware(middleware)
    }

    pub fn middlewares(&self) -> Vec<Middleware> {
        self.server.middlewares()
    }

    pub fn subscribe(
        &self,
        type_name: &str,
        options: SubscribeOptions<TaskSubscribeConfig>,
        handler: HandlerFunc,
    ) -> Result<(), QueueError> {
        self.server.subscribe(type_name, options, handler)
    }

    pub async fn publish(
        &self,
        ctx: &RequestContext,
        type_name: &str,
        message: Message,
    ) -> Result<TaskInfo, QueueError> {
        self.client.enqueue_message(ctx, type_name, message).await
    }

    /// Start the scheduler, if one was created, then the server.
    pub async fn run(&self) -> Result<(), QueueError> {
        if let Some(scheduler) = self.scheduler().await {
            scheduler.start().await?;
        }
        self.server.start()
    }

    /// Stop the scheduler, close the client, then drain the server.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.logger.info("Starting task queue shutdown...", &[]);

        let mut first_error = None;
        if let Some(scheduler) = self.scheduler().await {
            if let Err(e) = scheduler.shutdown().await {
                self.logger.error("Failed to stop task scheduler", Some(&e), &[]);
                first_error.get_or_insert(e);
            }
        }

        self.client.close();

        if let Err(e) = self.server.shutdown().await {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                self.logger.info("Task queue shutdown completed", &[]);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Broker for TaskConnection {
    type SubscribeConfig = TaskSubscribeConfig;
    type PublishReceipt = TaskInfo;

    async fn subscribe(
        &self,
        topic: &str,
        options: SubscribeOptions<Self::SubscribeConfig>,
        handler: HandlerFunc,
    ) -> Result<(), QueueError> {
        TaskConnection::subscribe(self, topic, options, handler)
    }

    async fn publish(
        &self,
        ctx: &RequestContext,
        topic: &str,
        message: Message,
    ) -> Result<Self::PublishReceipt, QueueError> {
        TaskConnection::publish(self, ctx, topic, message).await
    }

    async fn shutdown(&self) -> Result<(), QueueError> {
        TaskConnection::shutdown(self).await
    }

    fn use_middleware(&self, middleware: Middleware) -> Result<(), QueueError> {
        TaskConnection::use_middleware(self, middleware)
    }

    fn middlewares(&self) -> Vec<Middleware> {
        TaskConnection::middlewares(self)
    }
}
