//! Task worker pool: dequeues by queue priority, runs handlers and settles
//! each task as done, retried or archived.

use crate::config::{TaskConfig, TaskSubscribeConfig};
use crate::priority::WeightedRoundRobin;
use crate::store::{Dequeued, TaskStore};
use crate::task::TaskMessage;
use chrono::{DateTime, Utc};
use messaging::{
    BackoffStrategy, Dispatch, Dispatcher, HandlerFunc, HandlerOutcome, Middleware,
    MiddlewareStack, QueueError, QueueLogger, QueueMetrics, SubscribeOptions,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const BROKER: &str = "task";

const NO_HANDLER: &str = "no handler registered for task type";

const LEASE_EXPIRED: &str = "task lease expired";

/// What to do with a task whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Retry(DateTime<Utc>),
    Archive,
}

/// Retry with backoff while `retried < max_retry`, archive afterwards.
pub fn failure_action(
    message: &TaskMessage,
    now: DateTime<Utc>,
    backoff: &BackoffStrategy,
) -> FailureAction {
    if message.retried >= message.max_retry {
        return FailureAction::Archive;
    }
    let delay = chrono::Duration::from_std(backoff.delay(message.retried))
        .unwrap_or(chrono::Duration::MAX);
    FailureAction::Retry(now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC))
}

/// Handle to the worker pool. Clones share the same pool.
#[derive(Clone)]
pub struct TaskServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    store: Arc<dyn TaskStore>,
    config: TaskConfig,
    handlers: RwLock<HashMap<String, Dispatcher>>,
    middlewares: MiddlewareStack,
    logger: Arc<dyn QueueLogger>,
    permits: Arc<Semaphore>,
    stop: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    shut_down: AtomicBool,
}

impl TaskServer {
    pub fn new(store: Arc<dyn TaskStore>, config: TaskConfig, logger: Arc<dyn QueueLogger>) -> Self {
        let (stop, _) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            inner: Arc::new(ServerInner {
                store,
                config,
                handlers: RwLock::new(HashMap::new()),
                middlewares: MiddlewareStack::new(),
                logger,
                permits,
                stop,
                loops: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &TaskConfig {
        &self.inner.config
    }

    pub fn use_middleware(&self, middleware: Middleware) -> Result<(), QueueError> {
        self.inner.middlewares.use_middleware(middleware)
    }

    pub fn middlewares(&self) -> Vec<Middleware> {
        self.inner.middlewares.snapshot()
    }

    /// Register `handler` for `type_name` with panic recovery.
    pub fn handle(&self, type_name: &str, handler: HandlerFunc) -> Result<(), QueueError> {
        self.register(type_name, handler, false)
    }

    /// Register `handler` for `type_name`. Only `no_recovery` is read from
    /// the options; concurrency is pool wide.
    pub fn subscribe(
        &self,
        type_name: &str,
        options: SubscribeOptions<TaskSubscribeConfig>,
        handler: HandlerFunc,
    ) -> Result<(), QueueError> {
        self.register(type_name, handler, options.config.no_recovery)
    }

    fn register(&self, type_name: &str, handler: HandlerFunc, no_recovery: bool) -> Result<(), QueueError> {
        let chain = self.inner.middlewares.apply(handler, no_recovery);
        let dispatcher = Dispatcher::new(
            chain,
            self.inner.logger.clone(),
            QueueMetrics::new(BROKER, type_name),
        );

        let mut handlers = self
            .inner
            .handlers
            .write()
            .map_err(|_| QueueError::subscribe(type_name, "handler registry poisoned"))?;
        if handlers.contains_key(type_name) {
            return Err(QueueError::subscribe(type_name, "handler already registered"));
        }
        handlers.insert(type_name.to_string(), dispatcher);
        Ok(())
    }

    pub fn handler_types(&self) -> Vec<String> {
        let handlers = self.inner.handlers.read().unwrap_or_else(|p| p.into_inner());
        let mut types: Vec<String> = handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Tasks currently being processed.
    pub fn in_flight(&self) -> usize {
        self.inner
            .config
            .concurrency
            .max(1)
            .saturating_sub(self.inner.permits.available_permits())
    }

    /// Spawn the dequeue loop and the forwarder.
    pub fn start(&self) -> Result<(), QueueError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(QueueError::shutdown("task server has been shut down"));
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(QueueError::config("task server already running"));
        }
        if self.inner.config.queues.values().all(|w| *w == 0) {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(QueueError::config("at least one queue with a positive weight is required"));
        }

        let queues = render_queues(&self.inner.config);
        self.inner.logger.info(
            "Starting task server",
            &[
                ("concurrency", &self.inner.config.concurrency),
                ("queues", &queues),
            ],
        );

        let processor = tokio::spawn(run_processor(self.inner.clone(), self.inner.stop.subscribe()));
        let forwarder = tokio::spawn(run_forwarder(self.inner.clone(), self.inner.stop.subscribe()));
        self.inner
            .loops
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend([processor, forwarder]);
        Ok(())
    }

    /// Move due scheduled and retry tasks of every queue to pending.
    pub async fn forward_due(&self) -> Result<usize, QueueError> {
        self.inner.forward_due().await
    }

    /// Retry or archive active tasks whose lease ran out, which happens when
    /// the worker holding them died.
    pub async fn recover_expired(&self) -> Result<usize, QueueError> {
        self.inner.recover_expired().await
    }

    /// Stop dequeuing, then wait up to `shutdown_timeout` for in-flight
    /// tasks. Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.logger.info("Stopping task server", &[]);

        self.inner.stop.send_replace(true);
        let loops = std::mem::take(&mut *self.inner.loops.lock().unwrap_or_else(|p| p.into_inner()));
        for handle in loops {
            let _ = handle.await;
        }

        let total = u32::try_from(self.inner.config.concurrency.max(1)).unwrap_or(u32::MAX);
        let timeout = self.inner.config.shutdown_timeout;
        let drained = tokio::time::timeout(timeout, self.inner.permits.acquire_many(total)).await;
        self.inner.running.store(false, Ordering::SeqCst);

        match drained {
            Ok(_) => {
                self.inner.logger.info("Task server stopped", &[]);
                Ok(())
            }
            Err(_) => {
                let in_flight = self.in_flight();
                let err = QueueError::shutdown(format!(
                    "{in_flight} tasks still running after {}s",
                    timeout.as_secs()
                ));
                self.inner
                    .logger
                    .warn("Timed out waiting for in-flight tasks", Some(&err), &[]);
                Err(err)
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn process(&self, task: Dequeued) {
        self.inner.process(task).await
    }
}

fn render_queues(config: &TaskConfig) -> String {
    config
        .queues
        .iter()
        .map(|(name, weight)| format!("{name}:{weight}"))
        .collect::<Vec<_>>()
        .join(",")
}

async fn run_processor(inner: Arc<ServerInner>, mut stop: watch::Receiver<bool>) {
    let mut priority = WeightedRoundRobin::new(&inner.config.queues);

    loop {
        if *stop.borrow() {
            break;
        }

        let permit = tokio::select! {
            biased;
            _ = stop.changed() => break,
            permit = inner.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let idle = match inner.next_task(&mut priority).await {
            Ok(Some(task)) => {
                let inner = inner.clone();
                tokio::spawn(async move {
                    inner.process(task).await;
                    drop(permit);
                });
                continue;
            }
            Ok(None) => inner.config.poll_interval,
            Err(e) => {
                inner.logger.error("Failed to dequeue task", Some(&e), &[]);
                inner.config.poll_interval
            }
        };
        drop(permit);

        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = tokio::time::sleep(idle) => {}
        }
    }

    tracing::debug!("Task dequeue loop stopped");
}

async fn run_forwarder(inner: Arc<ServerInner>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.config.forward_interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = inner.recover_expired().await {
                    inner.logger.warn("Failed to recover expired tasks", Some(&e), &[]);
                }
                if let Err(e) = inner.forward_due().await {
                    inner.logger.warn("Failed to forward due tasks", Some(&e), &[]);
                }
            }
        }
    }

    tracing::debug!("Task forwarder stopped");
}

impl ServerInner {
    async fn next_task(&self, priority: &mut WeightedRoundRobin) -> Result<Option<Dequeued>, QueueError> {
        for queue in priority.poll_order() {
            if let Some(task) = self.store.dequeue(&queue, self.lease_deadline()).await? {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    async fn forward_due(&self) -> Result<usize, QueueError> {
        let now = Utc::now();
        let mut moved = 0;
        for queue in self.config.queues.keys() {
            moved += self.store.forward(queue, now).await?;
        }
        Ok(moved)
    }

    async fn recover_expired(&self) -> Result<usize, QueueError> {
        let now = Utc::now();
        let mut recovered = 0;
        for queue in self.config.queues.keys() {
            for task in self.store.expired_leases(queue, now).await? {
                let type_name = task.message.type_name.clone();
                let id = task.message.id.clone();
                self.logger
                    .warn("Recovering task with expired lease", None, &[("type", &type_name), ("id", &id)]);
                let metrics = QueueMetrics::new(BROKER, &type_name);
                let settled = self.fail(&task, &metrics, LEASE_EXPIRED).await;
                self.report_settle(settled, &metrics, &type_name, &id);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    fn lease_deadline(&self) -> DateTime<Utc> {
        let lease = chrono::Duration::from_std(self.config.lease_duration).unwrap_or(chrono::Duration::MAX);
        Utc::now().checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Drive `work`, renewing the task's lease every third of the lease
    /// duration until it completes.
    async fn with_lease<F: Future>(&self, task: &Dequeued, work: F) -> F::Output {
        let mut work = std::pin::pin!(work);
        let period = (self.config.lease_duration / 3).max(Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.store.extend_lease(task, self.lease_deadline()).await {
                        self.logger
                            .warn("Failed to extend task lease", Some(&e), &[("id", &task.message.id)]);
                    }
                }
            }
        }
    }

    fn dispatcher(&self, type_name: &str) -> Option<Dispatcher> {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(type_name)
            .cloned()
    }

    async fn process(&self, task: Dequeued) {
        let type_name = task.message.type_name.clone();
        let id = task.message.id.clone();

        let Some(dispatcher) = self.dispatcher(&type_name) else {
            self.logger
                .warn("No handler for task type, archiving", None, &[("type", &type_name), ("id", &id)]);
            let metrics = QueueMetrics::new(BROKER, &type_name);
            metrics.message_dropped("unknown_type");
            let settled = self.store.archive(&task, NO_HANDLER).await;
            self.report_settle(settled, &metrics, &type_name, &id);
            return;
        };

        let envelope = task.message.to_envelope();
        let deadline = task.message.timeout();
        let run = async {
            match deadline {
                Some(limit) => tokio::time::timeout(limit, dispatcher.dispatch(envelope))
                    .await
                    .map_err(|_| limit),
                None => Ok(dispatcher.dispatch(envelope).await),
            }
        };
        let result = self.with_lease(&task, run).await;

        let metrics = dispatcher.metrics();
        let settled = match result {
            Ok(Dispatch::Handled(HandlerOutcome::Ok)) => {
                metrics.message_acked();
                self.store.done(&task).await
            }
            Ok(Dispatch::Dropped(e)) => self.store.archive(&task, &e.to_string()).await,
            Ok(Dispatch::Handled(HandlerOutcome::Failed(e))) => {
                self.fail(&task, metrics, &e.to_string()).await
            }
            Ok(Dispatch::Handled(HandlerOutcome::Panicked(p))) => {
                self.fail(&task, metrics, &p.to_string()).await
            }
            Err(limit) => {
                let reason = format!("task deadline of {limit:?} exceeded");
                self.logger
                    .warn("Task timed out", None, &[("type", &type_name), ("id", &id)]);
                self.fail(&task, metrics, &reason).await
            }
        };
        self.report_settle(settled, metrics, &type_name, &id);
    }

    async fn fail(&self, task: &Dequeued, metrics: &QueueMetrics, reason: &str) -> Result<(), QueueError> {
        match failure_action(&task.message, Utc::now(), &self.config.retry_backoff) {
            FailureAction::Retry(at) => {
                metrics.message_nacked(true);
                self.store.retry(task, at, reason).await
            }
            FailureAction::Archive => {
                metrics.message_dropped("max_retry");
                self.logger.warn(
                    "Task exhausted its retries, archiving",
                    None,
                    &[
                        ("type", &task.message.type_name),
                        ("id", &task.message.id),
                        ("retried", &task.message.retried),
                    ],
                );
                self.store.archive(task, reason).await
            }
        }
    }

    fn report_settle(&self, settled: Result<(), QueueError>, metrics: &QueueMetrics, type_name: &str, id: &str) {
        if let Err(e) = settled {
            metrics.settle_failed();
            self.logger
                .error("Failed to settle task", Some(&e), &[("type", &type_name), ("id", &id)]);
        }
    }
}
