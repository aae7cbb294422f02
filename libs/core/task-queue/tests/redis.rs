//! Integration tests against a real Redis server (requires Docker).

use chrono::Utc;
use messaging::{handler_fn, BackoffStrategy, HandlerError, Message, RequestContext};
use redis::AsyncCommands;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use task_queue::{
    build_task, keys, RedisStore, TaskConfig, TaskConnection, TaskOptions, TaskState, TaskStore,
};
use test_utils::{TestNames, TestRedis};

fn config(redis: &TestRedis) -> TaskConfig {
    TaskConfig::new(redis.host(), redis.port())
        .with_concurrency(4)
        .with_poll_interval(Duration::from_millis(50))
        .with_forward_interval(Duration::from_millis(200))
        .with_shutdown_timeout(Duration::from_secs(5))
}

async fn wait_for(counter: &AtomicUsize, expected: usize) {
    for _ in 0..100 {
        if counter.load(Ordering::SeqCst) >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn counting(counter: Arc<AtomicUsize>, failures: usize) -> messaging::HandlerFunc {
    handler_fn(move |_: RequestContext, _: Message| {
        let counter = counter.clone();
        async move {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            if attempt < failures {
                Err(HandlerError::failed(format!("attempt {attempt} failed")))
            } else {
                Ok(())
            }
        }
    })
}

#[tokio::test]
async fn test_connect_fails_fast_without_server() {
    let result = tokio::time::timeout(
        Duration::from_secs(60),
        TaskConnection::connect(TaskConfig::new("127.0.0.1", 1)),
    )
    .await
    .expect("connect did not give up");

    match result {
        Err(e) => assert_eq!(e.kind(), "connection"),
        Ok(_) => panic!("connected to a closed port"),
    }
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_enqueue_and_process_by_priority() {
    let redis = TestRedis::new().await;
    let tasks = TaskConnection::connect(config(&redis)).await.unwrap();
    let names = TestNames::from_test_name("task_priority");
    let task_type = names.queue("email");

    let processed = Arc::new(AtomicUsize::new(0));
    tasks.server().handle(&task_type, counting(processed.clone(), 0)).unwrap();

    for queue in ["critical", "default", "low"] {
        let info = tasks
            .client()
            .enqueue(&build_task(&task_type, queue, Some(TaskOptions::new().queue(queue))))
            .await
            .unwrap();
        assert_eq!(info.state, TaskState::Pending);
    }

    let mut conn = redis.connection();
    let queues: Vec<String> = conn.smembers(keys::queues()).await.unwrap();
    assert_eq!(queues.len(), 3);

    tasks.run().await.unwrap();
    wait_for(&processed, 3).await;
    tasks.shutdown().await.unwrap();

    assert_eq!(processed.load(Ordering::SeqCst), 3);
    for queue in ["critical", "default", "low"] {
        let pending: usize = conn.llen(keys::pending(queue)).await.unwrap();
        let active: usize = conn.llen(keys::active(queue)).await.unwrap();
        assert_eq!((pending, active), (0, 0), "queue {queue}");
    }
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_delayed_task_waits_in_scheduled_set() {
    let redis = TestRedis::new().await;
    let tasks = TaskConnection::connect(config(&redis)).await.unwrap();

    let processed = Arc::new(AtomicUsize::new(0));
    tasks.server().handle("report:build", counting(processed.clone(), 0)).unwrap();

    let options = TaskOptions::new().process_in(Duration::from_secs(2));
    let info = tasks
        .client()
        .enqueue(&build_task("report:build", Vec::new(), Some(options)))
        .await
        .unwrap();
    assert_eq!(info.state, TaskState::Scheduled);

    let mut conn = redis.connection();
    let scheduled: usize = conn.zcard(keys::scheduled("default")).await.unwrap();
    assert_eq!(scheduled, 1);

    tasks.run().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(processed.load(Ordering::SeqCst), 0);

    wait_for(&processed, 1).await;
    tasks.shutdown().await.unwrap();

    assert_eq!(processed.load(Ordering::SeqCst), 1);
    let scheduled: usize = conn.zcard(keys::scheduled("default")).await.unwrap();
    assert_eq!(scheduled, 0);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_failed_task_is_retried_until_success() {
    let redis = TestRedis::new().await;
    let tasks = TaskConnection::connect(
        config(&redis).with_retry_backoff(BackoffStrategy::Fixed(Duration::ZERO)),
    )
    .await
    .unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    tasks.server().handle("flaky", counting(attempts.clone(), 2)).unwrap();
    tasks
        .client()
        .enqueue(&build_task("flaky", Vec::new(), None))
        .await
        .unwrap();

    tasks.run().await.unwrap();
    wait_for(&attempts, 3).await;
    tasks.shutdown().await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let mut conn = redis.connection();
    let retry: usize = conn.zcard(keys::retry("default")).await.unwrap();
    let archived: usize = conn.zcard(keys::archived("default")).await.unwrap();
    assert_eq!((retry, archived), (0, 0));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_unknown_type_and_exhausted_tasks_are_archived() {
    let redis = TestRedis::new().await;
    let tasks = TaskConnection::connect(config(&redis)).await.unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    tasks.server().handle("doomed", counting(attempts.clone(), usize::MAX)).unwrap();

    let client = tasks.client();
    client.enqueue(&build_task("nobody:home", Vec::new(), None)).await.unwrap();
    client
        .enqueue(&build_task("doomed", Vec::new(), Some(TaskOptions::new().max_retry(0))))
        .await
        .unwrap();

    tasks.run().await.unwrap();
    wait_for(&attempts, 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    tasks.shutdown().await.unwrap();

    let mut conn = redis.connection();
    let archived: Vec<String> = conn.zrange(keys::archived("default"), 0, -1).await.unwrap();
    assert_eq!(archived.len(), 2);
    assert!(archived.iter().any(|raw| raw.contains("no handler registered")));
    assert!(archived.iter().any(|raw| raw.contains("attempt 0 failed")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires docker"]
async fn test_scheduler_enqueues_on_tick() {
    let redis = TestRedis::new().await;
    let tasks = TaskConnection::connect(config(&redis)).await.unwrap();

    let ticks = Arc::new(AtomicUsize::new(0));
    tasks.server().handle("heartbeat", counting(ticks.clone(), 0)).unwrap();

    let scheduler = tasks.new_scheduler().await.unwrap();
    scheduler
        .register("* * * * * *", build_task("heartbeat", Vec::new(), None))
        .await
        .unwrap();

    tasks.run().await.unwrap();
    wait_for(&ticks, 2).await;
    tasks.shutdown().await.unwrap();

    assert!(ticks.load(Ordering::SeqCst) >= 2);
    let err = tasks
        .client()
        .enqueue(&build_task("heartbeat", Vec::new(), None))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "publish");
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_task_of_dead_worker_is_recovered() {
    let redis = TestRedis::new().await;
    let config = config(&redis).with_retry_backoff(BackoffStrategy::Fixed(Duration::ZERO));

    let store = RedisStore::connect(&config).await.unwrap();
    store
        .enqueue(&build_task("orphan", Vec::new(), None).to_message())
        .await
        .unwrap();
    let claimed = store
        .dequeue("default", Utc::now() - chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert!(claimed.is_some());

    let mut conn = redis.connection();
    let leased: usize = conn.zcard(keys::lease("default")).await.unwrap();
    assert_eq!(leased, 1);

    let tasks = TaskConnection::connect(config).await.unwrap();
    let processed = Arc::new(AtomicUsize::new(0));
    tasks.server().handle("orphan", counting(processed.clone(), 0)).unwrap();
    tasks.run().await.unwrap();
    wait_for(&processed, 1).await;
    tasks.shutdown().await.unwrap();

    assert_eq!(processed.load(Ordering::SeqCst), 1);
    let active: usize = conn.llen(keys::active("default")).await.unwrap();
    let leased: usize = conn.zcard(keys::lease("default")).await.unwrap();
    assert_eq!((active, leased), (0, 0));
}
