//! Executor integration tests.
//!
//! End-to-end scenarios through the public API: ordering, cancellation,
//! failure capture, genealogy, timeouts and shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use taskloom::{
    AccessGate, Error, Executor, ExecutorConfig, GateConfig, KeyValueStore, PoolConfig, Priority, SchedulerConfig,
    StoreConfig, TaskId, TaskStatus,
};
use tokio::sync::Mutex;
use tokio::time::sleep;

const WAIT: Option<Duration> = Some(Duration::from_secs(10));

fn executor_with(aging: Duration, pool: PoolConfig) -> Executor {
    let gate = Arc::new(AccessGate::new(GateConfig::default()));
    let store = Arc::new(KeyValueStore::new(StoreConfig::default(), gate));
    Executor::new(
        ExecutorConfig {
            scheduler: SchedulerConfig {
                aging_threshold: aging,
                max_queue: None,
            },
            pool,
            ..Default::default()
        },
        store,
    )
    .unwrap()
}

fn single_worker() -> PoolConfig {
    PoolConfig {
        min_workers: 1,
        max_workers: 1,
        idle_poll: Duration::from_millis(10),
        shutdown_grace: Duration::from_millis(200),
        ..Default::default()
    }
}

fn executor() -> Executor {
    executor_with(Duration::from_secs(60), single_worker())
}

async fn wait_for_status(executor: &Executor, id: &TaskId, status: TaskStatus) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if executor.status(id) == Some(status) {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Scenario: three Apex and three Deferred tasks on one worker
///
/// Every Apex task finishes before any Deferred task starts.
#[tokio::test]
async fn test_apex_runs_before_deferred() {
    let executor = executor();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut ids = Vec::new();
    for (label, priority) in [
        ("deferred-0", Priority::Deferred),
        ("deferred-1", Priority::Deferred),
        ("deferred-2", Priority::Deferred),
        ("apex-0", Priority::Apex),
        ("apex-1", Priority::Apex),
        ("apex-2", Priority::Apex),
    ] {
        let order = order.clone();
        let id = executor
            .submit(
                move |_ctx, _args| async move {
                    order.lock().await.push(format!("start:{label}"));
                    sleep(Duration::from_millis(5)).await;
                    order.lock().await.push(format!("end:{label}"));
                    Ok(Value::Null)
                },
                Value::Null,
                priority,
                None,
            )
            .unwrap();
        ids.push(id);
    }

    executor.start();
    for result in executor.await_all(&ids, WAIT).await {
        result.unwrap();
    }

    let order = order.lock().await;
    let last_apex_end = order.iter().rposition(|e| e.starts_with("end:apex")).unwrap();
    let first_deferred_start = order.iter().position(|e| e.starts_with("start:deferred")).unwrap();
    assert!(last_apex_end < first_deferred_start, "order was {order:?}");
    // FIFO within a level
    assert_eq!(order[0], "start:apex-0");
    assert_eq!(order[6], "start:deferred-0");
    executor.stop().await;
}

/// Scenario: cancel a task while it is still queued
///
/// It is marked Cancelled and never executes.
#[tokio::test]
async fn test_cancel_queued_task_never_runs() {
    let executor = executor();
    let ran = Arc::new(AtomicBool::new(false));

    let flag = ran.clone();
    let id = executor
        .submit(
            move |_ctx, _args| async move {
                flag.store(true, Ordering::SeqCst);
                Ok(Value::Null)
            },
            Value::Null,
            Priority::Nominal,
            None,
        )
        .unwrap();

    assert!(executor.cancel(&id));
    assert_eq!(executor.status(&id), Some(TaskStatus::Cancelled));
    // Second cancel is a no-op on a terminal task
    assert!(!executor.cancel(&id));

    executor.start();
    let marker = executor
        .submit(|_c, _a| async { Ok(json!("after")) }, Value::Null, Priority::Deferred, None)
        .unwrap();
    executor.await_task(&marker, WAIT).await.unwrap();

    assert!(!ran.load(Ordering::SeqCst));
    assert!(matches!(
        executor.await_task(&id, WAIT).await,
        Err(Error::TaskCancelled { .. })
    ));
    executor.stop().await;
}

/// Scenario: cancel a running task that polls its checkpoint
#[tokio::test]
async fn test_cooperative_cancel_of_running_task() {
    let executor = executor();
    executor.start();

    let id = executor
        .submit(
            |ctx, _args| async move {
                loop {
                    ctx.checkpoint()?;
                    sleep(Duration::from_millis(5)).await;
                }
            },
            Value::Null,
            Priority::Nominal,
            None,
        )
        .unwrap();
    assert!(wait_for_status(&executor, &id, TaskStatus::Running).await);

    assert!(executor.cancel(&id));
    assert!(matches!(
        executor.await_task(&id, WAIT).await,
        Err(Error::TaskCancelled { .. })
    ));
    assert_eq!(executor.status(&id), Some(TaskStatus::Cancelled));
    executor.stop().await;
}

/// Scenario: a running task that never checks the flag runs to completion
#[tokio::test]
async fn test_cancel_is_cooperative_only() {
    let executor = executor();
    executor.start();

    let id = executor
        .submit(
            |_ctx, _args| async move {
                sleep(Duration::from_millis(100)).await;
                Ok(json!("finished anyway"))
            },
            Value::Null,
            Priority::Nominal,
            None,
        )
        .unwrap();
    assert!(wait_for_status(&executor, &id, TaskStatus::Running).await);
    assert!(executor.cancel(&id));

    assert_eq!(executor.await_task(&id, WAIT).await.unwrap(), json!("finished anyway"));
    executor.stop().await;
}

/// Scenario: a panicking task does not disturb its siblings
#[tokio::test]
async fn test_panic_is_captured() {
    let executor = executor();
    executor.start();

    let panicking = executor
        .submit(
            |_ctx, _args| async move {
                let values: Vec<i32> = Vec::new();
                Ok(json!(values[3]))
            },
            Value::Null,
            Priority::Apex,
            None,
        )
        .unwrap();
    let sibling = executor
        .submit(|_c, _a| async { Ok(json!("fine")) }, Value::Null, Priority::Nominal, None)
        .unwrap();

    match executor.await_task(&panicking, WAIT).await {
        Err(Error::TaskFailed { failure, .. }) => {
            assert!(failure.panicked);
            assert!(failure.message.contains("index out of bounds"), "{}", failure.message);
        }
        other => panic!("expected a captured panic, got {other:?}"),
    }
    assert_eq!(executor.await_task(&sibling, WAIT).await.unwrap(), json!("fine"));

    let stats = executor.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.pool.workers, 1);
    executor.stop().await;
}

/// Scenario: genealogy through explicit parent ids
#[tokio::test]
async fn test_parent_child_linkage() {
    let executor = executor();

    let parent = executor
        .submit(|_c, _a| async { Ok(Value::Null) }, Value::Null, Priority::Nominal, None)
        .unwrap();
    let first = executor
        .submit(|_c, _a| async { Ok(Value::Null) }, Value::Null, Priority::Nominal, Some(&parent))
        .unwrap();
    let second = executor
        .submit(|_c, _a| async { Ok(Value::Null) }, Value::Null, Priority::Apex, Some(&parent))
        .unwrap();

    assert_eq!(executor.children(&parent), vec![first.clone(), second.clone()]);
    for child in [&first, &second] {
        let record = executor.record(child).unwrap();
        assert_eq!(record.parent_id.as_ref(), Some(&parent));
        assert!(!record.is_root());
    }
    assert!(executor.record(&parent).unwrap().is_root());
}

/// Scenario: an await deadline shorter than the task
#[tokio::test]
async fn test_await_timeout_leaves_task_running() {
    let executor = executor();
    executor.start();

    let id = executor
        .submit(
            |_ctx, _args| async move {
                sleep(Duration::from_millis(300)).await;
                Ok(json!(7))
            },
            Value::Null,
            Priority::Nominal,
            None,
        )
        .unwrap();

    let err = executor
        .await_task(&id, Some(Duration::from_millis(30)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AwaitTimeout { .. }));
    assert!(err.is_recoverable());

    assert_eq!(executor.await_task(&id, WAIT).await.unwrap(), json!(7));
    executor.stop().await;
}

/// Scenario: stopping the executor while awaits are pending
#[tokio::test]
async fn test_stop_fails_pending_awaits() {
    let executor = Arc::new(executor());
    executor.start();

    let running = executor
        .submit(
            |_ctx, _args| async move {
                sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            },
            Value::Null,
            Priority::Apex,
            None,
        )
        .unwrap();
    let queued = executor
        .submit(|_c, _a| async { Ok(Value::Null) }, Value::Null, Priority::Deferred, None)
        .unwrap();
    assert!(wait_for_status(&executor, &running, TaskStatus::Running).await);

    let awaiter = {
        let executor = executor.clone();
        let running = running.clone();
        tokio::spawn(async move { executor.await_task(&running, None).await })
    };
    sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    executor.stop().await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let result = tokio::time::timeout(Duration::from_secs(1), awaiter)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::ShutdownInProgress)));
    assert_eq!(executor.status(&queued), Some(TaskStatus::Cancelled));
    assert!(matches!(
        executor.await_task(&queued, WAIT).await,
        Err(Error::TaskCancelled { .. }) | Err(Error::ShutdownInProgress)
    ));
}

/// Scenario: a Deferred task under a continuous stream of Apex arrivals
///
/// Aging promotes it one level per threshold, so it starts within a few
/// thresholds instead of starving.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deferred_not_starved_by_apex_stream() {
    let executor = Arc::new(executor_with(Duration::from_millis(50), single_worker()));
    executor.start();

    let deferred = executor
        .submit(|_c, _a| async { Ok(json!("deferred done")) }, Value::Null, Priority::Deferred, None)
        .unwrap();
    let submitted_at = Instant::now();

    let stop_flood = Arc::new(AtomicBool::new(false));
    let flooded = Arc::new(AtomicUsize::new(0));
    let flood = {
        let executor = executor.clone();
        let stop_flood = stop_flood.clone();
        let flooded = flooded.clone();
        tokio::spawn(async move {
            while !stop_flood.load(Ordering::SeqCst) {
                let _ = executor.submit(
                    |_c, _a| async {
                        sleep(Duration::from_millis(10)).await;
                        Ok(Value::Null)
                    },
                    Value::Null,
                    Priority::Apex,
                    None,
                );
                flooded.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let result = executor.await_task(&deferred, Some(Duration::from_secs(3))).await;
    let waited = submitted_at.elapsed();
    stop_flood.store(true, Ordering::SeqCst);
    flood.await.unwrap();

    assert_eq!(result.unwrap(), json!("deferred done"));
    assert!(waited < Duration::from_secs(1), "deferred task waited {waited:?}");
    // Apex work was still arriving while the deferred task ran
    assert!(flooded.load(Ordering::SeqCst) > 5);
    executor.stop().await;
}

/// Scenario: tasks share working memory through the store
#[tokio::test]
async fn test_tasks_share_store() {
    let executor = executor();
    executor.start();

    let writer = executor
        .submit(
            |ctx, args| async move {
                ctx.store().set("shared:greeting", args, None).await?;
                Ok(Value::Null)
            },
            json!("hello"),
            Priority::Apex,
            None,
        )
        .unwrap();
    executor.await_task(&writer, WAIT).await.unwrap();

    let reader = executor
        .submit(
            |ctx, _args| async move { Ok(ctx.store().get("shared:greeting")?) },
            Value::Null,
            Priority::Nominal,
            None,
        )
        .unwrap();
    assert_eq!(executor.await_task(&reader, WAIT).await.unwrap(), json!("hello"));
    assert_eq!(executor.store().list(Some("shared:")), vec!["shared:greeting"]);
    executor.stop().await;
}

/// Scenario: many concurrent submitters against a scaling pool
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submitters() {
    let executor = Arc::new(executor_with(
        Duration::from_secs(5),
        PoolConfig {
            min_workers: 1,
            max_workers: 4,
            sampling_interval: Duration::from_millis(10),
            sampling_window_size: 2,
            idle_poll: Duration::from_millis(10),
            ..Default::default()
        },
    ));
    executor.start();

    let handles: Vec<_> = (0..8)
        .map(|submitter| {
            let executor = executor.clone();
            tokio::spawn(async move {
                let mut ids = Vec::new();
                for n in 0..10 {
                    let priority = Priority::from_level((submitter + n) % 4);
                    let id = executor
                        .submit(
                            move |_c, _a| async move {
                                sleep(Duration::from_millis(2)).await;
                                Ok(json!(submitter * 100 + n))
                            },
                            Value::Null,
                            priority,
                            None,
                        )
                        .unwrap();
                    ids.push(id);
                }
                executor.await_all(&ids, WAIT).await
            })
        })
        .collect();

    let results = futures::future::join_all(handles).await;
    let total: usize = results.into_iter().map(|r| r.unwrap().into_iter().filter(Result::is_ok).count()).sum();
    assert_eq!(total, 80);

    let stats = executor.stats();
    assert_eq!(stats.submitted, 80);
    assert_eq!(stats.succeeded, 80);
    assert!(stats.pool.workers <= 4);
    executor.stop().await;
}
