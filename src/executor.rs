//! Task execution facade.
//!
//! The [`Executor`] ties the pieces together:
//! - Submission creates a [`TaskRecord`] in the registry and enqueues a ticket
//! - Pool workers claim tickets, run the task function and record the outcome
//! - Awaiters watch the record's status channel until it turns terminal
//! - Cancellation removes queued work or raises a cooperative flag
//! - A maintenance loop purges finished records after the retention window
//!
//! Task functions receive a [`TaskContext`] and their `args` value and return
//! `eyre::Result<serde_json::Value>`. Errors and panics are captured into the
//! task's record and never reach other tasks or the pool.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

use crate::config::Config;
use crate::coordination::gate::{AccessGate, GateConfig};
use crate::coordination::scheduler::{PriorityScheduler, Scheduled, SchedulerConfig};
use crate::error::{Error, Result};
use crate::pool::{PoolConfig, PoolStats, TaskRunner, WorkforcePool};
use crate::registry::{Admission, TaskCounts, TaskRegistry, failed_state};
use crate::store::kv::{KeyValueStore, StoreConfig, StoreStats};
use crate::store::persistence::SqlitePersistence;
use crate::task::{Priority, TaskFailure, TaskId, TaskRecord, TaskState, TaskStatus};

/// Boxed future returned by a task function.
pub type TaskFuture = Pin<Box<dyn Future<Output = eyre::Result<Value>> + Send>>;

type TaskFn = Box<dyn FnOnce(TaskContext, Value) -> TaskFuture + Send>;

/// Queued work: the task function and its arguments.
struct Job {
    args: Value,
    run: TaskFn,
}

impl Job {
    fn new<F, Fut>(f: F, args: Value) -> Self
    where
        F: FnOnce(TaskContext, Value) -> Fut + Send + 'static,
        Fut: Future<Output = eyre::Result<Value>> + Send + 'static,
    {
        Self {
            args,
            run: Box::new(move |ctx, args| Box::pin(f(ctx, args))),
        }
    }
}

/// Error returned by [`TaskContext::checkpoint`] once cancellation was requested.
#[derive(Debug, Error)]
#[error("task cancelled at checkpoint")]
pub struct Cancelled;

/// Configuration for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub scheduler: SchedulerConfig,
    pub pool: PoolConfig,
    /// How long finished, unconsumed records are kept.
    pub retention: Duration,
    /// Period of the record purge loop.
    pub maintenance_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            pool: PoolConfig::default(),
            retention: Duration::from_secs(3_600),
            maintenance_interval: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for ExecutorConfig {
    fn from(config: &Config) -> Self {
        Self {
            scheduler: SchedulerConfig::from(&config.scheduler),
            pool: PoolConfig::from(&config.pool),
            retention: Duration::from_secs(config.executor.retention_secs),
            maintenance_interval: Duration::from_millis(config.executor.maintenance_interval_ms),
        }
    }
}

/// Executor counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutorStats {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Tickets waiting in the scheduler.
    pub queued: usize,
    /// Tasks currently running.
    pub running: usize,
    /// Records held by the registry.
    pub retained: usize,
    pub pool: PoolStats,
    pub store: StoreStats,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl Counters {
    fn record(&self, status: TaskStatus) {
        let counter = match status {
            TaskStatus::Succeeded => &self.succeeded,
            TaskStatus::Failed => &self.failed,
            TaskStatus::Cancelled => &self.cancelled,
            TaskStatus::Queued | TaskStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared by the executor, its workers and every task context.
///
/// Lock order: registry -> scheduler.
struct Shared {
    registry: Mutex<TaskRegistry>,
    scheduler: Arc<PriorityScheduler<Job>>,
    store: Arc<KeyValueStore>,
    shutdown: watch::Sender<bool>,
    counters: Counters,
}

impl Shared {
    fn submit(&self, job: Job, priority: Priority, parent: Option<&TaskId>) -> Result<TaskId> {
        if *self.shutdown.borrow() {
            return Err(Error::ShutdownInProgress);
        }

        let record = TaskRecord::new(priority, parent.cloned());
        let id = record.id.clone();

        let mut registry = self.registry.lock();
        registry.insert(record)?;
        if let Err(e) = self.scheduler.enqueue(Scheduled::new(id.clone(), priority, job)) {
            registry.discard(&id);
            return Err(e);
        }
        drop(registry);

        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        log::debug!("submitted {id} at {priority:?}");
        Ok(id)
    }
}

/// Handle given to a running task function.
#[derive(Clone)]
pub struct TaskContext {
    id: TaskId,
    cancel: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl TaskContext {
    /// ID of the running task.
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Whether cancellation of this task was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Return `Err(Cancelled)` if cancellation was requested.
    ///
    /// Propagating that error with `?` ends the task as Cancelled rather than Failed.
    pub fn checkpoint(&self) -> eyre::Result<()> {
        if self.is_cancelled() {
            return Err(Cancelled.into());
        }
        Ok(())
    }

    /// The shared key-value store.
    pub fn store(&self) -> &Arc<KeyValueStore> {
        &self.shared.store
    }

    /// Submit a child task of this task.
    pub fn submit_child<F, Fut>(&self, f: F, args: Value, priority: Priority) -> Result<TaskId>
    where
        F: FnOnce(TaskContext, Value) -> Fut + Send + 'static,
        Fut: Future<Output = eyre::Result<Value>> + Send + 'static,
    {
        self.shared.submit(Job::new(f, args), priority, Some(&self.id))
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs dequeued jobs and records their outcomes.
struct JobRunner {
    shared: Arc<Shared>,
}

impl TaskRunner for JobRunner {
    type Payload = Job;

    async fn run(&self, ticket: Scheduled<Job>) {
        let Scheduled { id, payload: job, .. } = ticket;

        let admission = self.shared.registry.lock().begin(&id);
        let cancel = match admission {
            Admission::Run(cancel) => cancel,
            Admission::Skip => {
                // Cancelled between dequeue and claim
                if self.shared.registry.lock().status(&id) == Some(TaskStatus::Cancelled) {
                    self.shared.counters.record(TaskStatus::Cancelled);
                }
                log::debug!("skipping {id}");
                return;
            }
        };
        log::debug!("running {id}");

        let ctx = TaskContext {
            id: id.clone(),
            cancel: Arc::clone(&cancel),
            shared: Arc::clone(&self.shared),
        };
        let Job { args, run } = job;
        // Panics while building the future must land in the spawned task
        let handle = tokio::spawn(async move { run(ctx, args).await });
        let _abort = AbortOnDrop(handle.abort_handle());

        let state = match handle.await {
            Ok(Ok(output)) => TaskState::Succeeded {
                output,
                finished_at: Utc::now(),
            },
            Ok(Err(report)) if report.downcast_ref::<Cancelled>().is_some() && cancel.load(Ordering::Acquire) => {
                TaskState::Cancelled {
                    finished_at: Utc::now(),
                }
            }
            Ok(Err(report)) => {
                log::warn!("task {id} failed: {report:#}");
                failed_state(TaskFailure::error(format!("{report:#}")))
            }
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                log::warn!("task {id} panicked: {message}");
                failed_state(TaskFailure::panic(message))
            }
            Err(_) => TaskState::Cancelled {
                finished_at: Utc::now(),
            },
        };

        let status = state.status();
        match self.shared.registry.lock().finish(&id, state) {
            Ok(()) => self.shared.counters.record(status),
            Err(e) => log::warn!("could not record outcome of {id}: {e}"),
        }
    }
}

/// Public facade: submit, await and cancel tasks.
pub struct Executor {
    config: ExecutorConfig,
    shared: Arc<Shared>,
    pool: Arc<WorkforcePool<JobRunner>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    /// Create an executor over an existing store. Call [`start`](Self::start) to begin running tasks.
    pub fn new(config: ExecutorConfig, store: Arc<KeyValueStore>) -> Result<Self> {
        let scheduler = Arc::new(PriorityScheduler::new(config.scheduler.clone()));
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            registry: Mutex::new(TaskRegistry::new()),
            scheduler: Arc::clone(&scheduler),
            store,
            shutdown,
            counters: Counters::default(),
        });
        let runner = Arc::new(JobRunner {
            shared: Arc::clone(&shared),
        });
        let pool = Arc::new(WorkforcePool::new(config.pool.clone(), scheduler, runner)?);

        Ok(Self {
            config,
            shared,
            pool,
            background: Mutex::new(Vec::new()),
        })
    }

    /// Build the gate, the store (persisted under `data_dir` when enabled) and the executor.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let gate = Arc::new(AccessGate::new(GateConfig::from(&config.gate)));
        let store_config = StoreConfig::from(config);
        let store = if config.store.persist {
            let persistence = SqlitePersistence::open(config.database_path())?;
            KeyValueStore::open(store_config, gate, Box::new(persistence))?
        } else {
            KeyValueStore::new(store_config, gate)
        };
        Self::new(ExecutorConfig::from(config), Arc::new(store))
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Start the worker pool, the store sweeper and the maintenance loop.
    pub fn start(&self) {
        self.pool.start();

        let mut background = self.background.lock();
        background.push(self.shared.store.spawn_sweeper());

        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let period = self.config.maintenance_interval;
        let retention = self.config.retention;
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let purged = shared.registry.lock().purge(Instant::now(), retention);
                if purged > 0 {
                    log::debug!("purged {purged} finished task records");
                }
            }
        }));
        log::info!("executor started");
    }

    /// Submit an async task function. Returns as soon as the task is queued.
    pub fn submit<F, Fut>(&self, f: F, args: Value, priority: Priority, parent: Option<&TaskId>) -> Result<TaskId>
    where
        F: FnOnce(TaskContext, Value) -> Fut + Send + 'static,
        Fut: Future<Output = eyre::Result<Value>> + Send + 'static,
    {
        self.shared.submit(Job::new(f, args), priority, parent)
    }

    /// Submit a synchronous task function, run on the blocking thread pool.
    pub fn submit_blocking<F>(&self, f: F, args: Value, priority: Priority, parent: Option<&TaskId>) -> Result<TaskId>
    where
        F: FnOnce(TaskContext, Value) -> eyre::Result<Value> + Send + 'static,
    {
        self.submit(
            move |ctx, args| async move {
                match tokio::task::spawn_blocking(move || f(ctx, args)).await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                    Err(e) => Err(eyre::eyre!("blocking task did not complete: {e}")),
                }
            },
            args,
            priority,
            parent,
        )
    }

    /// Wait for a task's result.
    ///
    /// Fails with `TaskFailed`, `TaskCancelled`, `AwaitTimeout` (when `timeout`
    /// elapses first), `ShutdownInProgress` (when the executor stops first) or
    /// `TaskNotFound`. A consumed result may be purged, so await a task once.
    pub async fn await_task(&self, id: &TaskId, timeout: Option<Duration>) -> Result<Value> {
        let mut status_rx = self.shared.registry.lock().subscribe(id)?;
        let mut shutdown_rx = self.shared.shutdown.subscribe();

        let wait = async {
            tokio::select! {
                biased;
                changed = status_rx.wait_for(TaskStatus::is_terminal) => match changed {
                    Ok(_) => Ok(()),
                    Err(_) => Err(Error::TaskNotFound { id: id.to_string() }),
                },
                _ = shutdown_rx.wait_for(|stopping| *stopping) => Err(Error::ShutdownInProgress),
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| Error::AwaitTimeout {
                    id: id.clone(),
                    waited: limit,
                })??,
            None => wait.await?,
        }

        self.shared.registry.lock().outcome(id)
    }

    /// Wait for several tasks under one shared deadline, in order.
    pub async fn await_all(&self, ids: &[TaskId], timeout: Option<Duration>) -> Vec<Result<Value>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            results.push(self.await_task(id, remaining).await);
        }
        results
    }

    /// Request cancellation of a task.
    ///
    /// A queued task is removed from the scheduler and never runs. A running
    /// task only has its flag raised; it stops at its next checkpoint. Returns
    /// false for finished or unknown tasks.
    pub fn cancel(&self, id: &TaskId) -> bool {
        let mut registry = self.shared.registry.lock();
        match registry.status(id) {
            Some(TaskStatus::Queued) => {
                if self.shared.scheduler.remove(id).is_some() {
                    if registry.cancel_queued(id).is_ok() {
                        self.shared.counters.record(TaskStatus::Cancelled);
                    }
                } else if let Some(flag) = registry.cancel_flag(id) {
                    // Dequeued but not yet claimed; the claim will see the flag
                    flag.store(true, Ordering::Release);
                }
                log::debug!("cancelled queued task {id}");
                true
            }
            Some(TaskStatus::Running) => {
                if let Some(flag) = registry.cancel_flag(id) {
                    flag.store(true, Ordering::Release);
                }
                log::debug!("requested cancellation of running task {id}");
                true
            }
            _ => false,
        }
    }

    /// Cancel a task and all of its retained descendants. Returns how many accepted the request.
    pub fn cancel_tree(&self, id: &TaskId) -> usize {
        let mut ids = vec![id.clone()];
        ids.extend(self.shared.registry.lock().descendants(id));
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.shared.registry.lock().status(id)
    }

    /// Snapshot of a task record.
    pub fn record(&self, id: &TaskId) -> Option<TaskRecord> {
        self.shared.registry.lock().get(id).cloned()
    }

    pub fn children(&self, id: &TaskId) -> Vec<TaskId> {
        self.shared.registry.lock().children(id)
    }

    /// Task counts by status among retained records.
    pub fn counts(&self) -> TaskCounts {
        self.shared.registry.lock().counts()
    }

    pub fn stats(&self) -> ExecutorStats {
        let counters = &self.shared.counters;
        let (running, retained) = {
            let registry = self.shared.registry.lock();
            (registry.counts().running, registry.len())
        };
        ExecutorStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            queued: self.shared.scheduler.len(),
            running,
            retained,
            pool: self.pool.stats(),
            store: self.shared.store.stats(),
        }
    }

    /// The shared key-value store.
    pub fn store(&self) -> &Arc<KeyValueStore> {
        &self.shared.store
    }

    /// Purge finished records now. Returns how many were dropped.
    pub fn purge_finished(&self) -> usize {
        self.shared
            .registry
            .lock()
            .purge(Instant::now(), self.config.retention)
    }

    /// Stop the executor.
    ///
    /// Pending awaits fail with `ShutdownInProgress`, queued tasks are marked
    /// Cancelled, running tasks get the pool's shutdown grace period, and the
    /// background loops end.
    pub async fn stop(&self) {
        if self.shared.shutdown.send_replace(true) {
            return;
        }
        log::info!("executor stopping");

        let drained = self.shared.scheduler.close();
        {
            let mut registry = self.shared.registry.lock();
            for ticket in &drained {
                if registry.cancel_queued(&ticket.id).is_ok() {
                    self.shared.counters.record(TaskStatus::Cancelled);
                }
            }
        }
        if !drained.is_empty() {
            log::info!("cancelled {} queued tasks on shutdown", drained.len());
        }
        drop(drained);

        self.pool.stop().await;

        let background: Vec<_> = self.background.lock().drain(..).collect();
        for handle in background {
            handle.abort();
        }
        log::info!("executor stopped");
    }
}
