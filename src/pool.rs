//! Elastic worker pool.
//!
//! Workers pull tickets from a shared [`PriorityScheduler`] and hand them to a
//! [`TaskRunner`]. A control loop samples load at a fixed interval into a
//! sliding window and, once the window is full, grows or shrinks the pool by
//! one worker based on the windowed mean pressure:
//!
//! - pressure = (queued tickets + busy workers) / workers
//! - grow when pressure > `scale_up_threshold` and below `max_workers`
//! - shrink when pressure < `scale_down_threshold` and above `min_workers`
//!
//! The gap between the two thresholds is the hysteresis band. The window is
//! cleared after every scaling step so the next decision sees only samples
//! taken at the new size.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::coordination::scheduler::{PriorityScheduler, Scheduled};
use crate::error::{Error, Result};

/// Executes dequeued tickets on behalf of the pool.
pub trait TaskRunner: Send + Sync + 'static {
    /// Work carried by each ticket.
    type Payload: Send + 'static;

    /// Run one ticket to completion. Must not panic.
    fn run(&self, ticket: Scheduled<Self::Payload>) -> impl Future<Output = ()> + Send;
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Period of the load sampler.
    pub sampling_interval: Duration,
    /// Samples per scaling decision.
    pub sampling_window_size: usize,
    /// Mean pressure above which a worker is added.
    pub scale_up_threshold: f64,
    /// Mean pressure below which a worker is retired.
    pub scale_down_threshold: f64,
    /// How long an idle worker waits on the scheduler before rechecking its stop flag.
    pub idle_poll: Duration,
    /// How long `stop` waits for in-flight work before aborting it.
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 8,
            sampling_interval: Duration::from_millis(250),
            sampling_window_size: 4,
            scale_up_threshold: 2.0,
            scale_down_threshold: 0.5,
            idle_poll: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Check bounds and thresholds for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.min_workers == 0 {
            return Err(Error::Validation("min_workers must be at least 1".into()));
        }
        if self.max_workers < self.min_workers {
            return Err(Error::Validation(format!(
                "max_workers ({}) is below min_workers ({})",
                self.max_workers, self.min_workers
            )));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(Error::Validation(format!(
                "scale_down_threshold ({}) must be below scale_up_threshold ({})",
                self.scale_down_threshold, self.scale_up_threshold
            )));
        }
        if self.sampling_window_size == 0 || self.sampling_interval.is_zero() {
            return Err(Error::Validation("sampling window and interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// One observation of pool load.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadSample {
    pub queue_depth: usize,
    pub busy_workers: usize,
    pub workers: usize,
    /// Mean run time of tickets completed since the previous sample.
    pub mean_latency: Duration,
}

impl LoadSample {
    /// Outstanding work per worker.
    pub fn pressure(&self) -> f64 {
        (self.queue_depth + self.busy_workers) as f64 / self.workers.max(1) as f64
    }
}

/// Fixed-length sliding window of load samples.
#[derive(Debug, Clone)]
pub struct LoadWindow {
    capacity: usize,
    samples: VecDeque<LoadSample>,
}

impl LoadWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Add a sample, dropping the oldest once full.
    pub fn push(&mut self, sample: LoadSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Mean pressure over the window (0.0 when empty).
    pub fn mean_pressure(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(LoadSample::pressure).sum::<f64>() / self.samples.len() as f64
    }

    /// Mean of the per-sample latencies that saw completions.
    pub fn mean_latency(&self) -> Duration {
        let observed: Vec<_> = self.samples.iter().filter(|s| !s.mean_latency.is_zero()).collect();
        if observed.is_empty() {
            return Duration::ZERO;
        }
        observed.iter().map(|s| s.mean_latency).sum::<Duration>() / observed.len() as u32
    }
}

/// Outcome of one scaling evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    Grow,
    Shrink,
    Hold,
}

/// Decide how to resize the pool for a given mean pressure.
pub fn evaluate(mean_pressure: f64, workers: usize, config: &PoolConfig) -> ScalingDecision {
    if mean_pressure > config.scale_up_threshold && workers < config.max_workers {
        ScalingDecision::Grow
    } else if mean_pressure < config.scale_down_threshold && workers > config.min_workers {
        ScalingDecision::Shrink
    } else {
        ScalingDecision::Hold
    }
}

/// Pool counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub busy: usize,
    pub queued: usize,
    pub completed: u64,
    pub scale_ups: u64,
    pub scale_downs: u64,
    pub mean_latency: Duration,
}

#[derive(Default)]
struct WorkerCounters {
    busy: AtomicUsize,
    completed: AtomicU64,
    // Reset by each load sample
    window_completed: AtomicU64,
    window_latency_us: AtomicU64,
}

impl WorkerCounters {
    fn record(&self, elapsed: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.window_completed.fetch_add(1, Ordering::Relaxed);
        self.window_latency_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    fn take_mean_latency(&self) -> Duration {
        let completed = self.window_completed.swap(0, Ordering::Relaxed);
        let latency_us = self.window_latency_us.swap(0, Ordering::Relaxed);
        if completed == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(latency_us / completed)
        }
    }
}

struct Worker {
    id: usize,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Workers {
    active: Vec<Worker>,
    // Told to stop, possibly still finishing a ticket
    retiring: Vec<Worker>,
}

/// Adaptive set of workers draining a priority scheduler.
pub struct WorkforcePool<R: TaskRunner> {
    config: PoolConfig,
    scheduler: Arc<PriorityScheduler<R::Payload>>,
    runner: Arc<R>,
    workers: Mutex<Workers>,
    counters: Arc<WorkerCounters>,
    window: Mutex<LoadWindow>,
    control: Mutex<Option<JoinHandle<()>>>,
    next_worker_id: AtomicUsize,
    scale_ups: AtomicU64,
    scale_downs: AtomicU64,
    started: AtomicBool,
    stopping: AtomicBool,
}

impl<R: TaskRunner> WorkforcePool<R> {
    /// Create a pool. No workers run until [`start`](Self::start).
    pub fn new(config: PoolConfig, scheduler: Arc<PriorityScheduler<R::Payload>>, runner: Arc<R>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            window: Mutex::new(LoadWindow::new(config.sampling_window_size)),
            config,
            scheduler,
            runner,
            workers: Mutex::new(Workers::default()),
            counters: Arc::new(WorkerCounters::default()),
            control: Mutex::new(None),
            next_worker_id: AtomicUsize::new(0),
            scale_ups: AtomicU64::new(0),
            scale_downs: AtomicU64::new(0),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Spawn `min_workers` workers and the scaling control loop.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        for _ in 0..self.config.min_workers {
            self.spawn_worker();
        }

        let pool: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sampling_interval;
        let control = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                if pool.stopping.load(Ordering::Acquire) {
                    break;
                }
                pool.control_tick();
            }
        });
        *self.control.lock() = Some(control);
        log::info!(
            "worker pool started with {} workers (bounds {}..={})",
            self.config.min_workers,
            self.config.min_workers,
            self.config.max_workers
        );
    }

    fn spawn_worker(&self) {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let stop = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(worker_loop(
            id,
            Arc::clone(&stop),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.runner),
            Arc::clone(&self.counters),
            self.config.idle_poll,
        ));
        self.workers.lock().active.push(Worker { id, stop, handle });
    }

    fn retire_worker(&self) {
        let mut workers = self.workers.lock();
        if let Some(worker) = workers.active.pop() {
            worker.stop.store(true, Ordering::Release);
            log::debug!("retiring worker {}", worker.id);
            workers.retiring.push(worker);
        }
    }

    /// Drop workers that exited without being retired and respawn up to `min_workers`.
    fn replace_dead_workers(&self) {
        if self.scheduler.is_closed() {
            return;
        }
        let missing = {
            let mut workers = self.workers.lock();
            workers.active.retain(|w| {
                if w.handle.is_finished() {
                    log::warn!("worker {} exited unexpectedly", w.id);
                    false
                } else {
                    true
                }
            });
            self.config.min_workers.saturating_sub(workers.active.len())
        };
        for _ in 0..missing {
            self.spawn_worker();
        }
        if missing > 0 {
            log::info!("respawned {missing} workers");
        }
    }

    /// Take one load sample and apply the resulting scaling decision.
    fn control_tick(&self) {
        self.replace_dead_workers();
        let sample = self.sample();
        let decision = {
            let mut window = self.window.lock();
            window.push(sample);
            if !window.is_full() {
                ScalingDecision::Hold
            } else {
                let decision = evaluate(window.mean_pressure(), sample.workers, &self.config);
                if decision != ScalingDecision::Hold {
                    log::debug!(
                        "pool {:?}: mean pressure {:.2} over {} samples, mean latency {:?}",
                        decision,
                        window.mean_pressure(),
                        window.len(),
                        window.mean_latency()
                    );
                    window.clear();
                }
                decision
            }
        };

        match decision {
            ScalingDecision::Grow => {
                self.spawn_worker();
                self.scale_ups.fetch_add(1, Ordering::Relaxed);
                log::info!("pool grew to {} workers", self.active_workers());
            }
            ScalingDecision::Shrink => {
                self.retire_worker();
                self.scale_downs.fetch_add(1, Ordering::Relaxed);
                log::info!("pool shrank to {} workers", self.active_workers());
            }
            ScalingDecision::Hold => {}
        }

        self.workers.lock().retiring.retain(|w| !w.handle.is_finished());
    }

    /// Current load observation.
    pub fn sample(&self) -> LoadSample {
        LoadSample {
            queue_depth: self.scheduler.len(),
            busy_workers: self.counters.busy.load(Ordering::Relaxed),
            workers: self.active_workers(),
            mean_latency: self.counters.take_mean_latency(),
        }
    }

    /// Workers currently taking new tickets.
    pub fn active_workers(&self) -> usize {
        self.workers.lock().active.len()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.stopping.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.active_workers(),
            busy: self.counters.busy.load(Ordering::Relaxed),
            queued: self.scheduler.len(),
            completed: self.counters.completed.load(Ordering::Relaxed),
            scale_ups: self.scale_ups.load(Ordering::Relaxed),
            scale_downs: self.scale_downs.load(Ordering::Relaxed),
            mean_latency: self.window.lock().mean_latency(),
        }
    }

    /// Stop the pool.
    ///
    /// Closes the scheduler, signals every worker, and waits up to
    /// `shutdown_grace` for in-flight tickets before aborting what is left.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(control) = self.control.lock().take() {
            control.abort();
        }

        let dropped = self.scheduler.close();
        if !dropped.is_empty() {
            log::warn!("pool stopping with {} tickets still queued", dropped.len());
        }

        let workers: Vec<Worker> = {
            let mut workers = self.workers.lock();
            let mut all: Vec<Worker> = workers.active.drain(..).collect();
            all.append(&mut workers.retiring);
            all
        };
        for worker in &workers {
            worker.stop.store(true, Ordering::Release);
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        let mut aborted = 0;
        for mut worker in workers {
            if tokio::time::timeout_at(deadline, &mut worker.handle).await.is_err() {
                worker.handle.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            log::warn!("aborted {aborted} workers still running after the shutdown grace period");
        }
        log::info!("worker pool stopped");
    }
}

async fn worker_loop<R: TaskRunner>(
    id: usize,
    stop: Arc<AtomicBool>,
    scheduler: Arc<PriorityScheduler<R::Payload>>,
    runner: Arc<R>,
    counters: Arc<WorkerCounters>,
    idle_poll: Duration,
) {
    log::debug!("worker {id} started");
    while !stop.load(Ordering::Acquire) {
        let Some(ticket) = scheduler.dequeue(idle_poll).await else {
            if scheduler.is_closed() {
                break;
            }
            continue;
        };

        let busy = BusyGuard::enter(&counters);
        runner.run(ticket).await;
        drop(busy);
    }
    log::debug!("worker {id} exiting");
}

/// Marks a worker busy for one ticket. Dropping it, on unwind too, records the run.
struct BusyGuard<'a> {
    counters: &'a WorkerCounters,
    started: Instant,
}

impl<'a> BusyGuard<'a> {
    fn enter(counters: &'a WorkerCounters) -> Self {
        counters.busy.fetch_add(1, Ordering::Relaxed);
        Self {
            counters,
            started: Instant::now(),
        }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.counters.busy.fetch_sub(1, Ordering::Relaxed);
        self.counters.record(self.started.elapsed());
    }
}
