//! Four-lane priority scheduler with anti-starvation aging.
//!
//! Each [`Priority`] has its own FIFO lane. Dequeue looks at the front of
//! every lane (the oldest ticket there) and picks the one with the best
//! *effective* priority: the stored priority promoted by one level for every
//! full `aging_threshold` the ticket has waited. Ties go to the older ticket,
//! so an aged Deferred ticket eventually overtakes a steady stream of Apex
//! arrivals. Stored priorities are never rewritten.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::task::{Priority, TaskId};

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Wait after which a ticket is promoted one level.
    pub aging_threshold: Duration,
    /// Maximum queued tickets across all lanes (None = unbounded).
    pub max_queue: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            aging_threshold: Duration::from_secs(5),
            max_queue: None,
        }
    }
}

/// A scheduling ticket carrying a payload of type `T`.
pub struct Scheduled<T> {
    /// Task ID.
    pub id: TaskId,
    /// Stored priority.
    pub priority: Priority,
    /// When the ticket entered the scheduler.
    pub enqueued_at: Instant,
    /// Work attached to the ticket.
    pub payload: T,
    seq: u64,
}

impl<T> Scheduled<T> {
    /// Create a ticket stamped with the current time.
    pub fn new(id: TaskId, priority: Priority, payload: T) -> Self {
        Self {
            id,
            priority,
            enqueued_at: Instant::now(),
            payload,
            seq: 0,
        }
    }

    /// Priority this ticket competes at, given the time now.
    pub fn effective_priority(&self, now: Instant, aging_threshold: Duration) -> Priority {
        if aging_threshold.is_zero() {
            return self.priority;
        }
        let waited = now.saturating_duration_since(self.enqueued_at);
        let steps = (waited.as_nanos() / aging_threshold.as_nanos()) as usize;
        self.priority.promoted(steps)
    }
}

struct Lanes<T> {
    lanes: [VecDeque<Scheduled<T>>; 4],
    next_seq: u64,
    closed: bool,
    aged_dispatches: u64,
}

impl<T> Lanes<T> {
    fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }
}

/// Priority scheduler shared by submitters and workers.
pub struct PriorityScheduler<T> {
    config: SchedulerConfig,
    lanes: Mutex<Lanes<T>>,
    notify: Notify,
}

impl<T> PriorityScheduler<T> {
    /// Create a new scheduler.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            lanes: Mutex::new(Lanes {
                lanes: Default::default(),
                next_seq: 0,
                closed: false,
                aged_dispatches: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Scheduler configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Add a ticket to its priority lane. Returns the total queue depth.
    pub fn enqueue(&self, mut ticket: Scheduled<T>) -> Result<usize> {
        let depth = {
            let mut lanes = self.lanes.lock();
            if lanes.closed {
                return Err(Error::ShutdownInProgress);
            }
            let depth = lanes.len();
            if self.config.max_queue.is_some_and(|max| depth >= max) {
                return Err(Error::SchedulerSaturated { depth });
            }

            ticket.seq = lanes.next_seq;
            lanes.next_seq += 1;
            lanes.lanes[ticket.priority.level()].push_back(ticket);
            depth + 1
        };
        self.notify.notify_one();
        Ok(depth)
    }

    /// Take the next ticket, if any.
    pub fn try_dequeue(&self) -> Option<Scheduled<T>> {
        self.try_dequeue_at(Instant::now())
    }

    /// Take the next ticket as if the current time were `now`.
    pub fn try_dequeue_at(&self, now: Instant) -> Option<Scheduled<T>> {
        let mut lanes = self.lanes.lock();

        let mut best: Option<(usize, Priority, u64)> = None;
        for (level, lane) in lanes.lanes.iter().enumerate() {
            let Some(front) = lane.front() else {
                continue;
            };
            let effective = front.effective_priority(now, self.config.aging_threshold);
            let better = match best {
                None => true,
                Some((_, best_effective, best_seq)) => {
                    effective < best_effective || (effective == best_effective && front.seq < best_seq)
                }
            };
            if better {
                best = Some((level, effective, front.seq));
            }
        }

        let (level, effective, _) = best?;
        let ticket = lanes.lanes[level].pop_front()?;
        if effective != ticket.priority {
            lanes.aged_dispatches += 1;
            log::debug!(
                "dispatching {} aged from {:?} to {:?}",
                ticket.id,
                ticket.priority,
                effective
            );
        }
        Some(ticket)
    }

    /// Take the next ticket, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout or once the scheduler is closed and drained.
    pub async fn dequeue(&self, timeout: Duration) -> Option<Scheduled<T>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(ticket) = self.try_dequeue() {
                return Some(ticket);
            }
            if self.is_closed() {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Remove a queued ticket by task ID.
    pub fn remove(&self, id: &TaskId) -> Option<Scheduled<T>> {
        let mut lanes = self.lanes.lock();
        for lane in lanes.lanes.iter_mut() {
            if let Some(pos) = lane.iter().position(|t| &t.id == id) {
                return lane.remove(pos);
            }
        }
        None
    }

    /// Stop accepting tickets and wake every waiting dequeuer.
    ///
    /// Returns the tickets that were still queued.
    pub fn close(&self) -> Vec<Scheduled<T>> {
        let drained = {
            let mut lanes = self.lanes.lock();
            lanes.closed = true;
            lanes.lanes.iter_mut().flat_map(|lane| lane.drain(..)).collect()
        };
        self.notify.notify_waiters();
        drained
    }

    /// Whether the scheduler has been closed.
    pub fn is_closed(&self) -> bool {
        self.lanes.lock().closed
    }

    /// Total queued tickets.
    pub fn len(&self) -> usize {
        self.lanes.lock().len()
    }

    /// Whether no tickets are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue depth per priority, Apex first.
    pub fn depths(&self) -> [usize; 4] {
        let lanes = self.lanes.lock();
        [
            lanes.lanes[0].len(),
            lanes.lanes[1].len(),
            lanes.lanes[2].len(),
            lanes.lanes[3].len(),
        ]
    }

    /// Queued task IDs in the order they would be dispatched right now.
    pub fn queued_tasks(&self) -> Vec<TaskId> {
        let now = Instant::now();
        let lanes = self.lanes.lock();
        let mut tickets: Vec<_> = lanes
            .lanes
            .iter()
            .flat_map(|lane| lane.iter())
            .map(|t| (t.effective_priority(now, self.config.aging_threshold), t.seq, t.id.clone()))
            .collect();
        tickets.sort();
        tickets.into_iter().map(|(_, _, id)| id).collect()
    }

    /// Number of dispatches that happened at a promoted priority.
    pub fn aged_dispatches(&self) -> u64 {
        self.lanes.lock().aged_dispatches
    }
}
