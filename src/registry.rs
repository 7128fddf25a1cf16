//! Task registry: the arena holding every live [`TaskRecord`].
//!
//! Genealogy is expressed through ids only. A child can only be inserted once
//! its parent is present, so the parent links always form a forest. Each slot
//! carries the cooperative cancellation flag for its task and a `watch`
//! channel that publishes status changes to awaiters.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::task::{TaskFailure, TaskId, TaskRecord, TaskState, TaskStatus};

/// What a worker should do with a dequeued task.
#[derive(Debug)]
pub(crate) enum Admission {
    /// Run it; the flag reports cancellation requests.
    Run(Arc<AtomicBool>),
    /// Do not run it (cancelled, purged, or already claimed).
    Skip,
}

struct Slot {
    record: TaskRecord,
    cancel: Arc<AtomicBool>,
    status_tx: watch::Sender<TaskStatus>,
    finished: Option<Instant>,
    consumed: bool,
}

impl Slot {
    fn set_state(&mut self, state: TaskState) -> Result<()> {
        self.record.transition(state)?;
        let status = self.record.status();
        if status.is_terminal() {
            self.finished = Some(Instant::now());
        }
        self.status_tx.send_replace(status);
        Ok(())
    }
}

/// Arena of task records indexed by id.
#[derive(Default)]
pub struct TaskRegistry {
    slots: HashMap<TaskId, Slot>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly created record, linking it under its parent.
    pub(crate) fn insert(&mut self, record: TaskRecord) -> Result<Arc<AtomicBool>> {
        if self.slots.contains_key(&record.id) {
            return Err(Error::Validation(format!("task {} already registered", record.id)));
        }
        if let Some(parent_id) = &record.parent_id {
            let parent = self
                .slots
                .get_mut(parent_id)
                .ok_or_else(|| Error::TaskNotFound { id: parent_id.to_string() })?;
            parent.record.add_child(record.id.clone());
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let (status_tx, _) = watch::channel(record.status());
        self.slots.insert(
            record.id.clone(),
            Slot {
                record,
                cancel: Arc::clone(&cancel),
                status_tx,
                finished: None,
                consumed: false,
            },
        );
        Ok(cancel)
    }

    /// Remove a record that never reached the scheduler and unlink it from its parent.
    pub(crate) fn discard(&mut self, id: &TaskId) {
        let Some(slot) = self.slots.remove(id) else {
            return;
        };
        if let Some(parent) = slot.record.parent_id.as_ref().and_then(|p| self.slots.get_mut(p)) {
            parent.record.children.retain(|c| c != id);
        }
    }

    /// Get a task record by ID.
    pub fn get(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.slots.get(id).map(|s| &s.record)
    }

    /// Get a task's status.
    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.get(id).map(TaskRecord::status)
    }

    /// Number of records currently retained.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Subscribe to status changes of a task.
    pub(crate) fn subscribe(&self, id: &TaskId) -> Result<watch::Receiver<TaskStatus>> {
        self.slots
            .get(id)
            .map(|s| s.status_tx.subscribe())
            .ok_or_else(|| Error::TaskNotFound { id: id.to_string() })
    }

    /// Cancellation flag for a task.
    pub(crate) fn cancel_flag(&self, id: &TaskId) -> Option<Arc<AtomicBool>> {
        self.slots.get(id).map(|s| Arc::clone(&s.cancel))
    }

    /// Claim a dequeued task for execution.
    ///
    /// A task whose cancel flag was raised while it sat between the scheduler
    /// and a worker is marked Cancelled here and never runs.
    pub(crate) fn begin(&mut self, id: &TaskId) -> Admission {
        let Some(slot) = self.slots.get_mut(id) else {
            return Admission::Skip;
        };
        if slot.record.status() != TaskStatus::Queued {
            return Admission::Skip;
        }

        let next = if slot.cancel.load(Ordering::Acquire) {
            TaskState::Cancelled { finished_at: Utc::now() }
        } else {
            TaskState::Running { started_at: Utc::now() }
        };
        match slot.set_state(next) {
            Ok(()) if slot.record.status() == TaskStatus::Running => Admission::Run(Arc::clone(&slot.cancel)),
            _ => Admission::Skip,
        }
    }

    /// Record a terminal state for a running task.
    pub(crate) fn finish(&mut self, id: &TaskId, state: TaskState) -> Result<()> {
        let slot = self
            .slots
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound { id: id.to_string() })?;
        slot.set_state(state)
    }

    /// Mark a queued task cancelled.
    pub(crate) fn cancel_queued(&mut self, id: &TaskId) -> Result<()> {
        let slot = self
            .slots
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound { id: id.to_string() })?;
        slot.cancel.store(true, Ordering::Release);
        slot.set_state(TaskState::Cancelled { finished_at: Utc::now() })
    }

    /// Result of a terminal task; marks it consumed so maintenance can drop it.
    pub(crate) fn outcome(&mut self, id: &TaskId) -> Result<Value> {
        let slot = self
            .slots
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound { id: id.to_string() })?;

        let result = match &slot.record.state {
            TaskState::Succeeded { output, .. } => Ok(output.clone()),
            TaskState::Failed { failure, .. } => Err(Error::TaskFailed {
                id: id.clone(),
                failure: failure.clone(),
            }),
            TaskState::Cancelled { .. } => Err(Error::TaskCancelled { id: id.clone() }),
            TaskState::Queued | TaskState::Running { .. } => {
                return Err(Error::Validation(format!("task {} has not finished", id)));
            }
        };
        slot.consumed = true;
        result
    }

    /// Direct children of a task.
    pub fn children(&self, id: &TaskId) -> Vec<TaskId> {
        self.get(id).map(|r| r.children.clone()).unwrap_or_default()
    }

    /// All retained descendants of a task, breadth first.
    pub fn descendants(&self, id: &TaskId) -> Vec<TaskId> {
        let mut found = Vec::new();
        let mut frontier: VecDeque<TaskId> = self.children(id).into();
        while let Some(next) = frontier.pop_front() {
            if let Some(record) = self.get(&next) {
                frontier.extend(record.children.iter().cloned());
                found.push(next);
            }
        }
        found
    }

    /// Drop finished records that were consumed or outlived the retention window.
    pub fn purge(&mut self, now: Instant, retention: Duration) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot.finished {
            Some(finished) => !slot.consumed && now.saturating_duration_since(finished) < retention,
            None => true,
        });
        before - self.slots.len()
    }

    /// Get the number of tasks by status.
    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for slot in self.slots.values() {
            match slot.record.status() {
                TaskStatus::Queued => counts.queued += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Succeeded => counts.succeeded += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }
}

/// Task counts by status.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TaskCounts {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Terminal state for a task that failed.
pub(crate) fn failed_state(failure: TaskFailure) -> TaskState {
    TaskState::Failed {
        failure,
        finished_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Priority;

    fn succeed(registry: &mut TaskRegistry, id: &TaskId, output: Value) {
        assert!(matches!(registry.begin(id), Admission::Run(_)));
        registry
            .finish(
                id,
                TaskState::Succeeded {
                    output,
                    finished_at: Utc::now(),
                },
            )
            .unwrap();
    }

    #[test]
    fn test_child_linked_under_parent() {
        let mut registry = TaskRegistry::new();
        let parent = TaskRecord::new(Priority::Nominal, None);
        let parent_id = parent.id.clone();
        registry.insert(parent).unwrap();

        let child = TaskRecord::new(Priority::Apex, Some(parent_id.clone()));
        let child_id = child.id.clone();
        registry.insert(child).unwrap();

        assert_eq!(registry.children(&parent_id), vec![child_id.clone()]);
        assert_eq!(registry.get(&child_id).unwrap().parent_id, Some(parent_id));
    }

    #[test]
    fn test_missing_parent_rejected() {
        let mut registry = TaskRegistry::new();
        let orphan = TaskRecord::new(Priority::Nominal, Some(TaskId("task-ghost".into())));
        let err = registry.insert(orphan).unwrap_err();
        assert!(matches!(err, Error::TaskNotFound { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_descendants_breadth_first() {
        let mut registry = TaskRegistry::new();
        let root = TaskRecord::new(Priority::Nominal, None);
        let root_id = root.id.clone();
        registry.insert(root).unwrap();

        let a = TaskRecord::new(Priority::Nominal, Some(root_id.clone()));
        let a_id = a.id.clone();
        registry.insert(a).unwrap();
        let b = TaskRecord::new(Priority::Nominal, Some(root_id.clone()));
        let b_id = b.id.clone();
        registry.insert(b).unwrap();
        let grandchild = TaskRecord::new(Priority::Nominal, Some(a_id.clone()));
        let grandchild_id = grandchild.id.clone();
        registry.insert(grandchild).unwrap();

        assert_eq!(registry.descendants(&root_id), vec![a_id, b_id, grandchild_id]);
    }

    #[test]
    fn test_discard_unlinks_child() {
        let mut registry = TaskRegistry::new();
        let parent = TaskRecord::new(Priority::Nominal, None);
        let parent_id = parent.id.clone();
        registry.insert(parent).unwrap();
        let child = TaskRecord::new(Priority::Nominal, Some(parent_id.clone()));
        let child_id = child.id.clone();
        registry.insert(child).unwrap();

        registry.discard(&child_id);
        assert!(registry.children(&parent_id).is_empty());
        assert!(registry.get(&child_id).is_none());
    }

    #[test]
    fn test_begin_honours_cancel_flag() {
        let mut registry = TaskRegistry::new();
        let record = TaskRecord::new(Priority::Nominal, None);
        let id = record.id.clone();
        let flag = registry.insert(record).unwrap();

        flag.store(true, Ordering::Release);
        assert!(matches!(registry.begin(&id), Admission::Skip));
        assert_eq!(registry.status(&id), Some(TaskStatus::Cancelled));
    }

    #[test]
    fn test_begin_only_once() {
        let mut registry = TaskRegistry::new();
        let record = TaskRecord::new(Priority::Nominal, None);
        let id = record.id.clone();
        registry.insert(record).unwrap();

        assert!(matches!(registry.begin(&id), Admission::Run(_)));
        assert!(matches!(registry.begin(&id), Admission::Skip));
        assert!(matches!(registry.begin(&TaskId("task-missing".into())), Admission::Skip));
    }

    #[test]
    fn test_outcome_variants() {
        let mut registry = TaskRegistry::new();

        let ok = TaskRecord::new(Priority::Nominal, None);
        let ok_id = ok.id.clone();
        registry.insert(ok).unwrap();
        succeed(&mut registry, &ok_id, serde_json::json!(42));
        assert_eq!(registry.outcome(&ok_id).unwrap(), serde_json::json!(42));

        let bad = TaskRecord::new(Priority::Nominal, None);
        let bad_id = bad.id.clone();
        registry.insert(bad).unwrap();
        registry.begin(&bad_id);
        registry
            .finish(&bad_id, failed_state(TaskFailure::error("exploded")))
            .unwrap();
        let err = registry.outcome(&bad_id).unwrap_err();
        assert!(matches!(err, Error::TaskFailed { failure, .. } if failure.message == "exploded"));

        let cancelled = TaskRecord::new(Priority::Nominal, None);
        let cancelled_id = cancelled.id.clone();
        registry.insert(cancelled).unwrap();
        registry.cancel_queued(&cancelled_id).unwrap();
        assert!(matches!(
            registry.outcome(&cancelled_id).unwrap_err(),
            Error::TaskCancelled { .. }
        ));
    }

    #[test]
    fn test_outcome_of_unfinished_task() {
        let mut registry = TaskRegistry::new();
        let record = TaskRecord::new(Priority::Nominal, None);
        let id = record.id.clone();
        registry.insert(record).unwrap();
        assert!(matches!(registry.outcome(&id).unwrap_err(), Error::Validation(_)));
    }

    #[test]
    fn test_purge_consumed_and_expired() {
        let mut registry = TaskRegistry::new();

        let consumed = TaskRecord::new(Priority::Nominal, None);
        let consumed_id = consumed.id.clone();
        registry.insert(consumed).unwrap();
        succeed(&mut registry, &consumed_id, Value::Null);
        registry.outcome(&consumed_id).unwrap();

        let unread = TaskRecord::new(Priority::Nominal, None);
        let unread_id = unread.id.clone();
        registry.insert(unread).unwrap();
        succeed(&mut registry, &unread_id, Value::Null);

        let pending = TaskRecord::new(Priority::Nominal, None);
        let pending_id = pending.id.clone();
        registry.insert(pending).unwrap();

        // Consumed records go right away, unread ones wait for retention
        assert_eq!(registry.purge(Instant::now(), Duration::from_secs(60)), 1);
        assert!(registry.get(&unread_id).is_some());

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(registry.purge(later, Duration::from_secs(60)), 1);
        assert!(registry.get(&unread_id).is_none());
        assert!(registry.get(&pending_id).is_some());
    }

    #[tokio::test]
    async fn test_subscribe_sees_terminal_status() {
        let mut registry = TaskRegistry::new();
        let record = TaskRecord::new(Priority::Nominal, None);
        let id = record.id.clone();
        registry.insert(record).unwrap();
        let mut rx = registry.subscribe(&id).unwrap();

        succeed(&mut registry, &id, Value::Null);
        let status = *rx.wait_for(|s| s.is_terminal()).await.unwrap();
        assert_eq!(status, TaskStatus::Succeeded);
    }

    #[test]
    fn test_counts() {
        let mut registry = TaskRegistry::new();
        let a = TaskRecord::new(Priority::Nominal, None);
        let a_id = a.id.clone();
        registry.insert(a).unwrap();
        let b = TaskRecord::new(Priority::Nominal, None);
        registry.insert(b).unwrap();
        registry.begin(&a_id);

        let counts = registry.counts();
        assert_eq!(counts.running, 1);
        assert_eq!(counts.queued, 1);
    }
}
