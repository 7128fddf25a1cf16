//! Task types for taskloom.
//!
//! A [`TaskRecord`] describes one unit of work: its priority, where it sits
//! in the genealogy forest, and its lifecycle state. Records live in the
//! [`TaskRegistry`](crate::registry::TaskRegistry) arena and reference each
//! other by [`TaskId`] only.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Unique identifier for a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a new task ID using UUID v7 (time-ordered).
    pub fn new() -> Self {
        Self(format!("task-{}", Uuid::now_v7()))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Scheduling priority, highest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Apex,
    Elevated,
    #[default]
    Nominal,
    Deferred,
}

impl Priority {
    /// All priorities in dispatch order.
    pub const ALL: [Priority; 4] = [Priority::Apex, Priority::Elevated, Priority::Nominal, Priority::Deferred];

    /// Lane index (0 = Apex).
    pub fn level(self) -> usize {
        self as usize
    }

    /// Priority for a lane index, clamping out-of-range levels to Deferred.
    pub fn from_level(level: usize) -> Self {
        Self::ALL.get(level).copied().unwrap_or(Priority::Deferred)
    }

    /// Priority after `steps` promotions, saturating at Apex.
    pub fn promoted(self, steps: usize) -> Self {
        Self::from_level(self.level().saturating_sub(steps))
    }
}

/// Coarse lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in the scheduler
    Queued,
    /// Claimed by a worker
    Running,
    /// Finished with an output
    Succeeded,
    /// Finished with an error or panic
    Failed,
    /// Cancelled before or during execution
    Cancelled,
}

impl TaskStatus {
    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// Check if the task can transition to the given status.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (Queued, Running | Cancelled) => true,
            // Running -> Cancelled only happens through a cooperative checkpoint
            (Running, Succeeded | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

/// Description of why a task failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Error chain or panic payload rendered as text.
    pub message: String,
    /// Whether the task panicked rather than returning an error.
    pub panicked: bool,
}

impl TaskFailure {
    /// Failure from a returned error.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            panicked: false,
        }
    }

    /// Failure from a panic.
    pub fn panic(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            panicked: true,
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.panicked {
            write!(f, "panicked: {}", self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Lifecycle state with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running {
        started_at: DateTime<Utc>,
    },
    Succeeded {
        output: Value,
        finished_at: DateTime<Utc>,
    },
    Failed {
        failure: TaskFailure,
        finished_at: DateTime<Utc>,
    },
    Cancelled {
        finished_at: DateTime<Utc>,
    },
}

impl TaskState {
    /// Coarse status for this state.
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskState::Queued => TaskStatus::Queued,
            TaskState::Running { .. } => TaskStatus::Running,
            TaskState::Succeeded { .. } => TaskStatus::Succeeded,
            TaskState::Failed { .. } => TaskStatus::Failed,
            TaskState::Cancelled { .. } => TaskStatus::Cancelled,
        }
    }
}

/// A unit of work and its genealogy links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique task identifier
    pub id: TaskId,
    /// Parent task, fixed at creation
    pub parent_id: Option<TaskId>,
    /// Stored priority (aging never changes it)
    pub priority: Priority,
    /// When the task was submitted
    pub submitted_at: DateTime<Utc>,
    /// Current lifecycle state
    pub state: TaskState,
    /// Child task IDs in submission order
    pub children: Vec<TaskId>,
}

impl TaskRecord {
    /// Create a new queued task.
    pub fn new(priority: Priority, parent_id: Option<TaskId>) -> Self {
        Self {
            id: TaskId::new(),
            parent_id,
            priority,
            submitted_at: Utc::now(),
            state: TaskState::Queued,
            children: Vec::new(),
        }
    }

    /// Current coarse status.
    pub fn status(&self) -> TaskStatus {
        self.state.status()
    }

    /// Whether this task has no parent.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Move to a new state, enforcing the lifecycle state machine.
    pub fn transition(&mut self, next: TaskState) -> Result<()> {
        let from = self.status();
        let to = next.status();
        if !from.can_transition_to(to) {
            return Err(Error::InvalidStateTransition { from, to });
        }
        self.state = next;
        Ok(())
    }

    /// Record a child, ignoring duplicates.
    pub(crate) fn add_child(&mut self, child: TaskId) {
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }
}
