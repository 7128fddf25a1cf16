//! Taskloom: in-process concurrent task execution.
//!
//! Taskloom runs prioritised async work on an elastic worker pool and gives
//! every task access to a shared, access-gated key-value store backed by
//! SQLite.

pub mod config;
pub mod coordination;
pub mod error;
pub mod executor;
pub mod logging;
pub mod pool;
pub mod registry;
pub mod store;
pub mod task;

pub use config::Config;
pub use coordination::{AccessGate, GateConfig, GatePass, PriorityScheduler, Scheduled, SchedulerConfig, Token};
pub use error::{Error, Result};
pub use executor::{Cancelled, Executor, ExecutorConfig, ExecutorStats, TaskContext};
pub use pool::{PoolConfig, PoolStats, TaskRunner, WorkforcePool};
pub use registry::{TaskCounts, TaskRegistry};
pub use store::{Expiry, KeyValueStore, SqlitePersistence, StoreConfig, StoreEntry, StoreStats, TemporalIndex};
pub use task::{Priority, TaskFailure, TaskId, TaskRecord, TaskState, TaskStatus};
