//! Admission and dispatch primitives.
//!
//! - Gate: bounded-concurrency admission with a wait-weighted waiter queue
//! - Scheduler: four-lane priority queue with aging

pub mod gate;
pub mod scheduler;

pub use gate::{AccessGate, GateConfig, GatePass, Token};
pub use scheduler::{PriorityScheduler, Scheduled, SchedulerConfig};
