//! Shared working memory for tasks.
//!
//! - Temporal index: epoch-based recency per key
//! - Key-value store: gated, TTL-aware, capacity-bounded
//! - Persistence: SQLite write-through backing

pub mod kv;
pub mod persistence;
pub mod temporal;

pub use kv::{Expiry, KeyValueStore, StoreConfig, StoreEntry, StoreStats};
pub use persistence::{Persistence, SqlitePersistence};
pub use temporal::{IndexEntry, TemporalIndex};
