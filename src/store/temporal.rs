//! Epoch-based recency index.
//!
//! Every registration or access advances a per-index epoch counter by one,
//! giving a total order over store accesses. Recency is derived from how many
//! epochs have passed since a key was last touched, damped logarithmically so
//! that very old keys do not collapse to exactly the same score.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Recency bookkeeping for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Epoch at which the key was first registered.
    pub registration_epoch: u64,
    /// Epoch of the latest access.
    pub last_access_epoch: u64,
    /// Number of accesses, registration included.
    pub access_count: u64,
}

struct Inner {
    epoch: u64,
    entries: HashMap<String, IndexEntry>,
}

impl Inner {
    fn advance(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }
}

/// Recency tracker keyed by store key.
pub struct TemporalIndex {
    inner: Mutex<Inner>,
}

impl Default for TemporalIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl TemporalIndex {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                epoch: 0,
                entries: HashMap::new(),
            }),
        }
    }

    /// Register a key. An already registered key counts as accessed.
    pub fn register(&self, key: &str) -> u64 {
        self.touch(key)
    }

    /// Record an access, registering the key if needed.
    pub fn touch(&self, key: &str) -> u64 {
        let mut inner = self.inner.lock();
        let epoch = inner.advance();
        inner
            .entries
            .entry(key.to_string())
            .and_modify(|e| {
                e.last_access_epoch = epoch;
                e.access_count += 1;
            })
            .or_insert(IndexEntry {
                registration_epoch: epoch,
                last_access_epoch: epoch,
                access_count: 1,
            });
        epoch
    }

    /// Recency in `(0, 1]`, 1.0 for the most recently accessed key.
    pub fn recency_score(&self, key: &str) -> Option<f64> {
        let inner = self.inner.lock();
        let entry = inner.entries.get(key)?;
        Some(recency_from_age(inner.epoch - entry.last_access_epoch))
    }

    /// Recency scores for many keys under a single lock.
    pub(crate) fn recency_scores<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Vec<Option<f64>> {
        let inner = self.inner.lock();
        keys.into_iter()
            .map(|key| {
                inner
                    .entries
                    .get(key)
                    .map(|e| recency_from_age(inner.epoch - e.last_access_epoch))
            })
            .collect()
    }

    /// Latest epoch handed out.
    pub fn current_epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    /// Snapshot of a key's bookkeeping.
    pub fn entry(&self, key: &str) -> Option<IndexEntry> {
        self.inner.lock().entries.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop tracking a key. The epoch counter is untouched.
    pub(crate) fn forget(&self, key: &str) {
        self.inner.lock().entries.remove(key);
    }

    pub(crate) fn forget_many(&self, keys: &[String]) {
        let mut inner = self.inner.lock();
        for key in keys {
            inner.entries.remove(key);
        }
    }
}

/// `1 / (1 + ln(1 + age))`: 1.0 at age 0, strictly decreasing.
pub fn recency_from_age(age: u64) -> f64 {
    1.0 / (1.0 + (age as f64).ln_1p())
}
