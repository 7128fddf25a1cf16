//! Shared key-value store used as working memory across tasks.
//!
//! Entries live in a fixed number of `RwLock`ed shards so that operations on
//! disjoint keys rarely contend. Mutations pass through the [`AccessGate`]
//! and write through to an optional [`Persistence`] backend.
//!
//! Overwriting an existing key only locks that key's shard. Writing a new key
//! holds the eviction mutex and every shard while it makes room and inserts,
//! so the entry count never exceeds `capacity` once a write returns.
//!
//! Write-through to persistence is synchronous and happens under the shard
//! write lock, so the calling runtime thread blocks for the duration of the
//! SQLite write.
//!
//! Lock order: shard -> temporal index, shard -> persistence. Eviction holds
//! the eviction mutex, then every shard in index order, then the index, then
//! the jitter rng.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::coordination::gate::AccessGate;
use crate::error::{Error, Result};
use crate::store::persistence::Persistence;
use crate::store::temporal::TemporalIndex;

/// A stored value with its expiry and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreEntry {
    pub key: String,
    pub value: Value,
    /// When the entry was last written.
    pub created_at: DateTime<Utc>,
    /// Time to live from `created_at` (None = never expires).
    pub ttl: Option<Duration>,
    /// Free-form metadata supplied by the writer.
    pub metadata: Value,
}

impl StoreEntry {
    /// Whether the entry is unreadable at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => match chrono::Duration::from_std(ttl) {
                Ok(ttl) => now >= self.created_at + ttl,
                Err(_) => false,
            },
            None => false,
        }
    }
}

/// How long a written entry stays readable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Expiry {
    /// Use the store's `default_ttl`.
    #[default]
    Default,
    /// Never expire.
    Never,
    /// Expire after the given duration.
    After(Duration),
}

impl From<Option<Duration>> for Expiry {
    fn from(ttl: Option<Duration>) -> Self {
        ttl.map_or(Expiry::Default, Expiry::After)
    }
}

/// Configuration for the key-value store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum live entries before eviction kicks in.
    pub capacity: usize,
    /// TTL applied when a write does not specify one.
    pub default_ttl: Option<Duration>,
    /// Number of lock shards.
    pub shards: usize,
    /// How long a mutation may wait for an access token.
    pub acquire_timeout: Duration,
    /// Period of the background expiry sweep.
    pub sweep_interval: Duration,
    /// Upper bound of the uniform jitter added to eviction scores.
    pub eviction_jitter: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            default_ttl: None,
            shards: 16,
            acquire_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
            eviction_jitter: 0.02,
        }
    }
}

/// Store counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl StoreStats {
    /// Fraction of reads that found a live entry.
    pub fn hit_ratio(&self) -> f64 {
        let reads = self.hits + self.misses;
        if reads == 0 { 0.0 } else { self.hits as f64 / reads as f64 }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// An entry competing for survival during eviction.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: String,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

/// Eviction score: recency plus jitter. Lower scores are evicted first.
pub fn eviction_score(recency: f64, jitter: f64) -> f64 {
    recency + jitter
}

/// Keys of the `count` lowest-scoring candidates, oldest first on ties.
pub fn select_victims(mut candidates: Vec<EvictionCandidate>, count: usize) -> Vec<String> {
    candidates.sort_by(|a, b| a.score.total_cmp(&b.score).then(a.created_at.cmp(&b.created_at)));
    candidates.into_iter().take(count).map(|c| c.key).collect()
}

type Shard = RwLock<HashMap<String, StoreEntry>>;
type ShardGuard<'a> = RwLockWriteGuard<'a, HashMap<String, StoreEntry>>;

/// Gated, TTL-aware, capacity-bounded key-value store.
pub struct KeyValueStore {
    config: StoreConfig,
    shards: Vec<Shard>,
    gate: Arc<AccessGate>,
    index: TemporalIndex,
    eviction: Mutex<()>,
    rng: Mutex<Box<dyn RngCore + Send>>,
    persistence: Option<Box<dyn Persistence>>,
    counters: Counters,
}

impl KeyValueStore {
    /// Create an in-memory store.
    pub fn new(config: StoreConfig, gate: Arc<AccessGate>) -> Self {
        let shard_count = config.shards.max(1);
        Self {
            config,
            shards: (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect(),
            gate,
            index: TemporalIndex::new(),
            eviction: Mutex::new(()),
            rng: Mutex::new(Box::new(StdRng::from_entropy())),
            persistence: None,
            counters: Counters::default(),
        }
    }

    /// Open a store backed by `persistence`, reloading its live entries.
    ///
    /// Expired rows are deleted. Surviving keys are registered with the
    /// temporal index at fresh epochs in `created_at` order, then any overflow
    /// beyond `capacity` is evicted.
    pub fn open(config: StoreConfig, gate: Arc<AccessGate>, persistence: Box<dyn Persistence>) -> Result<Self> {
        let mut store = Self::new(config, gate);
        let mut entries = persistence.load()?;
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let now = Utc::now();
        let mut expired = Vec::new();
        for entry in entries {
            if entry.is_expired_at(now) {
                expired.push(entry.key);
                continue;
            }
            store.index.register(&entry.key);
            let shard = store.shard_index(&entry.key);
            store.shards[shard].get_mut().insert(entry.key.clone(), entry);
        }
        persistence.remove_many(&expired)?;
        store.counters.expirations.fetch_add(expired.len() as u64, Ordering::Relaxed);
        store.persistence = Some(persistence);

        let evicted = store.evict_overflow()?;
        log::info!(
            "store opened with {} entries ({} expired rows dropped, {} evicted)",
            store.len(),
            expired.len(),
            evicted
        );
        Ok(store)
    }

    /// Replace the eviction jitter source.
    pub fn with_rng(mut self, rng: Box<dyn RngCore + Send>) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The gate guarding mutations.
    pub fn gate(&self) -> &Arc<AccessGate> {
        &self.gate
    }

    /// The recency index.
    pub fn index(&self) -> &TemporalIndex {
        &self.index
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn shard(&self, key: &str) -> &Shard {
        &self.shards[self.shard_index(key)]
    }

    /// Write a value. `ttl` of `None` applies the store default.
    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.set_with(key, value, ttl.into(), Value::Object(Default::default()))
            .await
    }

    /// Write a value with explicit expiry and metadata.
    pub async fn set_with(&self, key: &str, value: Value, expiry: Expiry, metadata: Value) -> Result<()> {
        let _pass = self
            .gate
            .enter(&format!("set:{key}"), self.config.acquire_timeout)
            .await?;

        let ttl = match expiry {
            Expiry::Default => self.config.default_ttl,
            Expiry::Never => None,
            Expiry::After(ttl) => Some(ttl),
        };
        let entry = StoreEntry {
            key: key.to_string(),
            value,
            created_at: Utc::now(),
            ttl,
            metadata,
        };

        {
            let mut shard = self.shard(key).write();
            if let Some(slot) = shard.get_mut(key) {
                if let Some(persistence) = &self.persistence {
                    persistence.upsert(&entry)?;
                }
                *slot = entry;
                self.index.touch(key);
                log::debug!("set {key}");
                return Ok(());
            }
        }

        let _eviction = self.eviction.lock();
        let mut shards: Vec<ShardGuard<'_>> = self.shards.iter().map(|s| s.write()).collect();
        let idx = self.shard_index(key);
        // Another writer may have created the key since the shard was checked
        if !shards[idx].contains_key(key) {
            self.evict_locked(&mut shards, self.config.capacity.saturating_sub(1))?;
        }
        if let Some(persistence) = &self.persistence {
            persistence.upsert(&entry)?;
        }
        shards[idx].insert(key.to_string(), entry);
        self.index.touch(key);
        log::debug!("set {key}");
        Ok(())
    }

    /// Read a live value.
    pub fn get(&self, key: &str) -> Result<Value> {
        self.get_entry(key).map(|entry| entry.value)
    }

    /// Read a live entry with its metadata.
    pub fn get_entry(&self, key: &str) -> Result<StoreEntry> {
        let now = Utc::now();
        let expired_at = {
            let shard = self.shard(key).read();
            match shard.get(key) {
                Some(entry) if !entry.is_expired_at(now) => {
                    self.index.touch(key);
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.clone());
                }
                Some(entry) => Some(entry.created_at),
                None => None,
            }
        };

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(created_at) = expired_at {
            self.expire(key, created_at, now);
        }
        Err(Error::KeyNotFound { key: key.to_string() })
    }

    /// Remove an entry lazily found expired, unless it was rewritten meanwhile.
    fn expire(&self, key: &str, created_at: DateTime<Utc>, now: DateTime<Utc>) {
        let mut shard = self.shard(key).write();
        let still_expired = shard
            .get(key)
            .is_some_and(|e| e.created_at == created_at && e.is_expired_at(now));
        if !still_expired {
            return;
        }
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.remove(key) {
                log::warn!("failed to remove expired key {key} from storage: {e}");
                return;
            }
        }
        shard.remove(key);
        self.index.forget(key);
        self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        log::debug!("expired {key}");
    }

    /// Delete a key. Returns whether a live entry was removed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let _pass = self
            .gate
            .enter(&format!("delete:{key}"), self.config.acquire_timeout)
            .await?;

        let mut shard = self.shard(key).write();
        let Some(existing) = shard.get(key) else {
            return Ok(false);
        };
        let live = !existing.is_expired_at(Utc::now());
        if let Some(persistence) = &self.persistence {
            persistence.remove(key)?;
        }
        shard.remove(key);
        self.index.forget(key);
        log::debug!("deleted {key}");
        Ok(live)
    }

    /// Live keys, sorted, optionally filtered by prefix.
    pub fn list(&self, prefix: Option<&str>) -> Vec<String> {
        let now = Utc::now();
        let mut keys: Vec<String> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .values()
                    .filter(|e| !e.is_expired_at(now))
                    .filter(|e| prefix.is_none_or(|p| e.key.starts_with(p)))
                    .map(|e| e.key.clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        keys.sort();
        keys
    }

    /// Whether a live entry exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        let now = Utc::now();
        self.shard(key).read().get(key).is_some_and(|e| !e.is_expired_at(now))
    }

    /// Stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        // All shards at once, so a concurrent evict-and-insert is never counted twice
        let shards: Vec<_> = self.shards.iter().map(|s| s.read()).collect();
        shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut purged = 0;
        for shard in &self.shards {
            let mut shard = shard.write();
            let expired: Vec<String> = shard
                .values()
                .filter(|e| e.is_expired_at(now))
                .map(|e| e.key.clone())
                .collect();
            if expired.is_empty() {
                continue;
            }
            if let Some(persistence) = &self.persistence {
                persistence.remove_many(&expired)?;
            }
            for key in &expired {
                shard.remove(key);
            }
            self.index.forget_many(&expired);
            purged += expired.len();
        }
        self.counters.expirations.fetch_add(purged as u64, Ordering::Relaxed);
        Ok(purged)
    }

    /// Evict the lowest-scoring entries until `len <= capacity`.
    fn evict_overflow(&self) -> Result<usize> {
        let _eviction = self.eviction.lock();
        let mut shards: Vec<ShardGuard<'_>> = self.shards.iter().map(|s| s.write()).collect();
        self.evict_locked(&mut shards, self.config.capacity)
    }

    /// Shrink the store to at most `limit` entries. Returns how many live
    /// entries were evicted.
    ///
    /// Expired entries are dropped first and counted as expirations; live
    /// entries are scored only if that leaves the store above `limit`.
    /// Callers hold the eviction mutex and pass every shard guard in order.
    fn evict_locked(&self, shards: &mut [ShardGuard<'_>], limit: usize) -> Result<usize> {
        let total: usize = shards.iter().map(|s| s.len()).sum();
        if total <= limit {
            return Ok(0);
        }

        let now = Utc::now();
        let expired: Vec<String> = shards
            .iter()
            .flat_map(|s| s.values())
            .filter(|e| e.is_expired_at(now))
            .map(|e| e.key.clone())
            .collect();
        if !expired.is_empty() {
            if let Some(persistence) = &self.persistence {
                persistence.remove_many(&expired)?;
            }
            for key in &expired {
                let shard = self.shard_index(key);
                shards[shard].remove(key);
            }
            self.index.forget_many(&expired);
            self.counters.expirations.fetch_add(expired.len() as u64, Ordering::Relaxed);
            log::debug!("dropped {} expired entries ahead of eviction", expired.len());
        }

        let total = total - expired.len();
        if total <= limit {
            return Ok(0);
        }
        let excess = total - limit;

        let entries: Vec<(&String, DateTime<Utc>)> = shards
            .iter()
            .flat_map(|s| s.values())
            .map(|e| (&e.key, e.created_at))
            .collect();
        let recency = self.index.recency_scores(entries.iter().map(|(k, _)| k.as_str()));

        let candidates: Vec<EvictionCandidate> = {
            let mut rng = self.rng.lock();
            entries
                .iter()
                .zip(recency)
                .map(|((key, created_at), recency)| {
                    let jitter = if self.config.eviction_jitter > 0.0 {
                        rng.gen_range(0.0..=self.config.eviction_jitter)
                    } else {
                        0.0
                    };
                    EvictionCandidate {
                        key: (*key).clone(),
                        score: eviction_score(recency.unwrap_or(0.0), jitter),
                        created_at: *created_at,
                    }
                })
                .collect()
        };
        let victims = select_victims(candidates, excess);

        if let Some(persistence) = &self.persistence {
            persistence.remove_many(&victims)?;
        }
        for key in &victims {
            let shard = self.shard_index(key);
            shards[shard].remove(key);
        }
        self.index.forget_many(&victims);
        self.counters.evictions.fetch_add(victims.len() as u64, Ordering::Relaxed);
        log::debug!("evicted {} entries: {:?}", victims.len(), victims);
        Ok(victims.len())
    }

    /// Spawn the periodic expiry sweep. Stops once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                match store.purge_expired() {
                    Ok(0) => {}
                    Ok(purged) => log::debug!("sweeper purged {purged} expired entries"),
                    Err(e) => log::warn!("expiry sweep failed: {e}"),
                }
                store.gate.reap_expired();
            }
        })
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            entries: self.len(),
            capacity: self.config.capacity,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
        }
    }
}
