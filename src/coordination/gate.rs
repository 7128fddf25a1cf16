//! Bounded-concurrency access gate.
//!
//! At most `max_concurrent` [`Token`]s are outstanding at any instant. Callers
//! that find the gate saturated wait in a queue; when a slot frees up it goes
//! to one waiter picked by a weighted random draw whose weight grows with the
//! time spent waiting. Long waiters therefore win with probability tending to
//! one, while near-simultaneous arrivals are served in random order.
//!
//! Tokens carry a lease. A token that is lost without being released (for
//! example because the acquiring future was dropped right after the grant) is
//! reclaimed once its lease expires. The gate remembers a reclaimed token for
//! one further lease so a late release is recognised; after that a release of
//! it is logged and ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tokio::sync::oneshot;

use crate::error::{Error, Result};

static NEXT_GATE_ID: AtomicU64 = AtomicU64::new(1);

/// Configuration for an access gate.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Maximum outstanding tokens.
    pub max_concurrent: usize,
    /// Lease after which an unreleased token is reclaimed (None = never).
    pub token_lease: Option<Duration>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            token_lease: Some(Duration::from_secs(30)),
        }
    }
}

/// Proof of one admitted unit of concurrent access.
///
/// Not `Clone`: [`AccessGate::release`] consumes it.
#[derive(Debug)]
pub struct Token {
    id: u64,
    gate_id: u64,
    holder: String,
    issued_at: DateTime<Utc>,
    expires_at: Option<Instant>,
}

impl Token {
    /// Token ID, unique within its gate.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Who acquired the token.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// When the token was granted.
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// When the lease runs out, if the gate uses leases.
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }
}

#[derive(Debug)]
struct Grant {
    holder: String,
    expires_at: Option<Instant>,
}

struct Waiter {
    id: u64,
    arrived_at: Instant,
    holder: String,
    tx: oneshot::Sender<Token>,
}

#[derive(Default)]
struct GateState {
    active: HashMap<u64, Grant>,
    waiters: Vec<Waiter>,
    /// Tokens reclaimed by lease expiry, with the reclaim instant.
    reclaimed: HashMap<u64, Instant>,
    next_token: u64,
    next_waiter: u64,
}

/// Selection weight for a waiter that has waited `waited`.
///
/// Grows quadratically with wait time, so the longest waiter's share of the
/// total weight tends to one as it keeps waiting.
pub fn wait_weight(waited: Duration) -> f64 {
    let centis = waited.as_secs_f64() * 100.0;
    1.0 + centis * centis
}

/// Index chosen by a weighted draw. `roll` is uniform in `[0, 1)`.
///
/// Returns `None` only for an empty slice.
pub fn pick_weighted(weights: &[f64], roll: f64) -> Option<usize> {
    if weights.is_empty() {
        return None;
    }
    let total: f64 = weights.iter().sum();
    let mut target = roll.clamp(0.0, 1.0) * total;
    for (idx, weight) in weights.iter().enumerate() {
        if target < *weight {
            return Some(idx);
        }
        target -= weight;
    }
    Some(weights.len() - 1)
}

/// Admission control for shared state.
pub struct AccessGate {
    id: u64,
    config: GateConfig,
    state: Mutex<GateState>,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl AccessGate {
    /// Create a new gate with an entropy-seeded randomness source.
    pub fn new(config: GateConfig) -> Self {
        Self::with_rng(config, Box::new(StdRng::from_entropy()))
    }

    /// Create a gate with an explicit randomness source (deterministic tests).
    pub fn with_rng(config: GateConfig, rng: Box<dyn RngCore + Send>) -> Self {
        Self {
            id: NEXT_GATE_ID.fetch_add(1, Ordering::Relaxed),
            config: GateConfig {
                max_concurrent: config.max_concurrent.max(1),
                ..config
            },
            state: Mutex::new(GateState::default()),
            rng: Mutex::new(rng),
        }
    }

    /// Maximum outstanding tokens.
    pub fn capacity(&self) -> usize {
        self.config.max_concurrent
    }

    /// Tokens currently outstanding.
    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Callers currently waiting for a slot.
    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Acquire a token, waiting at most `timeout` for a slot.
    pub async fn acquire(&self, holder: &str, timeout: Duration) -> Result<Token> {
        let (tx, mut rx) = oneshot::channel();
        let waiter_id = {
            let mut state = self.state.lock();
            self.reclaim_expired(&mut state, Instant::now());

            if state.active.len() < self.config.max_concurrent {
                return Ok(self.issue(&mut state, holder.to_string()));
            }

            let id = state.next_waiter;
            state.next_waiter += 1;
            state.waiters.push(Waiter {
                id,
                arrived_at: Instant::now(),
                holder: holder.to_string(),
                tx,
            });
            log::debug!("gate {}: {} waiting ({} queued)", self.id, holder, state.waiters.len());
            id
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(token)) => Ok(token),
            // Sender dropped without a grant; treat like a missed deadline
            Ok(Err(_)) => Err(Error::AcquireTimeout { waited: timeout }),
            Err(_) => {
                let mut state = self.state.lock();
                if let Some(pos) = state.waiters.iter().position(|w| w.id == waiter_id) {
                    state.waiters.remove(pos);
                } else if let Ok(token) = rx.try_recv() {
                    // Granted while the deadline fired: hand the slot on
                    self.release_locked(&mut state, token);
                }
                Err(Error::AcquireTimeout { waited: timeout })
            }
        }
    }

    /// Acquire a pass that releases its token when dropped.
    pub async fn enter(&self, holder: &str, timeout: Duration) -> Result<GatePass<'_>> {
        let token = self.acquire(holder, timeout).await?;
        Ok(GatePass {
            gate: self,
            token: Some(token),
        })
    }

    /// Return a token to the gate.
    ///
    /// # Panics
    ///
    /// Panics if the token was not issued by this gate; that is a
    /// programming error.
    pub fn release(&self, token: Token) {
        let mut state = self.state.lock();
        self.release_locked(&mut state, token);
    }

    /// Reclaim tokens whose lease has run out. Returns how many were reclaimed.
    pub fn reap_expired(&self) -> usize {
        let mut state = self.state.lock();
        self.reclaim_expired(&mut state, Instant::now())
    }

    fn issue(&self, state: &mut GateState, holder: String) -> Token {
        let id = state.next_token;
        state.next_token += 1;
        let expires_at = self.config.token_lease.map(|lease| Instant::now() + lease);
        state.active.insert(
            id,
            Grant {
                holder: holder.clone(),
                expires_at,
            },
        );
        Token {
            id,
            gate_id: self.id,
            holder,
            issued_at: Utc::now(),
            expires_at,
        }
    }

    fn release_locked(&self, state: &mut GateState, token: Token) {
        assert_eq!(
            token.gate_id, self.id,
            "token {} released to gate {} but issued by gate {}",
            token.id, self.id, token.gate_id
        );
        if state.active.remove(&token.id).is_none() {
            assert!(
                token.id < state.next_token,
                "token {} was never issued by gate {}",
                token.id,
                self.id
            );
            if state.reclaimed.remove(&token.id).is_some() {
                log::debug!("gate {}: token {} released after lease reclaim", self.id, token.id);
            } else {
                log::warn!("gate {}: ignoring release of long-reclaimed token {}", self.id, token.id);
            }
            return;
        }
        self.grant_waiters(state);
    }

    fn reclaim_expired(&self, state: &mut GateState, now: Instant) -> usize {
        if let Some(lease) = self.config.token_lease {
            state
                .reclaimed
                .retain(|_, reclaimed_at| now.saturating_duration_since(*reclaimed_at) < lease);
        }

        let expired: Vec<u64> = state
            .active
            .iter()
            .filter(|(_, grant)| grant.expires_at.is_some_and(|at| at <= now))
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(grant) = state.active.remove(id) {
                log::warn!("gate {}: reclaimed token {} held by {} past its lease", self.id, id, grant.holder);
            }
            state.reclaimed.insert(*id, now);
        }
        if !expired.is_empty() {
            self.grant_waiters(state);
        }
        expired.len()
    }

    fn grant_waiters(&self, state: &mut GateState) {
        while state.active.len() < self.config.max_concurrent && !state.waiters.is_empty() {
            let now = Instant::now();
            let weights: Vec<f64> = state
                .waiters
                .iter()
                .map(|w| wait_weight(now.saturating_duration_since(w.arrived_at)))
                .collect();
            let roll = self.rng.lock().gen_range(0.0..1.0);
            let Some(idx) = pick_weighted(&weights, roll) else {
                break;
            };

            let waiter = state.waiters.remove(idx);
            let token = self.issue(state, waiter.holder);
            if let Err(token) = waiter.tx.send(token) {
                // Waiter gave up; take the slot back and try the next one
                state.active.remove(&token.id);
            }
        }
    }
}

/// RAII guard over a gate token.
pub struct GatePass<'a> {
    gate: &'a AccessGate,
    token: Option<Token>,
}

impl GatePass<'_> {
    /// The underlying token.
    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.gate.release(token);
        }
    }
}
