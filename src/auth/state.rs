// Per-auth runtime quota state. Hot-path reads and updates are atomics; the
// shard lock is only taken to insert a state that does not exist yet.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Snapshots older than this are treated as absent.
pub const REAL_QUOTA_STALENESS_NANOS: i64 = 5 * 60 * 1_000_000_000;

const SHARD_COUNT: usize = 32;
const SHARD_MASK: usize = SHARD_COUNT - 1;

/// Point-in-time reading of a provider's authoritative quota endpoint.
/// Immutable after publication; replaced whole.
#[derive(Debug, Clone, PartialEq)]
pub struct RealQuotaSnapshot {
    /// Remaining capacity in [0, 1].
    pub remaining_fraction: f64,
    pub remaining_tokens: i64,
    /// Unix nanos when the provider window resets.
    pub window_reset_at: i64,
    /// Unix nanos when this reading was taken.
    pub fetched_at: i64,
}

#[derive(Debug, Default)]
pub struct AuthQuotaState {
    pub active_requests: AtomicI64,
    /// Unix nanos; account is unavailable until this passes.
    pub cooldown_until: AtomicI64,
    /// Unix nanos; exceptional administrative disable, separate from cooldown.
    pub disabled_until: AtomicI64,
    /// Tokens consumed inside the current quota window.
    pub total_tokens_used: AtomicU64,
    pub last_exhausted_at: AtomicI64,
    /// Tokens the account had consumed at the moment of its worst 429.
    pub learned_limit: AtomicU64,
    /// Nanos; cooldown length learned from Retry-After hints.
    pub learned_cooldown: AtomicI64,

    /// Escalation bookkeeping: 429 count inside the current window.
    pub quota_hits_in_window: AtomicU32,
    pub quota_window_started_at: AtomicI64,

    /// Copilot-style request-count window.
    pub window_count: AtomicU64,
    pub window_end: AtomicI64,

    /// Gemini-style token bucket, in millitokens for sub-token refill.
    pub bucket_millitokens: AtomicI64,
    pub bucket_last_fill: AtomicI64,

    real_quota: RwLock<Option<Arc<RealQuotaSnapshot>>>,
}

impl AuthQuotaState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a whole snapshot; readers see old or new, never a mix.
    pub fn publish_real_quota(&self, snapshot: RealQuotaSnapshot) {
        *self.real_quota.write() = Some(Arc::new(snapshot));
    }

    /// Fresh snapshot or None; stale readings count as absent.
    pub fn real_quota(&self, now_nanos: i64) -> Option<Arc<RealQuotaSnapshot>> {
        let guard = self.real_quota.read();
        let snapshot = guard.as_ref()?;
        if now_nanos - snapshot.fetched_at > REAL_QUOTA_STALENESS_NANOS {
            return None;
        }
        Some(Arc::clone(snapshot))
    }

    pub fn is_available(&self, now_nanos: i64) -> bool {
        self.cooldown_until.load(Ordering::Acquire) <= now_nanos
            && self.disabled_until.load(Ordering::Acquire) <= now_nanos
    }

    /// Earliest instant the account becomes selectable again.
    pub fn retry_at(&self, now_nanos: i64) -> i64 {
        let cooldown = self.cooldown_until.load(Ordering::Acquire);
        let disabled = self.disabled_until.load(Ordering::Acquire);
        cooldown.max(disabled).max(now_nanos)
    }

    /// CAS-maximum: learned limit only grows within a window.
    pub fn raise_learned_limit(&self, observed: u64) {
        let mut current = self.learned_limit.load(Ordering::Acquire);
        while observed > current {
            match self.learned_limit.compare_exchange_weak(
                current,
                observed,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

/// 32-way sharded `auth_id -> state` map. Power-of-two shard count so the
/// hash can be bit-masked.
pub struct StateMap {
    shards: Vec<RwLock<HashMap<String, Arc<AuthQuotaState>>>>,
}

impl Default for StateMap {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMap {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(RwLock::new(HashMap::new()));
        }
        Self { shards }
    }

    fn shard(&self, auth_id: &str) -> &RwLock<HashMap<String, Arc<AuthQuotaState>>> {
        let mut hasher = DefaultHasher::new();
        auth_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & SHARD_MASK]
    }

    pub fn get(&self, auth_id: &str) -> Option<Arc<AuthQuotaState>> {
        self.shard(auth_id).read().get(auth_id).cloned()
    }

    /// Lazily creates the state. The write lock is held only for insertion.
    pub fn get_or_create(&self, auth_id: &str) -> Arc<AuthQuotaState> {
        if let Some(state) = self.get(auth_id) {
            return state;
        }
        let shard = self.shard(auth_id);
        let mut guard = shard.write();
        guard
            .entry(auth_id.to_string())
            .or_insert_with(|| Arc::new(AuthQuotaState::new()))
            .clone()
    }

    pub fn remove(&self, auth_id: &str) -> Option<Arc<AuthQuotaState>> {
        self.shard(auth_id).write().remove(auth_id)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
