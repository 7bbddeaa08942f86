// Auth pool and quota manager: availability filtering, scoring, sticky
// sessions, cooldowns and disable escalation. Selection reads only atomics;
// locks guard the cold paths (registration, sticky table).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::mpsc;

use super::refresher::{self, RefresherHandle};
use super::state::{AuthQuotaState, RealQuotaSnapshot, StateMap};
use super::strategy::{strategy_for_provider, ScoreStrategy};
use super::{now_nanos, Auth};
use crate::config;
use crate::error::ProxyError;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Scores within this distance of the best are a tie.
const TIE_WINDOW: i64 = 100;
/// Ties are broken among at most this many leaders.
const TIE_POOL: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct PickOptions {
    /// Skip the sticky entry and force a fresh scoring round.
    pub force_rotate: bool,
}

#[derive(Debug, Clone)]
struct StickyEntry {
    auth_id: String,
    expires_at: i64,
}

pub struct QuotaManager {
    states: Arc<StateMap>,
    strategies: RwLock<HashMap<String, Arc<dyn ScoreStrategy>>>,
    auths: RwLock<HashMap<String, Auth>>,
    sticky: Mutex<HashMap<(String, String), StickyEntry>>,
    refreshers: Mutex<HashMap<String, RefresherHandle>>,
    snapshot_tx: OnceCell<mpsc::Sender<(String, RealQuotaSnapshot)>>,
    enqueue_counter: AtomicU64,
}

impl Default for QuotaManager {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaManager {
    pub fn new() -> Self {
        Self {
            states: Arc::new(StateMap::new()),
            strategies: RwLock::new(HashMap::new()),
            auths: RwLock::new(HashMap::new()),
            sticky: Mutex::new(HashMap::new()),
            refreshers: Mutex::new(HashMap::new()),
            snapshot_tx: OnceCell::new(),
            enqueue_counter: AtomicU64::new(0),
        }
    }

    pub fn global() -> &'static QuotaManager {
        static INSTANCE: OnceCell<QuotaManager> = OnceCell::new();
        INSTANCE.get_or_init(QuotaManager::new)
    }

    fn strategy(&self, provider: &str) -> Arc<dyn ScoreStrategy> {
        if let Some(strategy) = self.strategies.read().get(provider) {
            return Arc::clone(strategy);
        }
        let mut guard = self.strategies.write();
        Arc::clone(
            guard
                .entry(provider.to_string())
                .or_insert_with(|| Arc::from(strategy_for_provider(provider))),
        )
    }

    pub fn state(&self, auth_id: &str) -> Arc<AuthQuotaState> {
        self.states.get_or_create(auth_id)
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    pub fn register_auth(&self, mut auth: Auth) {
        auth.enqueue_index = self.enqueue_counter.fetch_add(1, Ordering::AcqRel);
        let state = self.states.get_or_create(&auth.id);
        if auth.disabled_until > 0 {
            state
                .disabled_until
                .store(auth.disabled_until, Ordering::Release);
        }

        let strategy = self.strategy(&auth.provider);
        if strategy.real_quota_source().is_some() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let tx = self.snapshot_channel(&handle);
                let refresher = refresher::spawn(auth.clone(), strategy, tx);
                if let Some(old) = self
                    .refreshers
                    .lock()
                    .insert(auth.id.clone(), refresher)
                {
                    old.cancel();
                }
            }
        }

        self.auths.write().insert(auth.id.clone(), auth);
    }

    pub fn unregister_auth(&self, auth_id: &str) {
        if let Some(refresher) = self.refreshers.lock().remove(auth_id) {
            refresher.cancel();
        }
        self.auths.write().remove(auth_id);
        self.states.remove(auth_id);
        self.sticky
            .lock()
            .retain(|_, entry| entry.auth_id != auth_id);
    }

    pub fn registered(&self, auth_id: &str) -> Option<Auth> {
        self.auths.read().get(auth_id).cloned()
    }

    /// Registers an auth seen through the token store unless it already is;
    /// keeps enqueue order and refreshers stable across repeated listings.
    pub fn ensure_registered(&self, auth: &Auth) {
        if self.registered(&auth.id).is_none() {
            self.register_auth(auth.clone());
        }
    }

    pub fn shutdown(&self) {
        let mut refreshers = self.refreshers.lock();
        for (_, handle) in refreshers.drain() {
            handle.cancel();
        }
    }

    /// Bounded snapshot channel plus its drain task, created on first use.
    /// A snapshot for an unregistered auth is dropped, so cancellation means
    /// no further writes to that state.
    fn snapshot_channel(
        &self,
        handle: &tokio::runtime::Handle,
    ) -> mpsc::Sender<(String, RealQuotaSnapshot)> {
        self.snapshot_tx
            .get_or_init(|| {
                let (tx, mut rx) = mpsc::channel::<(String, RealQuotaSnapshot)>(64);
                let states = Arc::clone(&self.states);
                handle.spawn(async move {
                    while let Some((auth_id, snapshot)) = rx.recv().await {
                        if let Some(state) = states.get(&auth_id) {
                            state.publish_real_quota(snapshot);
                        }
                    }
                });
                tx
            })
            .clone()
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    pub fn pick(
        &self,
        provider: &str,
        model: &str,
        options: &PickOptions,
        candidates: &[Auth],
    ) -> Result<Auth, ProxyError> {
        let now = now_nanos();
        let strategy = self.strategy(provider);

        let mut available: Vec<&Auth> = Vec::with_capacity(candidates.len());
        for auth in candidates {
            if !auth.enabled {
                continue;
            }
            if !crate::registry::global().allows(&auth.id, model) {
                continue;
            }
            let state = self.states.get_or_create(&auth.id);
            if !state.is_available(now) {
                continue;
            }
            available.push(auth);
        }

        if available.is_empty() {
            let retry_at = candidates
                .iter()
                .map(|auth| self.states.get_or_create(&auth.id).retry_at(now))
                .min()
                .unwrap_or(now);
            let retry_after =
                Duration::from_nanos(retry_at.saturating_sub(now).max(0) as u64);
            return Err(ProxyError::quota(
                format!("no available account for {provider}/{model}"),
                Some(retry_after),
            ));
        }

        let sticky_cfg = config::get_config().sticky_session;
        let sticky_key = (provider.to_string(), model.to_string());
        if sticky_cfg.enabled && !options.force_rotate {
            let sticky = self.sticky.lock();
            if let Some(entry) = sticky.get(&sticky_key) {
                if entry.expires_at > now {
                    if let Some(auth) = available.iter().find(|a| a.id == entry.auth_id) {
                        let winner = (*auth).clone();
                        drop(sticky);
                        self.begin_request(&winner, &strategy, now);
                        self.refresh_sticky(sticky_key, &winner.id, &sticky_cfg, now);
                        return Ok(winner);
                    }
                    // Stuck account unavailable: entry stays, scoring decides.
                }
            }
        }

        let mut scored: Vec<(i64, u64, &Auth)> = available
            .iter()
            .map(|auth| {
                let state = self.states.get_or_create(&auth.id);
                (strategy.score(&state, now), auth.enqueue_index, *auth)
            })
            .collect();
        scored.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        let best = scored[0].0;
        let tied: Vec<usize> = scored
            .iter()
            .take(TIE_POOL)
            .enumerate()
            .filter(|(_, (score, _, _))| score - best < TIE_WINDOW)
            .map(|(i, _)| i)
            .collect();
        let chosen = if tied.len() > 1 {
            tied[rand::thread_rng().gen_range(0..tied.len())]
        } else {
            0
        };

        let winner = scored[chosen].2.clone();
        self.begin_request(&winner, &strategy, now);
        if sticky_cfg.enabled {
            self.refresh_sticky(sticky_key, &winner.id, &sticky_cfg, now);
        }
        Ok(winner)
    }

    fn begin_request(&self, auth: &Auth, strategy: &Arc<dyn ScoreStrategy>, now: i64) {
        let state = self.states.get_or_create(&auth.id);
        state.active_requests.fetch_add(1, Ordering::AcqRel);
        strategy.on_request_start(&state, now);
    }

    fn refresh_sticky(
        &self,
        key: (String, String),
        auth_id: &str,
        cfg: &config::StickySessionConfig,
        now: i64,
    ) {
        self.sticky.lock().insert(
            key,
            StickyEntry {
                auth_id: auth_id.to_string(),
                expires_at: now + cfg.ttl as i64 * NANOS_PER_SEC,
            },
        );
    }

    /// Drops the sticky entry for an explicit rotation request.
    pub fn evict_sticky(&self, provider: &str, model: &str) {
        self.sticky
            .lock()
            .remove(&(provider.to_string(), model.to_string()));
    }

    // -----------------------------------------------------------------------
    // Request accounting
    // -----------------------------------------------------------------------

    pub fn record_request_start(&self, auth_id: &str) {
        let state = self.states.get_or_create(auth_id);
        state.active_requests.fetch_add(1, Ordering::AcqRel);
    }

    /// Paired with `pick` (or `record_request_start`); never drives the
    /// counter below zero even if called unpaired.
    pub fn record_request_end(&self, auth_id: &str, tokens_used: u64) {
        let state = self.states.get_or_create(auth_id);
        let _ = state
            .active_requests
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current > 0).then_some(current - 1)
            });
        if tokens_used > 0 {
            state
                .total_tokens_used
                .fetch_add(tokens_used, Ordering::AcqRel);
        }
    }

    /// 429 handling: learn the window limit, assign the cooldown, reset the
    /// rolling usage, and escalate to a disable after repeated hits.
    pub fn record_quota_hit(&self, auth_id: &str, cooldown_hint: Option<Duration>) {
        let cfg = config::get_config();
        let now = now_nanos();
        let state = self.states.get_or_create(auth_id);
        let provider = self
            .registered(auth_id)
            .map(|a| a.provider)
            .unwrap_or_default();
        let strategy = self.strategy(&provider);

        state.last_exhausted_at.store(now, Ordering::Release);
        let used = state.total_tokens_used.swap(0, Ordering::AcqRel);
        state.raise_learned_limit(used);
        strategy.on_quota_hit(&state, now);

        if cfg.disable_cooling {
            return;
        }

        let cooldown = cooldown_hint.unwrap_or_else(|| strategy.default_cooldown(&state, now));
        state
            .cooldown_until
            .store(now + cooldown.as_nanos() as i64, Ordering::Release);
        if cooldown_hint.is_some() {
            state
                .learned_cooldown
                .store(cooldown.as_nanos() as i64, Ordering::Release);
        }

        // Escalation: repeated hits inside the window disable the account.
        let window_nanos = cfg.quota_hit_disable_window as i64 * NANOS_PER_SEC;
        let window_start = state.quota_window_started_at.load(Ordering::Acquire);
        if window_start == 0 || now - window_start > window_nanos {
            state.quota_window_started_at.store(now, Ordering::Release);
            state.quota_hits_in_window.store(1, Ordering::Release);
        } else {
            let hits = state.quota_hits_in_window.fetch_add(1, Ordering::AcqRel) + 1;
            if hits >= cfg.quota_hit_disable_threshold {
                state
                    .disabled_until
                    .store(now + window_nanos, Ordering::Release);
                tracing::warn!(
                    auth_id,
                    hits,
                    "repeated quota hits, disabling account for the window"
                );
            }
        }
    }

    /// Marks the auth disabled (persistent auth failure path).
    pub fn disable_auth(&self, auth_id: &str, duration: Duration) {
        let state = self.states.get_or_create(auth_id);
        state.disabled_until.store(
            now_nanos() + duration.as_nanos() as i64,
            Ordering::Release,
        );
    }
}
