// Per-provider scoring strategies. All scores are lower-is-better i64 values
// computed from atomic reads only; no strategy takes a lock on the hot path.

use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::future::BoxFuture;

use super::state::AuthQuotaState;
use super::Auth;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Weight of one in-flight request in every formula.
const ACTIVE_REQUEST_WEIGHT: i64 = 1000;

/// Assumed per-window token capacity before a 429 teaches the real one.
const DEFAULT_TOKEN_LIMIT: u64 = 4_000_000;

/// Fetches the authoritative quota reading for strategies that have one.
pub trait RealQuotaSource: Send + Sync {
    fn fetch(&self, auth: Auth) -> BoxFuture<'static, anyhow::Result<super::RealQuotaSnapshot>>;
}

pub trait ScoreStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower is better. Must only read atomics.
    fn score(&self, state: &AuthQuotaState, now_nanos: i64) -> i64;

    /// Cooldown applied on 429 when the response carried no hint.
    fn default_cooldown(&self, state: &AuthQuotaState, now_nanos: i64) -> Duration;

    /// Extra bookkeeping on selection (token buckets, request windows).
    fn on_request_start(&self, _state: &AuthQuotaState, _now_nanos: i64) {}

    /// Extra bookkeeping on 429 (bucket drain).
    fn on_quota_hit(&self, _state: &AuthQuotaState, _now_nanos: i64) {}

    /// Background real-quota poller, for strategies that have a quota API.
    fn real_quota_source(&self) -> Option<&dyn RealQuotaSource> {
        None
    }
}

fn usage_ratio_score(state: &AuthQuotaState, weight: i64) -> i64 {
    let used = state.total_tokens_used.load(Ordering::Acquire);
    let mut limit = state.learned_limit.load(Ordering::Acquire);
    if limit == 0 {
        limit = DEFAULT_TOKEN_LIMIT;
    }
    let ratio = (used as f64 / limit as f64).min(1.0);
    (ratio * weight as f64) as i64
}

fn active_base(state: &AuthQuotaState) -> i64 {
    state.active_requests.load(Ordering::Acquire) * ACTIVE_REQUEST_WEIGHT
}

// ---------------------------------------------------------------------------
// Default
// ---------------------------------------------------------------------------

pub struct DefaultStrategy;

impl ScoreStrategy for DefaultStrategy {
    fn name(&self) -> &'static str {
        "default"
    }

    fn score(&self, state: &AuthQuotaState, _now_nanos: i64) -> i64 {
        active_base(state) + usage_ratio_score(state, 500)
    }

    fn default_cooldown(&self, _state: &AuthQuotaState, _now_nanos: i64) -> Duration {
        Duration::from_secs(30 * 60)
    }
}

// ---------------------------------------------------------------------------
// Antigravity: real-quota capable
// ---------------------------------------------------------------------------

pub struct AntigravityStrategy {
    source: Option<Box<dyn RealQuotaSource>>,
}

impl AntigravityStrategy {
    pub fn new(source: Option<Box<dyn RealQuotaSource>>) -> Self {
        Self { source }
    }
}

impl ScoreStrategy for AntigravityStrategy {
    fn name(&self) -> &'static str {
        "antigravity"
    }

    fn score(&self, state: &AuthQuotaState, now_nanos: i64) -> i64 {
        let base = active_base(state);
        match state.real_quota(now_nanos) {
            Some(snapshot) => {
                let exhausted = (1.0 - snapshot.remaining_fraction).clamp(0.0, 1.0);
                base + (exhausted * 800.0) as i64
            }
            None => base + usage_ratio_score(state, 500),
        }
    }

    fn default_cooldown(&self, _state: &AuthQuotaState, _now_nanos: i64) -> Duration {
        Duration::from_secs(5 * 3600)
    }

    fn real_quota_source(&self) -> Option<&dyn RealQuotaSource> {
        self.source.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Claude: default formula, limit learned from 429s
// ---------------------------------------------------------------------------

pub struct ClaudeStrategy;

impl ScoreStrategy for ClaudeStrategy {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn score(&self, state: &AuthQuotaState, _now_nanos: i64) -> i64 {
        active_base(state) + usage_ratio_score(state, 500)
    }

    fn default_cooldown(&self, _state: &AuthQuotaState, _now_nanos: i64) -> Duration {
        Duration::from_secs(5 * 3600)
    }
}

// ---------------------------------------------------------------------------
// Copilot: request-count window (24 h)
// ---------------------------------------------------------------------------

pub struct CopilotStrategy {
    pub window: Duration,
    pub request_limit: u64,
}

impl Default for CopilotStrategy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(24 * 3600),
            request_limit: 300,
        }
    }
}

impl CopilotStrategy {
    /// Resets the {count, window_end} pair once the window has passed. The
    /// CAS on window_end elects a single resetting thread.
    fn roll_window(&self, state: &AuthQuotaState, now_nanos: i64) {
        let end = state.window_end.load(Ordering::Acquire);
        if now_nanos <= end {
            return;
        }
        let new_end = now_nanos + self.window.as_nanos() as i64;
        if state
            .window_end
            .compare_exchange(end, new_end, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            state.window_count.store(0, Ordering::Release);
        }
    }
}

impl ScoreStrategy for CopilotStrategy {
    fn name(&self) -> &'static str {
        "copilot"
    }

    fn score(&self, state: &AuthQuotaState, now_nanos: i64) -> i64 {
        self.roll_window(state, now_nanos);
        let count = state.window_count.load(Ordering::Acquire);
        let ratio = (count as f64 / self.request_limit as f64).min(1.0);
        active_base(state) + (ratio * 600.0) as i64
    }

    fn default_cooldown(&self, state: &AuthQuotaState, now_nanos: i64) -> Duration {
        // Cool until the current window closes, not a fixed span.
        let window_end = state.window_end.load(Ordering::Acquire);
        if window_end > now_nanos {
            return Duration::from_nanos((window_end - now_nanos) as u64);
        }
        self.window
    }

    fn on_request_start(&self, state: &AuthQuotaState, now_nanos: i64) {
        self.roll_window(state, now_nanos);
        state.window_count.fetch_add(1, Ordering::AcqRel);
    }

    fn on_quota_hit(&self, state: &AuthQuotaState, _now_nanos: i64) {
        state
            .window_count
            .store(self.request_limit, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Gemini: RPM token bucket
// ---------------------------------------------------------------------------

pub struct GeminiStrategy {
    /// Bucket capacity in whole requests.
    pub capacity: i64,
    /// Refill rate in requests per second.
    pub fill_per_sec: f64,
}

impl Default for GeminiStrategy {
    fn default() -> Self {
        // 60 RPM: capacity 60, refilling one per second.
        Self {
            capacity: 60,
            fill_per_sec: 1.0,
        }
    }
}

impl GeminiStrategy {
    const MILLI: i64 = 1000;

    /// Refills the bucket from elapsed time. The monotonic CAS on last_fill
    /// elects one refiller; losers read the refreshed value.
    fn refill(&self, state: &AuthQuotaState, now_nanos: i64) -> i64 {
        let last = state.bucket_last_fill.load(Ordering::Acquire);
        if last == 0 {
            // First touch: start full.
            if state
                .bucket_last_fill
                .compare_exchange(0, now_nanos, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                state
                    .bucket_millitokens
                    .store(self.capacity * Self::MILLI, Ordering::Release);
            }
            return state.bucket_millitokens.load(Ordering::Acquire);
        }

        let elapsed = now_nanos.saturating_sub(last);
        if elapsed <= 0 {
            return state.bucket_millitokens.load(Ordering::Acquire);
        }
        let refill = (elapsed as f64 / NANOS_PER_SEC as f64 * self.fill_per_sec
            * Self::MILLI as f64) as i64;
        if refill > 0
            && state
                .bucket_last_fill
                .compare_exchange(last, now_nanos, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let current = state.bucket_millitokens.load(Ordering::Acquire);
            let next = (current + refill).min(self.capacity * Self::MILLI);
            state.bucket_millitokens.store(next, Ordering::Release);
        }
        state.bucket_millitokens.load(Ordering::Acquire)
    }
}

impl ScoreStrategy for GeminiStrategy {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn score(&self, state: &AuthQuotaState, now_nanos: i64) -> i64 {
        let available = self.refill(state, now_nanos).max(0);
        let capacity = self.capacity * Self::MILLI;
        let scarcity = 1.0 - (available as f64 / capacity as f64).min(1.0);
        active_base(state) + (scarcity * 600.0) as i64
    }

    fn default_cooldown(&self, _state: &AuthQuotaState, _now_nanos: i64) -> Duration {
        Duration::from_secs(60)
    }

    fn on_request_start(&self, state: &AuthQuotaState, now_nanos: i64) {
        self.refill(state, now_nanos);
        state
            .bucket_millitokens
            .fetch_sub(Self::MILLI, Ordering::AcqRel);
    }

    fn on_quota_hit(&self, state: &AuthQuotaState, _now_nanos: i64) {
        state.bucket_millitokens.store(0, Ordering::Release);
    }
}

/// Strategy for a provider name; unknown providers score with the default.
pub fn strategy_for_provider(provider: &str) -> Box<dyn ScoreStrategy> {
    match provider {
        "antigravity" => Box::new(AntigravityStrategy::new(Some(Box::new(
            super::refresher::AntigravityQuotaSource::default(),
        )))),
        "claude" => Box::new(ClaudeStrategy),
        "copilot" => Box::new(CopilotStrategy::default()),
        "gemini" | "gemini-cli" => Box::new(GeminiStrategy::default()),
        _ => Box::new(DefaultStrategy),
    }
}
