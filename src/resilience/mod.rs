// Retry policy and circuit breaker for upstream calls. User errors never
// count against the breaker; only transport and server failures do.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

use rand::Rng;

use crate::auth::now_nanos;
use crate::error::ProxyError;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
    pub should_retry: fn(&ProxyError) -> bool,
}

fn default_should_retry(err: &ProxyError) -> bool {
    use crate::error::ErrorCategory::*;
    match err.category {
        Transport | Upstream | Quota => true,
        User | Auth | Cancelled => false,
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
            should_retry: default_should_retry,
        }
    }
}

impl RetryPolicy {
    /// Backoff for attempt n: min(base * 2^n, max) + U[0, jitter).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(20));
        let mut delay = exp.min(self.max_delay);
        if !self.jitter.is_zero() {
            let jitter_nanos =
                rand::thread_rng().gen_range(0..self.jitter.as_nanos() as u64);
            delay = (delay + Duration::from_nanos(jitter_nanos)).min(self.max_delay);
        }
        delay
    }

    pub fn retryable(&self, err: &ProxyError) -> bool {
        (self.should_retry)(err)
    }
}

/// Cancellation-aware backoff sleep.
pub async fn wait_backoff(delay: Duration, cancel: &tokio::sync::watch::Receiver<bool>) -> Result<(), ProxyError> {
    if delay.is_zero() {
        return Ok(());
    }
    let mut cancel = cancel.clone();
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.changed() => Err(ProxyError::cancelled()),
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

pub struct BreakerConfig {
    pub name: String,
    /// Consecutive successes required to close from half-open; also the
    /// number of probes admitted while half-open.
    pub max_requests: u32,
    /// Closed-state counters reset after this interval.
    pub interval: Duration,
    /// Open -> half-open after this timeout.
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub failure_ratio: f64,
    pub min_requests: u32,
    /// Injected by the provider layer; user errors return true here.
    pub is_successful: fn(&ProxyError) -> bool,
}

fn default_is_successful(err: &ProxyError) -> bool {
    !err.category.counts_as_breaker_failure()
}

impl BreakerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_requests: 3,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
            failure_threshold: 5,
            failure_ratio: 0.5,
            min_requests: 10,
            is_successful: default_is_successful,
        }
    }
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    state: AtomicU8,
    requests: AtomicU32,
    failures: AtomicU32,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    /// When the open state ends, or when the closed-state window rolls.
    deadline: AtomicI64,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let interval = config.interval;
        Self {
            config,
            state: AtomicU8::new(STATE_CLOSED),
            requests: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            deadline: AtomicI64::new(now_nanos() + interval.as_nanos() as i64),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> BreakerState {
        self.roll();
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    /// Whether a request may proceed right now. Half-open admits a bounded
    /// number of probes.
    pub fn allow(&self) -> bool {
        self.roll();
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => false,
            STATE_HALF_OPEN => {
                self.requests.load(Ordering::Acquire) < self.config.max_requests
            }
            _ => true,
        }
    }

    /// Records the outcome of a permitted request.
    pub fn record(&self, outcome: Result<(), &ProxyError>) {
        self.roll();
        let successful = match outcome {
            Ok(()) => true,
            Err(err) => (self.config.is_successful)(err),
        };
        self.requests.fetch_add(1, Ordering::AcqRel);

        if successful {
            self.consecutive_failures.store(0, Ordering::Release);
            let streak = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if self.state.load(Ordering::Acquire) == STATE_HALF_OPEN
                && streak >= self.config.max_requests
            {
                self.transition(STATE_CLOSED);
            }
            return;
        }

        self.consecutive_successes.store(0, Ordering::Release);
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        let streak = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        match self.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => self.transition(STATE_OPEN),
            STATE_CLOSED => {
                let requests = self.requests.load(Ordering::Acquire);
                if requests >= self.config.min_requests {
                    let ratio = failures as f64 / requests as f64;
                    if streak >= self.config.failure_threshold
                        || ratio >= self.config.failure_ratio
                    {
                        self.transition(STATE_OPEN);
                    }
                }
            }
            _ => {}
        }
    }

    /// Applies deadline-driven transitions: open -> half-open after timeout,
    /// closed counter reset after the interval.
    fn roll(&self) {
        let now = now_nanos();
        let deadline = self.deadline.load(Ordering::Acquire);
        if now < deadline {
            return;
        }
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => self.transition(STATE_HALF_OPEN),
            STATE_CLOSED => {
                if self
                    .deadline
                    .compare_exchange(
                        deadline,
                        now + self.config.interval.as_nanos() as i64,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.requests.store(0, Ordering::Release);
                    self.failures.store(0, Ordering::Release);
                }
            }
            _ => {}
        }
    }

    fn transition(&self, next: u8) {
        let prev = self.state.swap(next, Ordering::AcqRel);
        if prev == next {
            return;
        }
        self.requests.store(0, Ordering::Release);
        self.failures.store(0, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.consecutive_successes.store(0, Ordering::Release);
        let now = now_nanos();
        let deadline = match next {
            STATE_OPEN => now + self.config.timeout.as_nanos() as i64,
            _ => now + self.config.interval.as_nanos() as i64,
        };
        self.deadline.store(deadline, Ordering::Release);
        tracing::info!(
            breaker = %self.config.name,
            from = prev,
            to = next,
            "circuit breaker state change"
        );
    }
}

/// Per-upstream breakers, created on first use.
pub struct BreakerRegistry {
    breakers: parking_lot::RwLock<std::collections::HashMap<String, std::sync::Arc<CircuitBreaker>>>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self {
            breakers: parking_lot::RwLock::new(std::collections::HashMap::new()),
        }
    }
}

impl BreakerRegistry {
    pub fn get(&self, name: &str) -> std::sync::Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return std::sync::Arc::clone(breaker);
        }
        let mut guard = self.breakers.write();
        std::sync::Arc::clone(guard.entry(name.to_string()).or_insert_with(|| {
            std::sync::Arc::new(CircuitBreaker::new(BreakerConfig::named(name)))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    fn upstream_err() -> ProxyError {
        ProxyError::upstream(500, "boom")
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            jitter: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(10), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.backoff(0);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay < Duration::from_millis(750 + 1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_backoff_completes_or_cancels() {
        let (_tx, rx) = tokio::sync::watch::channel(false);
        wait_backoff(Duration::from_secs(1), &rx).await.unwrap();

        let (tx, rx) = tokio::sync::watch::channel(false);
        let wait = tokio::spawn(async move {
            wait_backoff(Duration::from_secs(3600), &rx).await
        });
        tokio::task::yield_now().await;
        tx.send(true).unwrap();
        let err = wait.await.unwrap().unwrap_err();
        assert_eq!(err.category, ErrorCategory::Cancelled);
    }

    #[test]
    fn retry_classification() {
        let policy = RetryPolicy::default();
        assert!(policy.retryable(&ProxyError::transport("refused")));
        assert!(policy.retryable(&ProxyError::quota("429", None)));
        assert!(policy.retryable(&upstream_err()));
        assert!(!policy.retryable(&ProxyError::user("bad body")));
        assert!(!policy.retryable(&ProxyError::cancelled()));
    }

    #[test]
    fn breaker_opens_on_consecutive_failures() {
        let mut config = BreakerConfig::named("test");
        config.min_requests = 5;
        config.failure_threshold = 5;
        let breaker = CircuitBreaker::new(config);

        for _ in 0..5 {
            assert!(breaker.allow());
            breaker.record(Err(&upstream_err()));
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn breaker_ignores_user_errors() {
        let mut config = BreakerConfig::named("test");
        config.min_requests = 5;
        let breaker = CircuitBreaker::new(config);

        let user = ProxyError::user("invalid request");
        assert_eq!(user.category, ErrorCategory::User);
        for _ in 0..100 {
            assert!(breaker.allow());
            breaker.record(Err(&user));
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn breaker_recovers_through_half_open() {
        let mut config = BreakerConfig::named("test");
        config.min_requests = 2;
        config.failure_threshold = 2;
        config.timeout = Duration::from_millis(0);
        let breaker = CircuitBreaker::new(config);

        breaker.record(Err(&upstream_err()));
        breaker.record(Err(&upstream_err()));
        // Timeout of zero: next observation rolls open -> half-open.
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        for _ in 0..3 {
            assert!(breaker.allow());
            breaker.record(Ok(()));
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let mut config = BreakerConfig::named("test");
        config.min_requests = 2;
        config.failure_threshold = 2;
        config.timeout = Duration::from_millis(0);
        let breaker = CircuitBreaker::new(config);

        breaker.record(Err(&upstream_err()));
        breaker.record(Err(&upstream_err()));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record(Err(&upstream_err()));
        // Timeout zero rolls straight back to half-open on the next
        // observation, so check the raw state before any roll.
        assert_eq!(breaker.state.load(Ordering::Acquire), STATE_OPEN);
    }

    #[test]
    fn registry_reuses_breakers() {
        let registry = BreakerRegistry::default();
        let a = registry.get("gemini");
        let b = registry.get("gemini");
        assert!(std::sync::Arc::ptr_eq(&a, &b));
    }
}
