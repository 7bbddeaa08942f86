// Background real-quota polling. One cooperative task per registered auth
// whose strategy exposes a quota API; snapshots flow through a bounded
// channel back to the manager, which owns the state map.

use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use super::state::RealQuotaSnapshot;
use super::strategy::RealQuotaSource;
use super::{now_nanos, Auth};

/// Tick between quota fetches.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(120);
/// Upper bound on startup jitter, to spread a fleet of refreshers.
pub const STARTUP_JITTER_MAX: Duration = Duration::from_secs(30);
/// Per-fetch HTTP timeout.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RefresherHandle {
    cancel: watch::Sender<bool>,
}

impl RefresherHandle {
    /// Signals the task to stop; it exits within one tick.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Spawns the polling task for one auth. Publishes into `tx`; a full channel
/// drops the reading rather than blocking the poller.
pub fn spawn(
    auth: Auth,
    strategy: std::sync::Arc<dyn super::strategy::ScoreStrategy>,
    tx: mpsc::Sender<(String, RealQuotaSnapshot)>,
) -> RefresherHandle {
    let (cancel_tx, mut cancel_rx) = watch::channel(false);

    tokio::spawn(async move {
        let jitter = rand::thread_rng().gen_range(0..STARTUP_JITTER_MAX.as_millis() as u64);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(jitter)) => {}
            _ = cancel_rx.changed() => return,
        }

        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel_rx.changed() => return,
            }
            let Some(source) = strategy.real_quota_source() else {
                return;
            };
            match source.fetch(auth.clone()).await {
                Ok(snapshot) => {
                    if tx.try_send((auth.id.clone(), snapshot)).is_err() {
                        tracing::debug!(auth_id = %auth.id, "quota snapshot channel full, dropping");
                    }
                }
                Err(err) => {
                    // Skipped, never retried tighter than the tick.
                    tracing::warn!(auth_id = %auth.id, "quota fetch failed: {err}");
                }
            }
        }
    });

    RefresherHandle { cancel: cancel_tx }
}

// ---------------------------------------------------------------------------
// Antigravity quota endpoint
// ---------------------------------------------------------------------------

const ANTIGRAVITY_QUOTA_URL: &str =
    "https://daily-cloudcode-pa.googleapis.com/v1internal:fetchAvailableQuota";

pub struct AntigravityQuotaSource {
    client: reqwest::Client,
}

impl Default for AntigravityQuotaSource {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl RealQuotaSource for AntigravityQuotaSource {
    fn fetch(&self, auth: Auth) -> BoxFuture<'static, anyhow::Result<RealQuotaSnapshot>> {
        let client = self.client.clone();
        Box::pin(async move {
            let token = auth
                .access_token()
                .ok_or_else(|| anyhow::anyhow!("auth {} has no access token", auth.id))?
                .to_string();

            let response = client
                .get(ANTIGRAVITY_QUOTA_URL)
                .bearer_auth(token)
                .header("Accept", "application/json")
                .timeout(FETCH_TIMEOUT)
                .send()
                .await?;
            if !response.status().is_success() {
                anyhow::bail!("quota endpoint returned {}", response.status());
            }
            let body: Value = response.json().await?;
            Ok(parse_quota_body(&body))
        })
    }
}

/// The endpoint reports either a remaining fraction directly or a
/// remaining/limit pair; both shapes appear in the wild.
fn parse_quota_body(body: &Value) -> RealQuotaSnapshot {
    let quota = body.get("quota").unwrap_or(body);
    let remaining_tokens = quota
        .get("remainingTokens")
        .or_else(|| quota.get("remaining_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let limit = quota
        .get("tokenLimit")
        .or_else(|| quota.get("token_limit"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let fraction = quota
        .get("remainingFraction")
        .or_else(|| quota.get("remaining_fraction"))
        .and_then(Value::as_f64)
        .unwrap_or_else(|| {
            if limit > 0 {
                remaining_tokens as f64 / limit as f64
            } else {
                1.0
            }
        })
        .clamp(0.0, 1.0);
    let reset_at = quota
        .get("windowResetAt")
        .or_else(|| quota.get("window_reset_at"))
        .and_then(Value::as_str)
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .and_then(|dt| dt.timestamp_nanos_opt())
        .unwrap_or(0);

    RealQuotaSnapshot {
        remaining_fraction: fraction,
        remaining_tokens,
        window_reset_at: reset_at,
        fetched_at: now_nanos(),
    }
}
