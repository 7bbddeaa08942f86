// Error classification shared by executors, the quota manager and the pipeline.

use std::fmt;
use std::time::Duration;

use serde_json::{json, Value};

/// Broad outcome classes the orchestrator dispatches on. HTTP status alone is
/// not enough: a 400 from a malformed tool schema must never cool an account,
/// while a 429 must.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed request, unknown model, unsupported capability. Never retried.
    User,
    /// Missing/expired/invalid credential. Rotate after refresh fails.
    Auth,
    /// Quota exhausted. Cool the account and rotate.
    Quota,
    /// Connection refused, TLS failure, timeout.
    Transport,
    /// Upstream 5xx.
    Upstream,
    /// Context cancelled; propagated untouched.
    Cancelled,
}

impl ErrorCategory {
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 404 | 422 => ErrorCategory::User,
            401 | 403 => ErrorCategory::Auth,
            429 => ErrorCategory::Quota,
            s if s >= 500 => ErrorCategory::Upstream,
            _ => ErrorCategory::User,
        }
    }

    /// Whether the selection loop should try another account.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::Auth
                | ErrorCategory::Quota
                | ErrorCategory::Transport
                | ErrorCategory::Upstream
        )
    }

    /// Breaker accounting: user errors and cancellations are not failures.
    pub fn counts_as_breaker_failure(self) -> bool {
        matches!(self, ErrorCategory::Transport | ErrorCategory::Upstream)
    }
}

/// Error type produced throughout the core. Carries the category, the
/// upstream status when one exists, and an optional retry-after hint
/// extracted from 429 responses.
#[derive(Debug, Clone)]
pub struct ProxyError {
    pub category: ErrorCategory,
    pub status: Option<u16>,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl ProxyError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn user(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::User, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Auth, message).with_status(401)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transport, message)
    }

    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::from_status(status), message).with_status(status)
    }

    pub fn quota(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let mut err = Self::new(ErrorCategory::Quota, message).with_status(429);
        err.retry_after = retry_after;
        err
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCategory::Cancelled, "request cancelled")
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Status code reported to the client when none came from upstream.
    pub fn status_code(&self) -> u16 {
        if let Some(status) = self.status {
            return status;
        }
        match self.category {
            ErrorCategory::User => 400,
            ErrorCategory::Auth => 401,
            ErrorCategory::Quota => 429,
            ErrorCategory::Transport | ErrorCategory::Upstream => 502,
            ErrorCategory::Cancelled => 499,
        }
    }

    /// Renders the error body in the inbound format's error schema.
    pub fn to_client_body(&self, format: &str) -> Value {
        match format {
            "claude" => json!({
                "type": "error",
                "error": {
                    "type": claude_error_type(self.category),
                    "message": self.message,
                }
            }),
            "gemini" | "gemini-cli" => json!({
                "error": {
                    "code": self.status_code(),
                    "message": self.message,
                    "status": gemini_error_status(self.category),
                }
            }),
            "ollama" => json!({ "error": self.message }),
            _ => json!({
                "error": {
                    "message": self.message,
                    "type": openai_error_type(self.category),
                    "code": self.status_code(),
                }
            }),
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} ({:?})", self.message, status),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return ProxyError::transport(err.to_string());
        }
        if let Some(status) = err.status() {
            return ProxyError::upstream(status.as_u16(), err.to_string());
        }
        ProxyError::transport(err.to_string())
    }
}

fn openai_error_type(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::User => "invalid_request_error",
        ErrorCategory::Auth => "authentication_error",
        ErrorCategory::Quota => "rate_limit_error",
        ErrorCategory::Transport | ErrorCategory::Upstream => "api_error",
        ErrorCategory::Cancelled => "api_error",
    }
}

fn claude_error_type(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::User => "invalid_request_error",
        ErrorCategory::Auth => "authentication_error",
        ErrorCategory::Quota => "rate_limit_error",
        ErrorCategory::Transport | ErrorCategory::Upstream => "api_error",
        ErrorCategory::Cancelled => "api_error",
    }
}

fn gemini_error_status(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::User => "INVALID_ARGUMENT",
        ErrorCategory::Auth => "UNAUTHENTICATED",
        ErrorCategory::Quota => "RESOURCE_EXHAUSTED",
        ErrorCategory::Transport | ErrorCategory::Upstream => "UNAVAILABLE",
        ErrorCategory::Cancelled => "CANCELLED",
    }
}

/// Parses a Retry-After header value: either delta-seconds or HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(when) = chrono::DateTime::parse_from_rfc2822(value) {
        let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
        if let Ok(dur) = delta.to_std() {
            return Some(dur);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(ErrorCategory::from_status(400), ErrorCategory::User);
        assert_eq!(ErrorCategory::from_status(401), ErrorCategory::Auth);
        assert_eq!(ErrorCategory::from_status(403), ErrorCategory::Auth);
        assert_eq!(ErrorCategory::from_status(429), ErrorCategory::Quota);
        assert_eq!(ErrorCategory::from_status(500), ErrorCategory::Upstream);
        assert_eq!(ErrorCategory::from_status(503), ErrorCategory::Upstream);
    }

    #[test]
    fn user_errors_never_trip_breaker() {
        assert!(!ErrorCategory::User.counts_as_breaker_failure());
        assert!(!ErrorCategory::Quota.counts_as_breaker_failure());
        assert!(ErrorCategory::Transport.counts_as_breaker_failure());
        assert!(ErrorCategory::Upstream.counts_as_breaker_failure());
    }

    #[test]
    fn client_body_per_format() {
        let err = ProxyError::user("unknown model");
        let openai = err.to_client_body("openai");
        assert_eq!(openai["error"]["type"], "invalid_request_error");

        let claude = err.to_client_body("claude");
        assert_eq!(claude["type"], "error");
        assert_eq!(claude["error"]["type"], "invalid_request_error");

        let gemini = err.to_client_body("gemini");
        assert_eq!(gemini["error"]["status"], "INVALID_ARGUMENT");
    }

    #[test]
    fn retry_after_seconds() {
        assert_eq!(parse_retry_after("3600"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_retry_after("garbage"), None);
    }
}
