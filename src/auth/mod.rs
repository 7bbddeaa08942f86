// Authenticated accounts and the pool that charges requests to them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod manager;
pub mod refresher;
pub mod state;
pub mod store;
pub mod strategy;

pub use manager::{PickOptions, QuotaManager};
pub use state::{AuthQuotaState, RealQuotaSnapshot};

/// One authenticated account. Owned by the token store; the quota manager
/// keeps its own per-auth runtime state keyed by `id`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Auth {
    pub id: String,
    pub provider: String,
    /// Credential material and routing hints: access_token, refresh_token,
    /// expiry, project_id, endpoint.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Free-form attributes: email, api_key, header:X-... entries.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// Monotonic registration order, for stable iteration.
    #[serde(default)]
    pub enqueue_index: u64,
    /// Unix nanos until which the account is administratively disabled.
    #[serde(default)]
    pub disabled_until: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Auth {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            enabled: true,
            ..Default::default()
        }
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn access_token(&self) -> Option<&str> {
        self.meta_str("access_token")
    }

    pub fn project_id(&self) -> Option<&str> {
        self.meta_str("project_id").filter(|p| !p.trim().is_empty())
    }

    pub fn email(&self) -> Option<&str> {
        self.attributes
            .get("email")
            .map(String::as_str)
            .or_else(|| self.meta_str("email"))
    }

    pub fn api_key(&self) -> Option<&str> {
        self.attributes.get("api_key").map(String::as_str)
    }

    /// Access-token expiry, if the store recorded one (RFC3339).
    pub fn token_expiry(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.meta_str("expiry")
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc))
    }

    /// Identity string for usage records: email, then api_key, then id.
    pub fn usage_source(&self) -> String {
        if let Some(email) = self.email() {
            if !email.trim().is_empty() {
                return email.trim().to_string();
            }
        }
        if let Some(key) = self.api_key() {
            if !key.trim().is_empty() {
                return key.trim().to_string();
            }
        }
        self.id.clone()
    }

    /// Extra headers requested through `header:`-prefixed attributes.
    pub fn extra_headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().filter_map(|(k, v)| {
            k.strip_prefix("header:").map(|name| (name, v.as_str()))
        })
    }
}

pub fn now_nanos() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_accessors() {
        let mut auth = Auth::new("gemini-user@example.com", "gemini");
        auth.metadata
            .insert("access_token".to_string(), json!("ya29.token"));
        auth.metadata.insert("project_id".to_string(), json!("p-1"));
        auth.attributes
            .insert("email".to_string(), "user@example.com".to_string());
        auth.attributes
            .insert("header:X-Custom".to_string(), "v".to_string());

        assert_eq!(auth.access_token(), Some("ya29.token"));
        assert_eq!(auth.project_id(), Some("p-1"));
        assert_eq!(auth.usage_source(), "user@example.com");
        let headers: Vec<_> = auth.extra_headers().collect();
        assert_eq!(headers, vec![("X-Custom", "v")]);
    }

    #[test]
    fn usage_source_falls_back_to_id() {
        let auth = Auth::new("claude-1", "claude");
        assert_eq!(auth.usage_source(), "claude-1");
    }
}
