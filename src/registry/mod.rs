// Model registry: alias resolution, provider routing, per-client model
// suspension and quota-exceeded tracking.

use std::collections::HashMap;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use crate::auth::now_nanos;

/// Quota-exceeded marks older than this are expired on cleanup.
const QUOTA_MARK_TTL_NANOS: i64 = 5 * 60 * 1_000_000_000;

/// Known models and which providers can serve them, in preference order.
static MODEL_PROVIDER_MAP: &[(&str, &[&str])] = &[
    ("claude-sonnet-4-5", &["claude", "antigravity", "kiro"]),
    ("claude-opus-4-5", &["claude", "antigravity", "kiro"]),
    ("claude-haiku-4-5", &["claude", "kiro"]),
    ("claude-sonnet-4", &["claude", "antigravity", "kiro"]),
    ("claude-opus-4", &["claude", "antigravity", "kiro"]),
    ("gemini-2-5-pro", &["gemini", "antigravity"]),
    ("gemini-2-5-flash", &["gemini", "antigravity"]),
    ("gemini-2-5-flash-lite", &["gemini", "antigravity"]),
    ("gemini-3-pro", &["gemini", "antigravity"]),
    ("gemini-3-flash", &["gemini", "antigravity"]),
    ("gpt-5", &["codex", "copilot"]),
    ("gpt-5-codex", &["codex"]),
    ("gpt-5-1", &["codex", "copilot"]),
    ("gpt-4o", &["copilot"]),
    ("o4-mini", &["copilot"]),
];

/// (normalized name, provider) -> the name that provider expects upstream.
static MODEL_NAME_ALIASES: &[(&str, &str, &str)] = &[
    ("claude-sonnet-4-5", "kiro", "claude-sonnet-4.5"),
    ("claude-sonnet-4-5", "claude", "claude-sonnet-4-5-20250929"),
    ("claude-opus-4-5", "kiro", "claude-opus-4.5"),
    ("claude-opus-4-5", "claude", "claude-opus-4-5-20251101"),
    ("claude-haiku-4-5", "kiro", "claude-haiku-4.5"),
    ("claude-haiku-4-5", "claude", "claude-haiku-4-5-20251001"),
    ("claude-sonnet-4", "claude", "claude-sonnet-4-20250514"),
    ("claude-opus-4", "claude", "claude-opus-4-20250514"),
    ("gemini-2-5-pro", "gemini", "gemini-2.5-pro"),
    ("gemini-2-5-pro", "antigravity", "gemini-2.5-pro"),
    ("gemini-2-5-flash", "gemini", "gemini-2.5-flash"),
    ("gemini-2-5-flash", "antigravity", "gemini-2.5-flash"),
    ("gemini-2-5-flash-lite", "gemini", "gemini-2.5-flash-lite"),
    ("gemini-3-pro", "gemini", "gemini-3-pro-preview"),
    ("gemini-3-pro", "antigravity", "gemini-3-pro-high"),
    ("gemini-3-flash", "gemini", "gemini-3-flash-preview"),
    ("gemini-3-flash", "antigravity", "gemini-3-flash"),
    ("gpt-5-1", "codex", "gpt-5.1"),
];

/// Unifies version separators: `claude-sonnet-4.5` == `claude-sonnet-4_5`
/// == `claude-sonnet-4-5`.
pub fn normalize_model_name(name: &str) -> String {
    name.trim().to_lowercase().replace(['.', '_'], "-")
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModel {
    pub provider: String,
    /// Canonical (normalized) model id.
    pub canonical_name: String,
    /// The name the chosen provider expects on the wire.
    pub upstream_name: String,
    /// Providers to fall through to when the primary has no capacity.
    pub fallbacks: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct ClientModels {
    /// Models the client is known to serve; empty means unrestricted.
    models: Vec<String>,
    /// model -> suspension reason.
    suspended: HashMap<String, String>,
    /// model -> unix nanos of the 429 that marked it.
    quota_exceeded: HashMap<String, i64>,
}

#[derive(Default)]
pub struct ModelRegistry {
    clients: RwLock<HashMap<String, ClientModels>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static ModelRegistry {
        static INSTANCE: OnceCell<ModelRegistry> = OnceCell::new();
        INSTANCE.get_or_init(ModelRegistry::new)
    }

    /// Providers able to serve a model name, most preferred first.
    pub fn providers_for_model(&self, model: &str) -> Vec<String> {
        let normalized = normalize_model_name(model);
        for (pattern, providers) in MODEL_PROVIDER_MAP {
            let pattern = normalize_model_name(pattern);
            if normalized == pattern || normalized.starts_with(&format!("{pattern}-")) {
                return providers.iter().map(|s| s.to_string()).collect();
            }
        }
        for (pattern, providers) in MODEL_PROVIDER_MAP {
            if normalized.starts_with(&normalize_model_name(pattern)) {
                return providers.iter().map(|s| s.to_string()).collect();
            }
        }
        // Family inference for models the table has not caught up with.
        if normalized.starts_with("claude-") {
            return vec!["claude".into(), "antigravity".into(), "kiro".into()];
        }
        if normalized.starts_with("gemini-") {
            return vec!["gemini".into(), "antigravity".into()];
        }
        if normalized.starts_with("gpt-") || normalized.starts_with("o3") || normalized.starts_with("o4") {
            return vec!["codex".into(), "copilot".into()];
        }
        Vec::new()
    }

    /// The model name a provider expects for a canonical id.
    pub fn upstream_name(&self, canonical: &str, provider: &str) -> String {
        let normalized = normalize_model_name(canonical);
        for (model, prov, actual) in MODEL_NAME_ALIASES {
            if normalize_model_name(model) == normalized && *prov == provider {
                return actual.to_string();
            }
        }
        canonical.to_string()
    }

    /// Resolves an inbound model name. `provider/model` prefixes pin the
    /// provider explicitly; otherwise routing preference decides.
    pub fn resolve(&self, inbound: &str) -> Option<ResolvedModel> {
        let inbound = inbound.trim();
        if let Some((provider, model)) = inbound.split_once('/') {
            let canonical = normalize_model_name(model);
            return Some(ResolvedModel {
                provider: provider.to_string(),
                upstream_name: self.upstream_name(&canonical, provider),
                canonical_name: canonical,
                fallbacks: Vec::new(),
            });
        }

        let canonical = normalize_model_name(inbound);
        let mut providers = self.providers_for_model(inbound);
        if providers.is_empty() {
            return None;
        }
        let primary = providers.remove(0);
        Some(ResolvedModel {
            upstream_name: self.upstream_name(&canonical, &primary),
            provider: primary,
            canonical_name: canonical,
            fallbacks: providers,
        })
    }

    /// All canonical models the registry knows, with their providers.
    pub fn list_enabled(&self) -> Vec<(String, Vec<String>)> {
        MODEL_PROVIDER_MAP
            .iter()
            .map(|(model, providers)| {
                (
                    model.to_string(),
                    providers.iter().map(|s| s.to_string()).collect(),
                )
            })
            .collect()
    }

    pub fn register_client_models(&self, client_id: &str, models: Vec<String>) {
        let mut clients = self.clients.write();
        let entry = clients.entry(client_id.to_string()).or_default();
        entry.models = models.into_iter().map(|m| normalize_model_name(&m)).collect();
    }

    pub fn suspend(&self, client_id: &str, model: &str, reason: &str) {
        if client_id.is_empty() || model.is_empty() {
            return;
        }
        let mut clients = self.clients.write();
        let entry = clients.entry(client_id.to_string()).or_default();
        let model = normalize_model_name(model);
        if !entry.suspended.contains_key(&model) {
            tracing::debug!(client_id, model = %model, reason, "suspending client model");
            entry.suspended.insert(model, reason.to_string());
        }
    }

    pub fn resume(&self, client_id: &str, model: &str) {
        let mut clients = self.clients.write();
        if let Some(entry) = clients.get_mut(client_id) {
            entry.suspended.remove(&normalize_model_name(model));
        }
    }

    pub fn mark_quota_exceeded(&self, client_id: &str, model: &str) {
        let mut clients = self.clients.write();
        let entry = clients.entry(client_id.to_string()).or_default();
        entry
            .quota_exceeded
            .insert(normalize_model_name(model), now_nanos());
    }

    pub fn clear_quota_exceeded(&self, client_id: &str, model: &str) {
        let mut clients = self.clients.write();
        if let Some(entry) = clients.get_mut(client_id) {
            entry.quota_exceeded.remove(&normalize_model_name(model));
        }
    }

    /// Drops quota marks older than the TTL.
    pub fn cleanup_expired_quotas(&self) {
        let now = now_nanos();
        let mut clients = self.clients.write();
        for entry in clients.values_mut() {
            entry
                .quota_exceeded
                .retain(|_, marked| now - *marked < QUOTA_MARK_TTL_NANOS);
        }
    }

    /// Strict support check: the client must have declared the model.
    pub fn supports(&self, client_id: &str, model: &str) -> bool {
        let clients = self.clients.read();
        let Some(entry) = clients.get(client_id) else {
            return false;
        };
        let model = normalize_model_name(model);
        entry.models.iter().any(|m| *m == model)
    }

    /// Availability check used by selection: unknown clients pass; known
    /// clients fail on suspension, fresh quota marks, or a declared model
    /// list that excludes the model.
    pub fn allows(&self, client_id: &str, model: &str) -> bool {
        let clients = self.clients.read();
        let Some(entry) = clients.get(client_id) else {
            return true;
        };
        let model = normalize_model_name(model);
        if entry.suspended.contains_key(&model) {
            return false;
        }
        if let Some(marked) = entry.quota_exceeded.get(&model) {
            if now_nanos() - *marked < QUOTA_MARK_TTL_NANOS {
                return false;
            }
        }
        if !entry.models.is_empty() && !entry.models.iter().any(|m| *m == model) {
            return false;
        }
        true
    }
}

/// Process-wide registry instance.
pub fn global() -> &'static ModelRegistry {
    ModelRegistry::global()
}
