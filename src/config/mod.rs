// Configuration module for the gateway. YAML file, kebab-case keys, loaded
// once into a process-wide handle; updates replace the whole snapshot.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

static CONFIG: OnceCell<RwLock<AppConfig>> = OnceCell::new();
static CONFIG_PATH: OnceCell<PathBuf> = OnceCell::new();

/// Serializes tests that mutate the process-wide config.
#[cfg(test)]
pub static TEST_MUTEX: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_auth_dir")]
    pub auth_dir: String,

    #[serde(default)]
    pub debug: bool,

    #[serde(default = "default_request_retry")]
    pub request_retry: u32,

    /// Upper bound in seconds on any retry sleep in the selection loop.
    #[serde(default = "default_max_retry_interval")]
    pub max_retry_interval: u32,

    /// Test mode: skip cooldown assignment on 429.
    #[serde(default)]
    pub disable_cooling: bool,

    #[serde(default)]
    pub quota_exceeded: QuotaExceededConfig,

    #[serde(default)]
    pub payload: PayloadConfig,

    /// Models hidden from listings for OAuth-backed providers.
    #[serde(default)]
    pub oauth_excluded_models: HashMap<String, Vec<String>>,

    #[serde(default)]
    pub sticky_session: StickySessionConfig,

    /// Quota hits within the window before an auth is disabled outright.
    #[serde(default = "default_disable_threshold")]
    pub quota_hit_disable_threshold: u32,

    /// Escalation window in seconds.
    #[serde(default = "default_disable_window")]
    pub quota_hit_disable_window: u64,

    /// Per-provider upstream request timeout in seconds (0 = no timeout).
    #[serde(default)]
    pub request_timeout: HashMap<String, u64>,

    #[serde(default)]
    pub openai_compatibility: Vec<OpenAICompatEntry>,
}

fn default_port() -> u16 {
    8417
}

fn default_auth_dir() -> String {
    "~/.llmux".to_string()
}

fn default_request_retry() -> u32 {
    3
}

fn default_max_retry_interval() -> u32 {
    30
}

fn default_disable_threshold() -> u32 {
    3
}

fn default_disable_window() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QuotaExceededConfig {
    /// On quota hit, try another project id owned by the same auth.
    #[serde(default = "default_true")]
    pub switch_project: bool,
    /// Allow downgrading to a preview sibling of the model family.
    #[serde(default = "default_true")]
    pub switch_preview_model: bool,
}

impl Default for QuotaExceededConfig {
    fn default() -> Self {
        Self {
            switch_project: true,
            switch_preview_model: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StickySessionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds before a sticky entry expires.
    #[serde(default = "default_sticky_ttl")]
    pub ttl: u64,
}

impl Default for StickySessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: default_sticky_ttl(),
        }
    }
}

fn default_sticky_ttl() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct OpenAICompatEntry {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub prefix: Option<String>,
}

// ---------------------------------------------------------------------------
// Payload overlays
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct PayloadConfig {
    /// Set only if the path is absent from the upstream body.
    #[serde(default)]
    pub default: Vec<PayloadRule>,
    /// Always set.
    #[serde(default, rename = "override")]
    pub override_rules: Vec<PayloadRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct PayloadRule {
    #[serde(default)]
    pub models: Vec<PayloadModelMatch>,
    /// Dot-separated JSON path -> value to apply.
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct PayloadModelMatch {
    pub name: String,
    #[serde(default)]
    pub protocol: Option<String>,
}

/// Glob-style model matching: exact, `*`, `prefix*`, `*suffix`, `*contains*`.
pub fn match_model_pattern(pattern: &str, model: &str) -> bool {
    let pattern = pattern.trim();
    let model = model.trim();
    if pattern.is_empty() {
        return false;
    }
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == model;
    }

    let pat: &[u8] = pattern.as_bytes();
    let text: &[u8] = model.as_bytes();
    let (mut pi, mut si) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;
    while si < text.len() {
        if pi < pat.len() && pat[pi] == text[si] {
            pi += 1;
            si += 1;
        } else if pi < pat.len() && pat[pi] == b'*' {
            star = Some(pi);
            mark = si;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            si = mark;
        } else {
            return false;
        }
    }
    while pi < pat.len() && pat[pi] == b'*' {
        pi += 1;
    }
    pi == pat.len()
}

fn rule_matches(rule: &PayloadRule, model: &str, protocol: &str) -> bool {
    for entry in &rule.models {
        let name = entry.name.trim();
        if name.is_empty() {
            continue;
        }
        if let Some(p) = entry.protocol.as_deref() {
            let p = p.trim();
            if !p.is_empty() && !protocol.is_empty() && !p.eq_ignore_ascii_case(protocol) {
                continue;
            }
        }
        if match_model_pattern(name, model) {
            return true;
        }
    }
    false
}

fn set_json_path(target: &mut Value, path: &str, value: &Value) {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return;
    }
    let mut node = target;
    for (i, seg) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        if !node.is_object() {
            *node = Value::Object(serde_json::Map::new());
        }
        let map = node.as_object_mut().expect("object just ensured");
        if last {
            map.insert((*seg).to_string(), value.clone());
            return;
        }
        node = map
            .entry((*seg).to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

fn json_path_exists(target: &Value, path: &str) -> bool {
    let mut node = target;
    for seg in path.split('.').filter(|s| !s.is_empty()) {
        match node.get(seg) {
            Some(next) => node = next,
            None => return false,
        }
    }
    true
}

/// Applies configured default/override rules to an upstream payload.
/// `root` scopes the rule paths, e.g. "request" for enveloped providers.
pub fn apply_payload_config(
    cfg: &AppConfig,
    model: &str,
    protocol: &str,
    root: &str,
    payload: &mut Value,
) {
    let model = model.trim();
    if model.is_empty() {
        return;
    }
    let rules = &cfg.payload;
    if rules.default.is_empty() && rules.override_rules.is_empty() {
        return;
    }

    let full_path = |path: &str| -> String {
        let root = root.trim();
        let path = path.trim().trim_start_matches('.');
        if root.is_empty() {
            path.to_string()
        } else if path.is_empty() {
            root.to_string()
        } else {
            format!("{root}.{path}")
        }
    };

    for rule in &rules.default {
        if !rule_matches(rule, model, protocol) {
            continue;
        }
        for (path, value) in &rule.params {
            let p = full_path(path);
            if p.is_empty() || json_path_exists(payload, &p) {
                continue;
            }
            set_json_path(payload, &p, value);
        }
    }

    for rule in &rules.override_rules {
        if !rule_matches(rule, model, protocol) {
            continue;
        }
        for (path, value) in &rule.params {
            let p = full_path(path);
            if p.is_empty() {
                continue;
            }
            set_json_path(payload, &p, value);
        }
    }
}

// ---------------------------------------------------------------------------
// Global accessors
// ---------------------------------------------------------------------------

pub fn init_config(path: PathBuf) -> Result<()> {
    CONFIG_PATH.set(path.clone()).ok();

    let config = if path.exists() {
        let content = std::fs::read_to_string(&path)?;
        serde_yaml::from_str(&content)?
    } else {
        let default_config = AppConfig::default();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(&default_config)?;
        std::fs::write(&path, content)?;
        default_config
    };

    set_config(config);
    tracing::info!("config initialized from {:?}", path);
    Ok(())
}

pub fn set_config(config: AppConfig) {
    match CONFIG.get() {
        Some(lock) => *lock.write() = config,
        None => {
            CONFIG.set(RwLock::new(config)).ok();
        }
    }
}

pub fn get_config() -> AppConfig {
    CONFIG.get().map(|c| c.read().clone()).unwrap_or_default()
}

pub fn update_config(config: AppConfig) -> Result<()> {
    set_config(config.clone());
    if let Some(path) = CONFIG_PATH.get() {
        let content = serde_yaml::to_string(&config)?;
        std::fs::write(path, content)?;
    }
    Ok(())
}

pub fn resolve_auth_dir() -> PathBuf {
    let auth_dir = get_config().auth_dir;
    if let Some(rest) = auth_dir.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(auth_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn glob_patterns() {
        assert!(match_model_pattern("*", "anything"));
        assert!(match_model_pattern("gemini-2.5-pro", "gemini-2.5-pro"));
        assert!(!match_model_pattern("gemini-2.5-pro", "gemini-2.5-flash"));
        assert!(match_model_pattern("gemini-*", "gemini-2.5-flash"));
        assert!(match_model_pattern("*-thinking", "claude-sonnet-4-5-thinking"));
        assert!(match_model_pattern("*flash*", "gemini-2.5-flash-lite"));
        assert!(!match_model_pattern("*flash*", "gemini-2.5-pro"));
        assert!(!match_model_pattern("", "model"));
    }

    #[test]
    fn defaults_only_fill_missing_paths() {
        let mut cfg = AppConfig::default();
        let mut rule = PayloadRule::default();
        rule.models.push(PayloadModelMatch {
            name: "gemini-*".to_string(),
            protocol: None,
        });
        rule.params
            .insert("generationConfig.temperature".to_string(), json!(0.7));
        cfg.payload.default.push(rule);

        let mut payload = json!({ "generationConfig": { "temperature": 0.2 } });
        apply_payload_config(&cfg, "gemini-2.5-pro", "gemini", "", &mut payload);
        assert_eq!(payload["generationConfig"]["temperature"], 0.2);

        let mut payload = json!({ "generationConfig": {} });
        apply_payload_config(&cfg, "gemini-2.5-pro", "gemini", "", &mut payload);
        assert_eq!(payload["generationConfig"]["temperature"], 0.7);
    }

    #[test]
    fn overrides_always_set_and_respect_root() {
        let mut cfg = AppConfig::default();
        let mut rule = PayloadRule::default();
        rule.models.push(PayloadModelMatch {
            name: "*".to_string(),
            protocol: Some("gemini".to_string()),
        });
        rule.params
            .insert("generationConfig.topK".to_string(), json!(40));
        cfg.payload.override_rules.push(rule);

        let mut payload = json!({ "request": { "generationConfig": { "topK": 5 } } });
        apply_payload_config(&cfg, "gemini-2.5-pro", "gemini", "request", &mut payload);
        assert_eq!(payload["request"]["generationConfig"]["topK"], 40);
    }

    #[test]
    fn protocol_tag_filters_rules() {
        let mut cfg = AppConfig::default();
        let mut rule = PayloadRule::default();
        rule.models.push(PayloadModelMatch {
            name: "*".to_string(),
            protocol: Some("claude".to_string()),
        });
        rule.params.insert("max_tokens".to_string(), json!(1024));
        cfg.payload.override_rules.push(rule);

        let mut payload = json!({});
        apply_payload_config(&cfg, "gpt-5", "openai", "", &mut payload);
        assert!(payload.get("max_tokens").is_none());
    }
}
