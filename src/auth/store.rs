// Token store contract and the default file-per-auth JSON implementation.
// The core reads through this interface; remote-backed stores implement the
// same trait elsewhere.

use std::path::{Path, PathBuf};

use anyhow::Result;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast;

use super::Auth;

#[derive(Debug, Clone)]
pub enum StoreEvent {
    Saved(String),
    Deleted(String),
}

pub trait TokenStore: Send + Sync {
    fn list(&self, provider: &str) -> BoxFuture<'_, Result<Vec<Auth>>>;
    fn get(&self, id: &str) -> BoxFuture<'_, Result<Auth>>;
    fn put(&self, auth: Auth) -> BoxFuture<'_, Result<()>>;
    fn delete(&self, id: &str) -> BoxFuture<'_, Result<()>>;
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// One JSON file per auth in the auth dir, named `<id>.json`. The id is the
/// file stem, e.g. `gemini-user@example.com-all`.
pub struct FileTokenStore {
    dir: PathBuf,
    events: broadcast::Sender<StoreEvent>,
}

impl FileTokenStore {
    pub fn new(dir: PathBuf) -> Self {
        let (events, _) = broadcast::channel(64);
        Self { dir, events }
    }

    pub fn from_config() -> Self {
        Self::new(crate::config::resolve_auth_dir())
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn read_auth(path: &Path) -> Option<Auth> {
        let id = path.file_stem()?.to_str()?.to_string();
        if id == "config" {
            return None;
        }
        let content = std::fs::read_to_string(path).ok()?;
        let json: Value = serde_json::from_str(&content).ok()?;
        let obj = json.as_object()?;

        // Credential material may sit at the root or under a "token" object.
        let token_obj = obj.get("token").and_then(Value::as_object);
        let has_token = obj.contains_key("access_token")
            || token_obj.map(|t| t.contains_key("access_token")).unwrap_or(false);
        if !has_token {
            return None;
        }

        let provider = obj
            .get("provider")
            .or_else(|| obj.get("type"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                id.split(|c| c == '-' || c == '_')
                    .next()
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "unknown".to_string());

        let mut auth = Auth::new(id, provider);
        auth.enabled = obj.get("enabled").and_then(Value::as_bool).unwrap_or(true);

        let source = token_obj.cloned().unwrap_or_else(|| obj.clone());
        for key in ["access_token", "refresh_token", "expiry", "token_type"] {
            if let Some(value) = source.get(key) {
                auth.metadata.insert(key.to_string(), value.clone());
            }
        }
        for key in ["project_id", "endpoint", "region", "profile_arn"] {
            if let Some(value) = obj.get(key) {
                auth.metadata.insert(key.to_string(), value.clone());
            }
        }
        if let Some(email) = obj.get("email").and_then(Value::as_str) {
            auth.attributes
                .insert("email".to_string(), email.to_string());
        }
        if let Some(attrs) = obj.get("attributes").and_then(Value::as_object) {
            for (k, v) in attrs {
                if let Some(s) = v.as_str() {
                    auth.attributes.insert(k.clone(), s.to_string());
                }
            }
        }

        Some(auth)
    }

    fn write_auth(&self, auth: &Auth) -> Result<()> {
        let mut body = serde_json::Map::new();
        body.insert("provider".to_string(), Value::String(auth.provider.clone()));
        body.insert("enabled".to_string(), Value::Bool(auth.enabled));
        let mut token = serde_json::Map::new();
        for key in ["access_token", "refresh_token", "expiry", "token_type"] {
            if let Some(value) = auth.metadata.get(key) {
                token.insert(key.to_string(), value.clone());
            }
        }
        body.insert("token".to_string(), Value::Object(token));
        for key in ["project_id", "endpoint", "region", "profile_arn"] {
            if let Some(value) = auth.metadata.get(key) {
                body.insert(key.to_string(), value.clone());
            }
        }
        if let Some(email) = auth.email() {
            body.insert("email".to_string(), Value::String(email.to_string()));
        }
        if !auth.attributes.is_empty() {
            let attrs: serde_json::Map<String, Value> = auth
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            body.insert("attributes".to_string(), Value::Object(attrs));
        }

        let path = self.path_for(&auth.id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(&Value::Object(body))?)?;
        Ok(())
    }
}

impl TokenStore for FileTokenStore {
    fn list(&self, provider: &str) -> BoxFuture<'_, Result<Vec<Auth>>> {
        let provider = provider.to_string();
        Box::pin(async move {
            let mut auths = Vec::new();
            if !self.dir.exists() {
                return Ok(auths);
            }
            for entry in std::fs::read_dir(&self.dir)? {
                let path = entry?.path();
                if path.extension().map(|e| e == "json").unwrap_or(false) {
                    if let Some(auth) = Self::read_auth(&path) {
                        if provider.is_empty() || auth.provider == provider {
                            auths.push(auth);
                        }
                    }
                }
            }
            auths.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(auths)
        })
    }

    fn get(&self, id: &str) -> BoxFuture<'_, Result<Auth>> {
        let path = self.path_for(id);
        Box::pin(async move {
            Self::read_auth(&path)
                .ok_or_else(|| anyhow::anyhow!("auth not found: {}", path.display()))
        })
    }

    fn put(&self, auth: Auth) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.write_auth(&auth)?;
            let _ = self.events.send(StoreEvent::Saved(auth.id.clone()));
            Ok(())
        })
    }

    fn delete(&self, id: &str) -> BoxFuture<'_, Result<()>> {
        let id = id.to_string();
        Box::pin(async move {
            let path = self.path_for(&id);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            let _ = self.events.send(StoreEvent::Deleted(id));
            Ok(())
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
