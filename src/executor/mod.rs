// Provider executors: build the upstream HTTP request for a chosen account,
// run it (non-stream or SSE), and classify failures for the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use once_cell::sync::OnceCell;
use serde_json::Value;

use crate::auth::Auth;
use crate::config;
use crate::error::{parse_retry_after, ProxyError};

pub mod antigravity;
pub mod claude;
pub mod codex;
pub mod copilot;
pub mod envelope;
pub mod gemini;
pub mod kiro;
pub mod openai_compat;
pub mod sse;

/// Translated payload headed for one provider.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Upstream model name (already alias-resolved).
    pub model: String,
    pub payload: Vec<u8>,
    pub stream: bool,
}

#[derive(Debug, Clone)]
pub struct ExecResponse {
    pub payload: Vec<u8>,
}

/// Outcome of preprocessing one raw stream line.
#[derive(Debug, Clone, PartialEq)]
pub enum Preprocessed {
    /// A JSON payload ready for the to-IR chunk parser.
    Payload(Vec<u8>),
    /// Framing noise (blank line, comment, event name).
    Skip,
    /// Terminal marker; the stream is complete.
    Done,
}

pub trait ProviderExecutor: Send + Sync {
    fn provider(&self) -> &'static str;

    /// The wire format this provider speaks upstream; keys the from-IR
    /// emitter and the to-IR chunk parser.
    fn wire_format(&self) -> &'static str;

    /// Builds the outgoing request: URL, credential header, provider quirks.
    fn build_request(
        &self,
        client: &reqwest::Client,
        auth: &Auth,
        request: &ExecRequest,
    ) -> Result<reqwest::RequestBuilder, ProxyError>;

    /// Unwraps a non-stream response body (envelope providers).
    fn unwrap_response(&self, payload: Vec<u8>) -> Vec<u8> {
        payload
    }

    /// Splits one raw line into payload/noise/end-of-stream.
    fn preprocess_chunk(&self, line: &[u8]) -> Preprocessed {
        sse::preprocess_data_line(line)
    }
}

/// Shared HTTP client; reqwest pools connections per host internally.
pub fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceCell<reqwest::Client> = OnceCell::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .expect("reqwest client")
    })
}

fn request_timeout(provider: &str) -> Option<Duration> {
    let cfg = config::get_config();
    match cfg.request_timeout.get(provider).copied() {
        Some(0) | None => None,
        Some(secs) => Some(Duration::from_secs(secs)),
    }
}

/// Reads a quota or error message out of a provider error body, falling back
/// to the raw text.
fn upstream_error_message(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        for path in [&["error", "message"][..], &["message"][..]] {
            let mut node = &parsed;
            let mut found = true;
            for key in path {
                match node.get(key) {
                    Some(next) => node = next,
                    None => {
                        found = false;
                        break;
                    }
                }
            }
            if found {
                if let Some(message) = node.as_str() {
                    return message.to_string();
                }
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "upstream returned an error".to_string()
    } else {
        trimmed.chars().take(500).collect()
    }
}

async fn classify_failure(response: reqwest::Response) -> ProxyError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = response.text().await.unwrap_or_default();
    let mut err = ProxyError::upstream(status, upstream_error_message(&body));
    if let Some(retry) = retry_after {
        err = err.with_retry_after(retry);
    }
    err
}

/// Non-stream execution: send, classify, unwrap.
pub async fn execute(
    executor: &dyn ProviderExecutor,
    auth: &Auth,
    request: &ExecRequest,
) -> Result<ExecResponse, ProxyError> {
    let mut builder = executor.build_request(http_client(), auth, request)?;
    if let Some(timeout) = request_timeout(executor.provider()) {
        builder = builder.timeout(timeout);
    }
    let response = builder.send().await.map_err(ProxyError::from)?;
    if !response.status().is_success() {
        return Err(classify_failure(response).await);
    }
    let bytes = response.bytes().await.map_err(ProxyError::from)?;
    Ok(ExecResponse {
        payload: executor.unwrap_response(bytes.to_vec()),
    })
}

/// Streaming execution: send, classify the status, then yield preprocessed
/// payload frames until the terminal marker.
pub async fn stream(
    executor: Arc<dyn ProviderExecutor>,
    auth: &Auth,
    request: &ExecRequest,
) -> Result<impl Stream<Item = Result<Vec<u8>, ProxyError>>, ProxyError> {
    let mut builder = executor.build_request(http_client(), auth, request)?;
    if let Some(timeout) = request_timeout(executor.provider()) {
        builder = builder.timeout(timeout);
    }
    let response = builder.send().await.map_err(ProxyError::from)?;
    if !response.status().is_success() {
        return Err(classify_failure(response).await);
    }

    Ok(async_stream::stream! {
        let mut lines = sse::LineBuffer::new();
        let mut body = response.bytes_stream();
        'outer: while let Some(chunk) = body.next().await {
            let bytes = match chunk {
                Ok(b) => b,
                Err(err) => {
                    yield Err(ProxyError::from(err));
                    break;
                }
            };
            for line in lines.push(&bytes) {
                match executor.preprocess_chunk(&line) {
                    Preprocessed::Payload(payload) => yield Ok(payload),
                    Preprocessed::Skip => {}
                    Preprocessed::Done => break 'outer,
                }
            }
        }
        if let Some(line) = lines.flush() {
            if let Preprocessed::Payload(payload) = executor.preprocess_chunk(&line) {
                yield Ok(payload);
            }
        }
    })
}

/// provider name -> executor, assembled once from the built-ins plus the
/// configured OpenAI-compatible entries.
pub struct ExecutorRegistry {
    executors: std::collections::HashMap<String, Arc<dyn ProviderExecutor>>,
}

impl ExecutorRegistry {
    pub fn from_config(cfg: &config::AppConfig) -> Self {
        let mut executors: std::collections::HashMap<String, Arc<dyn ProviderExecutor>> =
            std::collections::HashMap::new();

        let gemini = Arc::new(gemini::GeminiExecutor);
        executors.insert("gemini".to_string(), gemini.clone());
        executors.insert("gemini-cli".to_string(), gemini);
        executors.insert(
            "antigravity".to_string(),
            Arc::new(antigravity::AntigravityExecutor),
        );
        executors.insert("claude".to_string(), Arc::new(claude::ClaudeExecutor));
        executors.insert("codex".to_string(), Arc::new(codex::CodexExecutor));
        executors.insert("copilot".to_string(), Arc::new(copilot::CopilotExecutor));
        executors.insert("kiro".to_string(), Arc::new(kiro::KiroExecutor));

        // iFlow, Qwen and Cline speak OpenAI upstream; one executor each
        // with its own base URL.
        for (name, base_url) in [
            ("iflow", "https://apis.iflow.cn/v1"),
            ("qwen", "https://portal.qwen.ai/v1"),
            ("cline", "https://api.cline.bot/v1"),
        ] {
            executors.insert(
                name.to_string(),
                Arc::new(openai_compat::OpenAICompatExecutor::new(name, base_url)),
            );
        }
        for entry in &cfg.openai_compatibility {
            executors.insert(
                entry.name.clone(),
                Arc::new(openai_compat::OpenAICompatExecutor::new(
                    entry.name.clone(),
                    entry.base_url.clone(),
                )),
            );
        }

        Self { executors }
    }

    pub fn global() -> &'static ExecutorRegistry {
        static INSTANCE: OnceCell<ExecutorRegistry> = OnceCell::new();
        INSTANCE.get_or_init(|| ExecutorRegistry::from_config(&config::get_config()))
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderExecutor>> {
        self.executors.get(provider).cloned()
    }

    pub fn providers(&self) -> Vec<String> {
        self.executors.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_extraction() {
        assert_eq!(
            upstream_error_message(r#"{"error":{"message":"quota exhausted"}}"#),
            "quota exhausted"
        );
        assert_eq!(
            upstream_error_message(r#"{"message":"nope"}"#),
            "nope"
        );
        assert_eq!(upstream_error_message("plain text"), "plain text");
        assert_eq!(upstream_error_message(""), "upstream returned an error");
    }

    #[test]
    fn registry_has_builtin_providers() {
        let registry = ExecutorRegistry::from_config(&config::AppConfig::default());
        for provider in [
            "gemini",
            "gemini-cli",
            "antigravity",
            "claude",
            "codex",
            "copilot",
            "kiro",
            "iflow",
            "qwen",
            "cline",
        ] {
            assert!(registry.get(provider).is_some(), "missing executor {provider}");
        }
    }

    #[test]
    fn configured_compat_entries_are_registered() {
        let mut cfg = config::AppConfig::default();
        cfg.openai_compatibility.push(config::OpenAICompatEntry {
            name: "local-vllm".to_string(),
            base_url: "http://127.0.0.1:8000/v1".to_string(),
            prefix: None,
        });
        let registry = ExecutorRegistry::from_config(&cfg);
        assert!(registry.get("local-vllm").is_some());
    }
}
