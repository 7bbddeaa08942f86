// Antigravity executor: Cloud Code envelope plus the agent fields the
// endpoint expects (project, requestId, sessionId), with daily/sandbox host
// fallback.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{envelope, sse, ExecRequest, Preprocessed, ProviderExecutor};
use crate::auth::Auth;
use crate::error::ProxyError;

const BASE_URL_DAILY: &str = "https://daily-cloudcode-pa.googleapis.com";
const BASE_URL_SANDBOX: &str = "https://daily-cloudcode-pa.sandbox.googleapis.com";
const STREAM_PATH: &str = "/v1internal:streamGenerateContent";
const GENERATE_PATH: &str = "/v1internal:generateContent";
const USER_AGENT: &str = "antigravity/1.104.0 darwin/arm64";

pub struct AntigravityExecutor;

impl AntigravityExecutor {
    fn wrap(&self, payload: &[u8], auth: &Auth, model: &str) -> Result<Vec<u8>, ProxyError> {
        let inner: Value = serde_json::from_slice(payload)
            .map_err(|e| ProxyError::user(format!("invalid antigravity payload: {e}")))?;
        let session_id = stable_session_id(&inner);
        let mut wrapped = envelope::ensure_request_envelope(inner);
        wrapped = envelope::add_envelope_fields(
            wrapped,
            &[
                ("model", json!(model)),
                ("userAgent", json!("antigravity")),
                ("requestType", json!("agent")),
                (
                    "project",
                    json!(auth
                        .project_id()
                        .map(str::to_string)
                        .unwrap_or_else(generated_project_id)),
                ),
                ("requestId", json!(format!("agent-{}", Uuid::new_v4()))),
            ],
        );
        wrapped["request"]["sessionId"] = json!(session_id);
        Ok(wrapped.to_string().into_bytes())
    }

    /// The endpoint round-robins across the daily and sandbox hosts; the
    /// retry layer re-picks, so each build alternates deterministically by
    /// request id hash.
    fn base_url(&self, request: &ExecRequest) -> &'static str {
        let mut hasher = Sha256::new();
        hasher.update(&request.payload);
        if hasher.finalize()[0] & 1 == 0 {
            BASE_URL_DAILY
        } else {
            BASE_URL_SANDBOX
        }
    }
}

impl ProviderExecutor for AntigravityExecutor {
    fn provider(&self) -> &'static str {
        "antigravity"
    }

    fn wire_format(&self) -> &'static str {
        "gemini"
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        auth: &Auth,
        request: &ExecRequest,
    ) -> Result<reqwest::RequestBuilder, ProxyError> {
        let token = auth
            .access_token()
            .ok_or_else(|| ProxyError::auth(format!("auth {} has no access token", auth.id)))?;

        let path = if request.stream { STREAM_PATH } else { GENERATE_PATH };
        let mut url = format!("{}{}", self.base_url(request), path);
        if request.stream {
            url.push_str("?alt=sse");
        }

        let body = self.wrap(&request.payload, auth, &request.model)?;
        Ok(client
            .post(url)
            .bearer_auth(token)
            .header("Content-Type", "application/json")
            .header("User-Agent", USER_AGENT)
            .header(
                "Accept",
                if request.stream {
                    "text/event-stream"
                } else {
                    "application/json"
                },
            )
            .body(body))
    }

    fn unwrap_response(&self, payload: Vec<u8>) -> Vec<u8> {
        envelope::unwrap_response_bytes(payload)
    }

    fn preprocess_chunk(&self, line: &[u8]) -> Preprocessed {
        match sse::preprocess_data_line(line) {
            Preprocessed::Payload(payload) => {
                Preprocessed::Payload(envelope::unwrap_response_bytes(payload))
            }
            other => other,
        }
    }
}

/// Session ids must be stable for a conversation so the upstream can link
/// turns; hash the first user text.
fn stable_session_id(payload: &Value) -> String {
    let contents = payload
        .get("request")
        .and_then(|r| r.get("contents"))
        .or_else(|| payload.get("contents"))
        .and_then(Value::as_array);
    if let Some(contents) = contents {
        for content in contents {
            if content.get("role").and_then(Value::as_str) == Some("user") {
                if let Some(text) = content
                    .get("parts")
                    .and_then(|p| p.get(0))
                    .and_then(|p| p.get("text"))
                    .and_then(Value::as_str)
                {
                    if !text.is_empty() {
                        let mut hasher = Sha256::new();
                        hasher.update(text.as_bytes());
                        let hash = hasher.finalize();
                        let mut bytes = [0u8; 8];
                        bytes.copy_from_slice(&hash[..8]);
                        let n = i64::from_be_bytes(bytes) & 0x7FFF_FFFF_FFFF_FFFF;
                        return format!("-{n}");
                    }
                }
            }
        }
    }
    format!("-{}", Uuid::new_v4().as_u128() as i64 & 0x7FFF_FFFF_FFFF_FFFF)
}

fn generated_project_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("bright-wave-{}", &suffix[..5])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_with_agent_fields() {
        let auth = Auth::new("ag1", "antigravity");
        let body = AntigravityExecutor
            .wrap(
                br#"{"contents":[{"role":"user","parts":[{"text":"hi"}]}]}"#,
                &auth,
                "gemini-3-pro-high",
            )
            .unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["model"], "gemini-3-pro-high");
        assert_eq!(parsed["userAgent"], "antigravity");
        assert_eq!(parsed["requestType"], "agent");
        assert!(parsed["project"].as_str().map(|p| !p.is_empty()).unwrap_or(false));
        assert!(parsed["requestId"].as_str().unwrap().starts_with("agent-"));
        assert!(parsed["request"]["sessionId"].as_str().unwrap().starts_with('-'));
    }

    #[test]
    fn session_id_is_stable_per_conversation() {
        let payload: Value = serde_json::from_str(
            r#"{"contents":[{"role":"user","parts":[{"text":"same prompt"}]}]}"#,
        )
        .unwrap();
        assert_eq!(stable_session_id(&payload), stable_session_id(&payload));
    }

    #[test]
    fn wire_format_is_gemini() {
        assert_eq!(AntigravityExecutor.wire_format(), "gemini");
    }
}
