// Gemini CLI executor: Cloud Code Assist endpoint with the request envelope
// and OAuth bearer tokens.

use serde_json::{json, Value};

use super::{envelope, sse, ExecRequest, Preprocessed, ProviderExecutor};
use crate::auth::Auth;
use crate::error::ProxyError;

const CODE_ASSIST_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com";
const CODE_ASSIST_VERSION: &str = "v1internal";
const USER_AGENT: &str = "google-api-nodejs-client/9.15.1";

pub struct GeminiExecutor;

impl GeminiExecutor {
    fn wrap(&self, payload: &[u8], auth: &Auth, model: &str) -> Result<Vec<u8>, ProxyError> {
        let inner: Value = serde_json::from_slice(payload)
            .map_err(|e| ProxyError::user(format!("invalid gemini payload: {e}")))?;
        let wrapped = envelope::ensure_request_envelope(inner);
        let wrapped = envelope::add_envelope_fields(
            wrapped,
            &[
                ("model", json!(model)),
                (
                    "project",
                    json!(auth.project_id().unwrap_or_default()),
                ),
            ],
        );
        Ok(wrapped.to_string().into_bytes())
    }
}

impl ProviderExecutor for GeminiExecutor {
    fn provider(&self) -> &'static str {
        "gemini"
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

        let action = if request.stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let mut url = format!("{CODE_ASSIST_ENDPOINT}/{CODE_ASSIST_VERSION}:{action}");
        if request.stream {
            url.push_str("?alt=sse");
        }

        let body = self.wrap(&request.payload, auth, &request.model)?;
        let builder = client
            .post(url)
            .bearer_auth(token)
            .header("Content-Type", "application/json")
            .header(
                "Accept",
                if request.stream {
                    "text/event-stream"
                } else {
                    "application/json"
                },
            )
            .header("User-Agent", USER_AGENT)
            .header(
                "Client-Metadata",
                "ideType=IDE_UNSPECIFIED,platform=PLATFORM_UNSPECIFIED,pluginType=GEMINI",
            )
            .body(body);
        Ok(builder)
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wraps_payload_with_project_and_model() {
        let mut auth = Auth::new("g1", "gemini");
        auth.metadata
            .insert("project_id".to_string(), json!("proj-9"));
        let body = GeminiExecutor
            .wrap(br#"{"contents":[],"generationConfig":{}}"#, &auth, "gemini-2.5-pro")
            .unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["model"], "gemini-2.5-pro");
        assert_eq!(parsed["project"], "proj-9");
        assert!(parsed["request"]["contents"].is_array());
    }

    #[test]
    fn stream_chunks_are_unwrapped() {
        let line = br#"data: {"response":{"candidates":[{"content":{"parts":[{"text":"h"}]}}]}}"#;
        match GeminiExecutor.preprocess_chunk(line) {
            Preprocessed::Payload(payload) => {
                let value: Value = serde_json::from_slice(&payload).unwrap();
                assert!(value.get("candidates").is_some());
                assert!(value.get("response").is_none());
            }
            other => panic!("expected payload, got {other:?}"),
        }
    }

    #[test]
    fn missing_token_is_auth_error() {
        let auth = Auth::new("g2", "gemini");
        let request = ExecRequest {
            model: "gemini-2.5-pro".to_string(),
            payload: b"{}".to_vec(),
            stream: false,
        };
        let err = GeminiExecutor
            .build_request(super::super::http_client(), &auth, &request)
            .unwrap_err();
        assert_eq!(err.status_code(), 401);
    }
}
