// Anthropic executor. OAuth accounts authenticate with a bearer token and
// the oauth beta header; api-key accounts use x-api-key.

use super::{ExecRequest, ProviderExecutor};
use crate::auth::Auth;
use crate::error::ProxyError;

const API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OAUTH_BETA: &str = "oauth-2025-04-20";

pub struct ClaudeExecutor;

impl ProviderExecutor for ClaudeExecutor {
    fn provider(&self) -> &'static str {
        "claude"
    }

    fn wire_format(&self) -> &'static str {
        "claude"
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        auth: &Auth,
        request: &ExecRequest,
    ) -> Result<reqwest::RequestBuilder, ProxyError> {
        let url = format!("{API_BASE}/messages");
        let mut builder = client
            .post(url)
            .header("content-type", "application/json")
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header(
                "accept",
                if request.stream {
                    "text/event-stream"
                } else {
                    "application/json"
                },
            );

        if let Some(api_key) = auth.api_key() {
            builder = builder.header("x-api-key", api_key);
        } else if let Some(token) = auth.access_token() {
            builder = builder
                .bearer_auth(token)
                .header("anthropic-beta", OAUTH_BETA);
        } else {
            return Err(ProxyError::auth(format!(
                "auth {} has neither api key nor access token",
                auth.id
            )));
        }

        for (name, value) in auth.extra_headers() {
            builder = builder.header(name, value);
        }

        Ok(builder.body(request.payload.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn credential_is_required() {
        let auth = Auth::new("c1", "claude");
        let request = ExecRequest {
            model: "claude-sonnet-4-5".to_string(),
            payload: b"{}".to_vec(),
            stream: false,
        };
        let err = ClaudeExecutor
            .build_request(super::super::http_client(), &auth, &request)
            .unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[test]
    fn oauth_account_builds() {
        let mut auth = Auth::new("c2", "claude");
        auth.metadata
            .insert("access_token".to_string(), json!("sk-oauth"));
        let request = ExecRequest {
            model: "claude-sonnet-4-5".to_string(),
            payload: b"{}".to_vec(),
            stream: true,
        };
        assert!(ClaudeExecutor
            .build_request(super::super::http_client(), &auth, &request)
            .is_ok());
    }
}
