// Codex executor: the ChatGPT backend Responses API with the CLI session
// headers it expects.

use uuid::Uuid;

use super::{ExecRequest, ProviderExecutor};
use crate::auth::Auth;
use crate::error::ProxyError;

const BASE_URL: &str = "https://chatgpt.com/backend-api/codex";
const USER_AGENT: &str = "codex_cli_rs/0.50.0 (Mac OS 26.0.1; arm64) Apple_Terminal/464";

pub struct CodexExecutor;

impl ProviderExecutor for CodexExecutor {
    fn provider(&self) -> &'static str {
        "codex"
    }

    fn wire_format(&self) -> &'static str {
        "codex"
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

        let url = format!("{BASE_URL}/responses");
        let mut builder = client
            .post(url)
            .bearer_auth(token)
            .header("Content-Type", "application/json")
            .header("Version", "0.21.0")
            .header("Openai-Beta", "responses=experimental")
            .header("Session_id", Uuid::new_v4().to_string())
            .header("User-Agent", USER_AGENT)
            .header("Originator", "codex_cli_rs")
            .header(
                "Accept",
                if request.stream {
                    "text/event-stream"
                } else {
                    "application/json"
                },
            );

        if let Some(account_id) = auth.meta_str("account_id") {
            builder = builder.header("Chatgpt-Account-Id", account_id);
        }

        Ok(builder.body(request.payload.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requires_access_token() {
        let auth = Auth::new("x1", "codex");
        let request = ExecRequest {
            model: "gpt-5-codex".to_string(),
            payload: b"{}".to_vec(),
            stream: true,
        };
        assert!(CodexExecutor
            .build_request(super::super::http_client(), &auth, &request)
            .is_err());

        let mut auth = auth;
        auth.metadata
            .insert("access_token".to_string(), json!("tok"));
        assert!(CodexExecutor
            .build_request(super::super::http_client(), &auth, &request)
            .is_ok());
    }
}
