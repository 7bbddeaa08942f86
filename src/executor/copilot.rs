// GitHub Copilot executor: OpenAI chat-completions shape on the Copilot API
// host, with the editor identification headers the service requires.

use super::{ExecRequest, ProviderExecutor};
use crate::auth::Auth;
use crate::error::ProxyError;

const API_BASE: &str = "https://api.githubcopilot.com";
const EDITOR_VERSION: &str = "vscode/1.96.0";
const EDITOR_PLUGIN_VERSION: &str = "copilot-chat/0.23.1";

pub struct CopilotExecutor;

impl ProviderExecutor for CopilotExecutor {
    fn provider(&self) -> &'static str {
        "copilot"
    }

    fn wire_format(&self) -> &'static str {
        "openai"
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

        let base = auth.meta_str("endpoint").unwrap_or(API_BASE);
        let url = format!("{}/chat/completions", base.trim_end_matches('/'));
        let mut builder = client
            .post(url)
            .bearer_auth(token)
            .header("Content-Type", "application/json")
            .header("Editor-Version", EDITOR_VERSION)
            .header("Editor-Plugin-Version", EDITOR_PLUGIN_VERSION)
            .header("Copilot-Integration-Id", "vscode-chat")
            .header(
                "Accept",
                if request.stream {
                    "text/event-stream"
                } else {
                    "application/json"
                },
            );

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
    fn endpoint_hint_overrides_host() {
        let mut auth = Auth::new("cp1", "copilot");
        auth.metadata
            .insert("access_token".to_string(), json!("ghu_tok"));
        auth.metadata.insert(
            "endpoint".to_string(),
            json!("https://proxy.example.com/"),
        );
        let request = ExecRequest {
            model: "gpt-4o".to_string(),
            payload: b"{}".to_vec(),
            stream: false,
        };
        let builder = CopilotExecutor
            .build_request(super::super::http_client(), &auth, &request)
            .unwrap();
        let built = builder.build().unwrap();
        assert_eq!(
            built.url().as_str(),
            "https://proxy.example.com/chat/completions"
        );
    }
}
