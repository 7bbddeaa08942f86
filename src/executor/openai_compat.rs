// Generic OpenAI-compatible executor: iFlow, Qwen, Cline and any configured
// openai-compatibility entry. Only the base URL and credential differ.

use super::{ExecRequest, ProviderExecutor};
use crate::auth::Auth;
use crate::error::ProxyError;

pub struct OpenAICompatExecutor {
    name: &'static str,
    base_url: String,
}

impl OpenAICompatExecutor {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        // Executor names live for the process; leaking keeps the trait's
        // &'static str contract without a name registry.
        let name: &'static str = Box::leak(name.into().into_boxed_str());
        Self {
            name,
            base_url: base_url.into(),
        }
    }
}

impl ProviderExecutor for OpenAICompatExecutor {
    fn provider(&self) -> &'static str {
        self.name
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
        let credential = auth
            .api_key()
            .or_else(|| auth.access_token())
            .ok_or_else(|| {
                ProxyError::auth(format!("auth {} has no credential", auth.id))
            })?;

        let base = auth.meta_str("endpoint").unwrap_or(&self.base_url);
        let url = format!("{}/chat/completions", base.trim_end_matches('/'));
        let mut builder = client
            .post(url)
            .bearer_auth(credential)
            .header("Content-Type", "application/json")
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

    #[test]
    fn api_key_attribute_wins_over_token() {
        let mut auth = Auth::new("q1", "qwen");
        auth.attributes
            .insert("api_key".to_string(), "sk-key".to_string());
        let request = ExecRequest {
            model: "qwen3-coder".to_string(),
            payload: b"{}".to_vec(),
            stream: false,
        };
        let executor = OpenAICompatExecutor::new("qwen", "https://portal.qwen.ai/v1");
        let built = executor
            .build_request(super::super::http_client(), &auth, &request)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            built.url().as_str(),
            "https://portal.qwen.ai/v1/chat/completions"
        );
        assert!(built
            .headers()
            .get("authorization")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("sk-key"));
    }
}
