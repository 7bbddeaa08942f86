// Kiro (CodeWhisperer) executor. The upstream speaks its own conversation
// payload and an AWS event-stream response; both quirks are contained here
// by rewriting to and from the OpenAI wire shape.

use serde_json::{json, Value};
use uuid::Uuid;

use super::{ExecRequest, Preprocessed, ProviderExecutor};
use crate::auth::Auth;
use crate::error::ProxyError;

const DEFAULT_REGION: &str = "us-east-1";
const TOOL_DESCRIPTION_MAX_LENGTH: usize = 10000;

pub struct KiroExecutor;

impl KiroExecutor {
    fn host(&self, auth: &Auth) -> String {
        let region = auth.meta_str("region").unwrap_or(DEFAULT_REGION);
        format!("https://q.{region}.amazonaws.com")
    }

    /// Rewrites an OpenAI chat body into the CodeWhisperer conversation
    /// payload.
    fn build_payload(&self, openai_body: &[u8], auth: &Auth, model: &str) -> Result<Vec<u8>, ProxyError> {
        let body: Value = serde_json::from_slice(openai_body)
            .map_err(|e| ProxyError::user(format!("invalid kiro payload: {e}")))?;

        let messages = body
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        // System prompts fold into the first user content; Kiro has no
        // separate system channel.
        let mut system = String::new();
        let mut history: Vec<Value> = Vec::new();
        let mut current = String::new();
        for msg in &messages {
            let role = msg.get("role").and_then(Value::as_str).unwrap_or("user");
            let content = flatten_content(msg.get("content"));
            match role {
                "system" => {
                    if !content.is_empty() {
                        if !system.is_empty() {
                            system.push('\n');
                        }
                        system.push_str(&content);
                    }
                }
                "assistant" => {
                    if !current.is_empty() {
                        history.push(json!({
                            "userInputMessage": { "content": std::mem::take(&mut current) }
                        }));
                    }
                    history.push(json!({
                        "assistantResponseMessage": { "content": content }
                    }));
                }
                "tool" => {
                    if !current.is_empty() {
                        history.push(json!({
                            "userInputMessage": { "content": std::mem::take(&mut current) }
                        }));
                    }
                    history.push(json!({
                        "userInputMessage": {
                            "content": format!("[tool result] {content}"),
                        }
                    }));
                }
                _ => {
                    if !current.is_empty() {
                        history.push(json!({
                            "userInputMessage": { "content": std::mem::take(&mut current) }
                        }));
                    }
                    current = content;
                }
            }
        }
        if !system.is_empty() {
            current = format!("{system}\n\n{current}");
        }

        let mut context = serde_json::Map::new();
        if let Some(tools) = body.get("tools").and_then(Value::as_array) {
            let specs: Vec<Value> = tools
                .iter()
                .filter_map(|t| t.get("function"))
                .map(|f| {
                    let mut description = f
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    description.truncate(TOOL_DESCRIPTION_MAX_LENGTH);
                    json!({
                        "toolSpecification": {
                            "name": f.get("name").cloned().unwrap_or(Value::Null),
                            "description": description,
                            "inputSchema": { "json": f.get("parameters").cloned().unwrap_or(json!({})) },
                        }
                    })
                })
                .collect();
            if !specs.is_empty() {
                context.insert("tools".to_string(), json!(specs));
            }
        }

        let mut payload = json!({
            "conversationState": {
                "chatTriggerType": "MANUAL",
                "conversationId": Uuid::new_v4().to_string(),
                "currentMessage": {
                    "userInputMessage": {
                        "content": current,
                        "modelId": model,
                        "origin": "AI_EDITOR",
                        "userInputMessageContext": Value::Object(context),
                    }
                },
                "history": history,
            }
        });
        if let Some(profile_arn) = auth.meta_str("profile_arn") {
            payload["profileArn"] = json!(profile_arn);
        }

        Ok(payload.to_string().into_bytes())
    }
}

impl ProviderExecutor for KiroExecutor {
    fn provider(&self) -> &'static str {
        "kiro"
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

        let url = format!("{}/generateAssistantResponse", self.host(auth));
        let body = self.build_payload(&request.payload, auth, &request.model)?;
        Ok(client
            .post(url)
            .bearer_auth(token)
            .header("Content-Type", "application/x-amz-json-1.0")
            .header("X-Amz-Target", "AmazonCodeWhispererService.GenerateAssistantResponse")
            .body(body))
    }

    /// The event stream interleaves binary frame headers with JSON event
    /// bodies. Extracting the first JSON object per line and rewriting it as
    /// an OpenAI chunk keeps the shared parser path.
    fn preprocess_chunk(&self, line: &[u8]) -> Preprocessed {
        let Some(event) = extract_json_object(line) else {
            return Preprocessed::Skip;
        };
        if let Some(chunk) = kiro_event_to_openai_chunk(&event) {
            return Preprocessed::Payload(chunk.to_string().into_bytes());
        }
        Preprocessed::Skip
    }
}

fn flatten_content(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => {
            let mut out = String::new();
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    out.push_str(text);
                }
            }
            out
        }
        _ => String::new(),
    }
}

/// Scans a raw frame for the first balanced JSON object and parses it.
fn extract_json_object(line: &[u8]) -> Option<Value> {
    let start = line.iter().position(|b| *b == b'{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, b) in line[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_slice(&line[start..=start + i]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

fn kiro_event_to_openai_chunk(event: &Value) -> Option<Value> {
    if let Some(content) = event.get("content").and_then(Value::as_str) {
        return Some(json!({
            "choices": [{
                "index": 0,
                "delta": { "role": "assistant", "content": content },
                "finish_reason": Value::Null,
            }]
        }));
    }
    if let Some(name) = event.get("name").and_then(Value::as_str) {
        let id = event
            .get("toolUseId")
            .and_then(Value::as_str)
            .unwrap_or(name);
        let args = event.get("input").and_then(Value::as_str).unwrap_or("");
        let call = json!({
            "index": 0,
            "id": format!("call_{id}"),
            "type": "function",
            "function": { "name": name, "arguments": args },
        });
        return Some(json!({
            "choices": [{
                "index": 0,
                "delta": { "role": "assistant", "tool_calls": [call] },
                "finish_reason": Value::Null,
            }]
        }));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_folds_system_into_current_message() {
        let auth = Auth::new("k1", "kiro");
        let body = KiroExecutor
            .build_payload(
                br#"{"model":"x","messages":[
                    {"role":"system","content":"be terse"},
                    {"role":"user","content":"old question"},
                    {"role":"assistant","content":"old answer"},
                    {"role":"user","content":"new question"}
                ]}"#,
                &auth,
                "claude-sonnet-4.5",
            )
            .unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        let state = &parsed["conversationState"];
        let current = state["currentMessage"]["userInputMessage"]["content"]
            .as_str()
            .unwrap();
        assert!(current.contains("be terse"));
        assert!(current.contains("new question"));
        assert_eq!(state["history"].as_array().unwrap().len(), 2);
        assert_eq!(
            state["currentMessage"]["userInputMessage"]["modelId"],
            "claude-sonnet-4.5"
        );
    }

    #[test]
    fn extracts_json_from_framed_line() {
        let line = br#"event{"content":"hello"}"#;
        let event = extract_json_object(line).unwrap();
        assert_eq!(event["content"], "hello");
        assert!(extract_json_object(b"no json here").is_none());
    }

    #[test]
    fn content_events_become_openai_chunks() {
        match KiroExecutor.preprocess_chunk(br#"x{"content":"hi"}"#) {
            Preprocessed::Payload(payload) => {
                let chunk: Value = serde_json::from_slice(&payload).unwrap();
                assert_eq!(chunk["choices"][0]["delta"]["content"], "hi");
            }
            other => panic!("expected payload, got {other:?}"),
        }
    }

    #[test]
    fn tool_events_become_tool_call_chunks() {
        let line = br#"e{"name":"grep","toolUseId":"t1","input":"{\"q\":\"x\"}","stop":true}"#;
        match KiroExecutor.preprocess_chunk(line) {
            Preprocessed::Payload(payload) => {
                let chunk: Value = serde_json::from_slice(&payload).unwrap();
                let call = &chunk["choices"][0]["delta"]["tool_calls"][0];
                assert_eq!(call["id"], "call_t1");
                assert_eq!(call["function"]["name"], "grep");
            }
            other => panic!("expected payload, got {other:?}"),
        }
    }
}
