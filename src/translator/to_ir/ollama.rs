// Ollama /api/chat -> IR. Streaming chunks are newline-delimited JSON with
// the same shape as the non-stream response.

use serde_json::Value;

use super::{opt_str, opt_u64, parse_body, parse_stop};
use crate::error::ProxyError;
use crate::ir::{
    self, CandidateResult, ContentPart, DeltaKind, FinishReason, Message, ParsedResponse,
    ResponseMeta, Role, ToolCall, ToolDefinition, UnifiedChatRequest, UnifiedEvent, Usage,
};
use crate::translator::ToIrParser;

pub struct OllamaParser;

impl ToIrParser for OllamaParser {
    fn parse_request(&self, payload: &[u8]) -> Result<UnifiedChatRequest, ProxyError> {
        let raw = parse_body(payload)?;
        let model = opt_str(&raw, "model")
            .ok_or_else(|| ProxyError::user("missing required field: model"))?
            .to_string();

        let mut req = UnifiedChatRequest {
            model,
            // Ollama streams by default.
            stream: raw.get("stream").and_then(Value::as_bool).unwrap_or(true),
            ..Default::default()
        };

        for msg in raw.get("messages").and_then(Value::as_array).into_iter().flatten() {
            let role = Role::from_str(opt_str(msg, "role").unwrap_or("user"));
            let mut message = Message::new(role);
            if let Some(text) = opt_str(msg, "content") {
                if !text.is_empty() {
                    message.content.push(ContentPart::text(text));
                }
            }
            for image in msg.get("images").and_then(Value::as_array).into_iter().flatten() {
                if let Some(data) = image.as_str() {
                    message.content.push(ContentPart::Image {
                        image: ir::ImagePart {
                            mime_type: "image/png".to_string(),
                            data: data.to_string(),
                            url: String::new(),
                        },
                    });
                }
            }
            for tc in msg.get("tool_calls").and_then(Value::as_array).into_iter().flatten() {
                let function = tc.get("function").cloned().unwrap_or(Value::Null);
                message.tool_calls.push(ToolCall {
                    id: opt_str(tc, "id").unwrap_or_default().to_string(),
                    name: opt_str(&function, "name").unwrap_or_default().to_string(),
                    args: ir::canonical_tool_args(
                        function.get("arguments").unwrap_or(&Value::Null),
                    ),
                });
            }
            req.messages.push(message);
        }

        // /api/generate compatibility: a bare prompt becomes one user turn.
        if req.messages.is_empty() {
            if let Some(prompt) = opt_str(&raw, "prompt") {
                if let Some(system) = opt_str(&raw, "system") {
                    req.messages.push(Message::text(Role::System, system));
                }
                req.messages.push(Message::text(Role::User, prompt));
            }
        }

        for tool in raw.get("tools").and_then(Value::as_array).into_iter().flatten() {
            if let Some(function) = tool.get("function") {
                req.tools.push(ToolDefinition {
                    name: opt_str(function, "name").unwrap_or_default().to_string(),
                    description: opt_str(function, "description").unwrap_or_default().to_string(),
                    parameters: function.get("parameters").cloned().unwrap_or(Value::Null),
                });
            }
        }

        if let Some(options) = raw.get("options") {
            req.temperature = options.get("temperature").and_then(Value::as_f64);
            req.top_p = options.get("top_p").and_then(Value::as_f64);
            req.top_k = options.get("top_k").and_then(Value::as_u64).map(|k| k as u32);
            req.max_tokens = opt_u64(options, "num_predict");
            req.seed = options.get("seed").and_then(Value::as_i64);
            if let Some(stop) = options.get("stop") {
                req.stop = parse_stop(stop);
            }
        }

        Ok(req)
    }

    fn parse_response(&self, payload: &[u8]) -> Result<ParsedResponse, ProxyError> {
        let raw = parse_body(payload)?;
        let mut message = Message::new(Role::Assistant);
        if let Some(body) = raw.get("message") {
            if let Some(text) = opt_str(body, "content") {
                if !text.is_empty() {
                    message.content.push(ContentPart::text(text));
                }
            }
            for tc in body.get("tool_calls").and_then(Value::as_array).into_iter().flatten() {
                let function = tc.get("function").cloned().unwrap_or(Value::Null);
                message.tool_calls.push(ToolCall {
                    id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                    name: opt_str(&function, "name").unwrap_or_default().to_string(),
                    args: ir::canonical_tool_args(
                        function.get("arguments").unwrap_or(&Value::Null),
                    ),
                });
            }
        }

        let finish = if !message.tool_calls.is_empty() {
            FinishReason::ToolCalls
        } else {
            match opt_str(&raw, "done_reason") {
                Some("length") => FinishReason::Length,
                _ => FinishReason::Stop,
            }
        };

        Ok(ParsedResponse {
            candidates: vec![CandidateResult {
                index: 0,
                messages: vec![message],
                finish_reason: finish,
            }],
            usage: parse_counts(&raw),
            meta: ResponseMeta {
                model_version: opt_str(&raw, "model").map(str::to_string),
                ..Default::default()
            },
        })
    }

    fn parse_chunk(&self, payload: &[u8]) -> Result<Vec<UnifiedEvent>, ProxyError> {
        let raw: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(_) => return Ok(Vec::new()),
        };
        let mut events = Vec::new();

        if let Some(text) = raw.get("message").and_then(|m| opt_str(m, "content")) {
            if !text.is_empty() {
                events.push(UnifiedEvent::ContentDelta {
                    index: 0,
                    kind: DeltaKind::Text,
                    text: text.to_string(),
                    thought_signature: None,
                });
            }
        }

        if raw.get("done").and_then(Value::as_bool).unwrap_or(false) {
            let usage = parse_counts(&raw);
            if !usage.is_empty() {
                events.push(UnifiedEvent::Usage { usage });
            }
            let reason = match opt_str(&raw, "done_reason") {
                Some("length") => FinishReason::Length,
                _ => FinishReason::Stop,
            };
            events.push(UnifiedEvent::Finish { reason });
        }

        Ok(events)
    }

    fn format(&self) -> &'static str {
        "ollama"
    }
}

fn parse_counts(raw: &Value) -> Usage {
    let prompt = opt_u64(raw, "prompt_eval_count").unwrap_or(0);
    let completion = opt_u64(raw, "eval_count").unwrap_or(0);
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_with_options() {
        let body = br#"{
            "model": "gemini-2.5-flash",
            "messages": [{"role":"user","content":"hi"}],
            "options": {"temperature":0.8,"num_predict":128,"stop":"END"},
            "stream": false
        }"#;
        let req = OllamaParser.parse_request(body).unwrap();
        assert_eq!(req.temperature, Some(0.8));
        assert_eq!(req.max_tokens, Some(128));
        assert_eq!(req.stop, vec!["END".to_string()]);
        assert!(!req.stream);
    }

    #[test]
    fn generate_prompt_becomes_user_turn() {
        let body = br#"{"model":"m","prompt":"tell me","system":"be nice"}"#;
        let req = OllamaParser.parse_request(body).unwrap();
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[1].combined_text(), "tell me");
        // No explicit stream flag: Ollama defaults to streaming.
        assert!(req.stream);
    }

    #[test]
    fn done_chunk_ends_stream() {
        let chunk = br#"{"model":"m","message":{"role":"assistant","content":"!"},"done":true,"done_reason":"stop","prompt_eval_count":4,"eval_count":9}"#;
        let events = OllamaParser.parse_chunk(chunk).unwrap();
        assert!(matches!(&events[0], UnifiedEvent::ContentDelta { .. }));
        assert!(matches!(&events[1], UnifiedEvent::Usage { usage } if usage.total_tokens == 13));
        assert!(matches!(
            events[2],
            UnifiedEvent::Finish { reason: FinishReason::Stop }
        ));
    }
}
