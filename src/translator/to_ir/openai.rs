// OpenAI Chat Completions -> IR. Also serves cline, which speaks the same
// format with a different transport.

use serde_json::Value;

use super::{opt_f64, opt_str, opt_u64, parse_body, parse_stop};
use crate::error::ProxyError;
use crate::ir::{
    self, CandidateResult, ContentPart, DeltaKind, FinishReason, Message, ParsedResponse,
    ReasoningConfig, ResponseMeta, Role, ToolCall, ToolDefinition, UnifiedChatRequest,
    UnifiedEvent, Usage,
};
use crate::translator::ToIrParser;

pub struct OpenAIParser;

impl ToIrParser for OpenAIParser {
    fn parse_request(&self, payload: &[u8]) -> Result<UnifiedChatRequest, ProxyError> {
        let raw = parse_body(payload)?;
        let model = opt_str(&raw, "model")
            .ok_or_else(|| ProxyError::user("missing required field: model"))?
            .to_string();

        let mut req = UnifiedChatRequest {
            model,
            stream: raw.get("stream").and_then(Value::as_bool).unwrap_or(false),
            temperature: opt_f64(&raw, "temperature"),
            top_p: opt_f64(&raw, "top_p"),
            max_tokens: opt_u64(&raw, "max_tokens").or_else(|| opt_u64(&raw, "max_completion_tokens")),
            n: raw.get("n").and_then(Value::as_u64).map(|n| n as u32),
            seed: raw.get("seed").and_then(Value::as_i64),
            tool_choice: raw.get("tool_choice").cloned(),
            response_format: raw.get("response_format").cloned(),
            ..Default::default()
        };
        if let Some(stop) = raw.get("stop") {
            req.stop = parse_stop(stop);
        }
        if let Some(effort) = opt_str(&raw, "reasoning_effort") {
            req.reasoning = Some(ReasoningConfig {
                effort: Some(effort.to_string()),
                ..Default::default()
            });
        }

        for msg in raw.get("messages").and_then(Value::as_array).into_iter().flatten() {
            req.messages.push(parse_message(msg));
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

        Ok(req)
    }

    fn parse_response(&self, payload: &[u8]) -> Result<ParsedResponse, ProxyError> {
        let raw = parse_body(payload)?;
        let mut parsed = ParsedResponse {
            meta: ResponseMeta {
                response_id: opt_str(&raw, "id").map(str::to_string),
                model_version: opt_str(&raw, "model").map(str::to_string),
                created: raw.get("created").and_then(Value::as_i64),
            },
            usage: parse_usage(raw.get("usage")),
            ..Default::default()
        };

        for choice in raw.get("choices").and_then(Value::as_array).into_iter().flatten() {
            let index = choice.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
            let finish = opt_str(choice, "finish_reason")
                .map(FinishReason::from_openai)
                .unwrap_or(FinishReason::Stop);
            let message = choice
                .get("message")
                .map(parse_message)
                .unwrap_or_else(|| Message::new(Role::Assistant));
            parsed.candidates.push(CandidateResult {
                index,
                messages: vec![message],
                finish_reason: finish,
            });
        }
        Ok(parsed)
    }

    fn parse_chunk(&self, payload: &[u8]) -> Result<Vec<UnifiedEvent>, ProxyError> {
        let raw: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            // Partial frames are skipped, not fatal.
            Err(_) => return Ok(Vec::new()),
        };
        let mut events = Vec::new();

        let choice = raw
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first());

        let mut finish: Option<UnifiedEvent> = None;
        if let Some(choice) = choice {
            if let Some(delta) = choice.get("delta") {
                if opt_str(delta, "role").is_some() {
                    events.push(UnifiedEvent::MessageStart {
                        id: opt_str(&raw, "id").map(str::to_string),
                        model: opt_str(&raw, "model").map(str::to_string),
                    });
                }
                if let Some(text) = opt_str(delta, "content") {
                    if !text.is_empty() {
                        events.push(UnifiedEvent::ContentDelta {
                            index: 0,
                            kind: DeltaKind::Text,
                            text: text.to_string(),
                            thought_signature: None,
                        });
                    }
                }
                if let Some(text) = opt_str(delta, "reasoning_content")
                    .or_else(|| opt_str(delta, "reasoning"))
                {
                    if !text.is_empty() {
                        events.push(UnifiedEvent::ContentDelta {
                            index: 0,
                            kind: DeltaKind::Reasoning,
                            text: text.to_string(),
                            thought_signature: None,
                        });
                    }
                }
                for tc in delta.get("tool_calls").and_then(Value::as_array).into_iter().flatten() {
                    let index = tc.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                    let name = tc
                        .get("function")
                        .and_then(|f| opt_str(f, "name"))
                        .unwrap_or_default();
                    if let Some(id) = opt_str(tc, "id") {
                        events.push(UnifiedEvent::ToolCallStart {
                            index,
                            id: id.to_string(),
                            name: name.to_string(),
                        });
                    }
                    if let Some(args) = tc.get("function").and_then(|f| f.get("arguments")) {
                        let text = ir::canonical_tool_args(args);
                        if !text.is_empty() && text != "{}" {
                            events.push(UnifiedEvent::ContentDelta {
                                index,
                                kind: DeltaKind::ToolArgs,
                                text,
                                thought_signature: None,
                            });
                        }
                    }
                }
            }
            if let Some(reason) = opt_str(choice, "finish_reason") {
                finish = Some(UnifiedEvent::Finish {
                    reason: FinishReason::from_openai(reason),
                });
            }
        }

        // Usage precedes the finish event in the unified ordering.
        let usage = parse_usage(raw.get("usage"));
        if !usage.is_empty() {
            events.push(UnifiedEvent::Usage { usage });
        }
        if let Some(finish) = finish {
            events.push(finish);
        }

        Ok(events)
    }

    fn format(&self) -> &'static str {
        "openai"
    }
}

fn parse_message(msg: &Value) -> Message {
    let role = Role::from_str(opt_str(msg, "role").unwrap_or("user"));
    let mut out = Message::new(role);
    out.tool_call_id = opt_str(msg, "tool_call_id").map(str::to_string);

    match msg.get("content") {
        Some(Value::String(text)) => {
            if !text.is_empty() {
                out.content.push(ContentPart::text(text.clone()));
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                match opt_str(item, "type") {
                    Some("text") => {
                        out.content
                            .push(ContentPart::text(opt_str(item, "text").unwrap_or_default()));
                    }
                    Some("image_url") => {
                        if let Some(url) = item
                            .get("image_url")
                            .and_then(|v| opt_str(v, "url"))
                        {
                            out.content.push(ContentPart::Image {
                                image: ir::normalize_image_source(url, None),
                            });
                        }
                    }
                    Some("input_audio") => {
                        if let Some(audio) = item.get("input_audio") {
                            out.content.push(ContentPart::Audio {
                                audio: ir::MediaPart {
                                    mime_type: format!(
                                        "audio/{}",
                                        opt_str(audio, "format").unwrap_or("wav")
                                    ),
                                    data: opt_str(audio, "data").unwrap_or_default().to_string(),
                                    file_uri: String::new(),
                                },
                            });
                        }
                    }
                    _ => {
                        out.content.push(ContentPart::Opaque { value: item.clone() });
                    }
                }
            }
        }
        _ => {}
    }

    if let Some(text) = opt_str(msg, "reasoning_content").or_else(|| opt_str(msg, "reasoning")) {
        if !text.is_empty() {
            out.content.push(ContentPart::reasoning(text, None));
        }
    }

    for tc in msg.get("tool_calls").and_then(Value::as_array).into_iter().flatten() {
        let function = tc.get("function").cloned().unwrap_or(Value::Null);
        out.tool_calls.push(ToolCall {
            id: opt_str(tc, "id").unwrap_or_default().to_string(),
            name: opt_str(&function, "name").unwrap_or_default().to_string(),
            args: ir::canonical_tool_args(
                function.get("arguments").unwrap_or(&Value::Null),
            ),
        });
    }

    out
}

pub(crate) fn parse_usage(usage: Option<&Value>) -> Usage {
    let Some(usage) = usage else {
        return Usage::default();
    };
    let mut out = Usage {
        prompt_tokens: opt_u64(usage, "prompt_tokens").unwrap_or(0),
        completion_tokens: opt_u64(usage, "completion_tokens").unwrap_or(0),
        total_tokens: opt_u64(usage, "total_tokens").unwrap_or(0),
        ..Default::default()
    };
    if let Some(details) = usage.get("completion_tokens_details") {
        out.reasoning_tokens = opt_u64(details, "reasoning_tokens").unwrap_or(0);
        out.audio_tokens = opt_u64(details, "audio_tokens").unwrap_or(0);
    }
    if let Some(details) = usage.get("prompt_tokens_details") {
        out.cached_tokens = opt_u64(details, "cached_tokens").unwrap_or(0);
    }
    out
}
