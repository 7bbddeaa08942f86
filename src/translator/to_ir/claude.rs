// Anthropic Messages -> IR.

use serde_json::Value;

use super::{opt_f64, opt_str, opt_u64, parse_body, parse_stop};
use crate::error::ProxyError;
use crate::ir::{
    self, CandidateResult, ContentPart, DeltaKind, FinishReason, Message, ParsedResponse,
    ReasoningConfig, ResponseMeta, Role, ToolCall, ToolDefinition, UnifiedChatRequest,
    UnifiedEvent, Usage,
};
use crate::translator::ToIrParser;

pub struct ClaudeParser;

impl ToIrParser for ClaudeParser {
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
            top_k: raw.get("top_k").and_then(Value::as_u64).map(|k| k as u32),
            max_tokens: opt_u64(&raw, "max_tokens"),
            tool_choice: raw.get("tool_choice").cloned(),
            ..Default::default()
        };
        if let Some(stop) = raw.get("stop_sequences") {
            req.stop = parse_stop(stop);
        }
        if let Some(thinking) = raw.get("thinking") {
            if opt_str(thinking, "type") == Some("enabled") {
                req.reasoning = Some(ReasoningConfig {
                    budget_tokens: opt_u64(thinking, "budget_tokens"),
                    include_thoughts: true,
                    ..Default::default()
                });
            }
        }

        // System prompt: a string or an array of text blocks.
        match raw.get("system") {
            Some(Value::String(text)) if !text.is_empty() => {
                req.messages.push(Message::text(Role::System, text.clone()));
            }
            Some(Value::Array(blocks)) => {
                let mut msg = Message::new(Role::System);
                for block in blocks {
                    if let Some(text) = opt_str(block, "text") {
                        msg.content.push(ContentPart::text(text));
                    }
                }
                if !msg.content.is_empty() {
                    req.messages.push(msg);
                }
            }
            _ => {}
        }

        for msg in raw.get("messages").and_then(Value::as_array).into_iter().flatten() {
            parse_message_into(msg, &mut req.messages);
        }

        for tool in raw.get("tools").and_then(Value::as_array).into_iter().flatten() {
            req.tools.push(ToolDefinition {
                name: opt_str(tool, "name").unwrap_or_default().to_string(),
                description: opt_str(tool, "description").unwrap_or_default().to_string(),
                parameters: tool.get("input_schema").cloned().unwrap_or(Value::Null),
            });
        }

        Ok(req)
    }

    fn parse_response(&self, payload: &[u8]) -> Result<ParsedResponse, ProxyError> {
        let raw = parse_body(payload)?;
        let mut message = Message::new(Role::Assistant);
        for block in raw.get("content").and_then(Value::as_array).into_iter().flatten() {
            parse_content_block(block, &mut message);
        }

        let finish = opt_str(&raw, "stop_reason")
            .map(FinishReason::from_claude)
            .unwrap_or(FinishReason::Stop);

        Ok(ParsedResponse {
            candidates: vec![CandidateResult {
                index: 0,
                messages: vec![message],
                finish_reason: finish,
            }],
            usage: parse_usage(raw.get("usage")),
            meta: ResponseMeta {
                response_id: opt_str(&raw, "id").map(str::to_string),
                model_version: opt_str(&raw, "model").map(str::to_string),
                created: None,
            },
        })
    }

    fn parse_chunk(&self, payload: &[u8]) -> Result<Vec<UnifiedEvent>, ProxyError> {
        let raw: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(_) => return Ok(Vec::new()),
        };
        let mut events = Vec::new();

        match opt_str(&raw, "type") {
            Some("message_start") => {
                let message = raw.get("message").cloned().unwrap_or(Value::Null);
                events.push(UnifiedEvent::MessageStart {
                    id: opt_str(&message, "id").map(str::to_string),
                    model: opt_str(&message, "model").map(str::to_string),
                });
                let usage = parse_usage(message.get("usage"));
                if !usage.is_empty() {
                    events.push(UnifiedEvent::Usage { usage });
                }
            }
            Some("content_block_start") => {
                let index = raw.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                if let Some(block) = raw.get("content_block") {
                    if opt_str(block, "type") == Some("tool_use") {
                        events.push(UnifiedEvent::ToolCallStart {
                            index,
                            id: opt_str(block, "id").unwrap_or_default().to_string(),
                            name: opt_str(block, "name").unwrap_or_default().to_string(),
                        });
                    }
                }
            }
            Some("content_block_delta") => {
                let index = raw.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                if let Some(delta) = raw.get("delta") {
                    match opt_str(delta, "type") {
                        Some("text_delta") => {
                            events.push(UnifiedEvent::ContentDelta {
                                index,
                                kind: DeltaKind::Text,
                                text: opt_str(delta, "text").unwrap_or_default().to_string(),
                                thought_signature: None,
                            });
                        }
                        Some("thinking_delta") => {
                            events.push(UnifiedEvent::ContentDelta {
                                index,
                                kind: DeltaKind::Reasoning,
                                text: opt_str(delta, "thinking").unwrap_or_default().to_string(),
                                thought_signature: None,
                            });
                        }
                        Some("signature_delta") => {
                            events.push(UnifiedEvent::ContentDelta {
                                index,
                                kind: DeltaKind::Reasoning,
                                text: String::new(),
                                thought_signature: opt_str(delta, "signature")
                                    .map(str::to_string),
                            });
                        }
                        Some("input_json_delta") => {
                            events.push(UnifiedEvent::ContentDelta {
                                index,
                                kind: DeltaKind::ToolArgs,
                                text: opt_str(delta, "partial_json").unwrap_or_default().to_string(),
                                thought_signature: None,
                            });
                        }
                        _ => {}
                    }
                }
            }
            Some("content_block_stop") => {
                let index = raw.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                events.push(UnifiedEvent::ToolCallEnd { index });
            }
            Some("message_delta") => {
                let usage = parse_usage(raw.get("usage"));
                if !usage.is_empty() {
                    events.push(UnifiedEvent::Usage { usage });
                }
                if let Some(reason) = raw.get("delta").and_then(|d| opt_str(d, "stop_reason")) {
                    events.push(UnifiedEvent::Finish {
                        reason: FinishReason::from_claude(reason),
                    });
                }
            }
            // message_stop and ping carry nothing the IR needs.
            _ => {}
        }

        Ok(events)
    }

    fn format(&self) -> &'static str {
        "claude"
    }
}

/// Claude messages interleave assistant content with tool results inside a
/// user turn; tool results split out into their own role=tool IR messages.
fn parse_message_into(msg: &Value, out: &mut Vec<Message>) {
    let role = Role::from_str(opt_str(msg, "role").unwrap_or("user"));

    match msg.get("content") {
        Some(Value::String(text)) => {
            if !text.is_empty() {
                out.push(Message::text(role, text.clone()));
            }
        }
        Some(Value::Array(blocks)) => {
            let mut current = Message::new(role);
            for block in blocks {
                if opt_str(block, "type") == Some("tool_result") {
                    if !current.content.is_empty() || !current.tool_calls.is_empty() {
                        out.push(std::mem::replace(&mut current, Message::new(role)));
                    }
                    let mut tool_msg = Message::new(Role::Tool);
                    tool_msg.tool_call_id =
                        opt_str(block, "tool_use_id").map(str::to_string);
                    match block.get("content") {
                        Some(Value::String(text)) => {
                            tool_msg.content.push(ContentPart::text(text.clone()));
                        }
                        Some(Value::Array(items)) => {
                            for item in items {
                                if let Some(text) = opt_str(item, "text") {
                                    tool_msg.content.push(ContentPart::text(text));
                                }
                            }
                        }
                        _ => {}
                    }
                    out.push(tool_msg);
                } else {
                    parse_content_block(block, &mut current);
                }
            }
            if !current.content.is_empty() || !current.tool_calls.is_empty() {
                out.push(current);
            }
        }
        _ => {}
    }
}

fn parse_content_block(block: &Value, message: &mut Message) {
    match opt_str(block, "type") {
        Some("text") => {
            if let Some(text) = opt_str(block, "text") {
                message.content.push(ContentPart::text(text));
            }
        }
        Some("thinking") => {
            message.content.push(ContentPart::reasoning(
                opt_str(block, "thinking").unwrap_or_default(),
                opt_str(block, "signature").map(str::to_string),
            ));
        }
        Some("redacted_thinking") => {
            message.content.push(ContentPart::reasoning(
                String::new(),
                opt_str(block, "data").map(str::to_string),
            ));
        }
        Some("image") => {
            if let Some(source) = block.get("source") {
                match opt_str(source, "type") {
                    Some("base64") => {
                        message.content.push(ContentPart::Image {
                            image: ir::ImagePart {
                                mime_type: opt_str(source, "media_type")
                                    .unwrap_or("image/png")
                                    .to_string(),
                                data: opt_str(source, "data").unwrap_or_default().to_string(),
                                url: String::new(),
                            },
                        });
                    }
                    Some("url") => {
                        if let Some(url) = opt_str(source, "url") {
                            message.content.push(ContentPart::Image {
                                image: ir::normalize_image_source(url, None),
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
        Some("tool_use") => {
            message.tool_calls.push(ToolCall {
                id: opt_str(block, "id").unwrap_or_default().to_string(),
                name: opt_str(block, "name").unwrap_or_default().to_string(),
                args: ir::canonical_tool_args(block.get("input").unwrap_or(&Value::Null)),
            });
        }
        _ => {
            message.content.push(ContentPart::Opaque {
                value: block.clone(),
            });
        }
    }
}

fn parse_usage(usage: Option<&Value>) -> Usage {
    let Some(usage) = usage else {
        return Usage::default();
    };
    let prompt = opt_u64(usage, "input_tokens").unwrap_or(0);
    let completion = opt_u64(usage, "output_tokens").unwrap_or(0);
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
        cache_creation_tokens: opt_u64(usage, "cache_creation_input_tokens").unwrap_or(0),
        cache_read_tokens: opt_u64(usage, "cache_read_input_tokens").unwrap_or(0),
        ..Default::default()
    }
}
