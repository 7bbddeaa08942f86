// OpenAI Responses API (Codex) -> IR.

use serde_json::Value;

use super::{opt_f64, opt_str, opt_u64, parse_body};
use crate::error::ProxyError;
use crate::ir::{
    self, CandidateResult, ContentPart, DeltaKind, FinishReason, Message, ParsedResponse,
    ReasoningConfig, ResponseMeta, Role, ToolCall, ToolDefinition, UnifiedChatRequest,
    UnifiedEvent, Usage,
};
use crate::translator::ToIrParser;

pub struct CodexParser;

impl ToIrParser for CodexParser {
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
            max_tokens: opt_u64(&raw, "max_output_tokens"),
            ..Default::default()
        };

        if let Some(instructions) = opt_str(&raw, "instructions") {
            if !instructions.is_empty() {
                req.messages.push(Message::text(Role::System, instructions));
            }
        }
        if let Some(reasoning) = raw.get("reasoning") {
            req.reasoning = Some(ReasoningConfig {
                effort: opt_str(reasoning, "effort").map(str::to_string),
                include_thoughts: reasoning.get("summary").is_some(),
                ..Default::default()
            });
        }
        if let Some(text) = raw.get("text") {
            if let Some(format) = text.get("format") {
                req.response_format = Some(format.clone());
            }
        }

        // `input` may be a bare string or a list of typed items.
        match raw.get("input") {
            Some(Value::String(text)) => {
                req.messages.push(Message::text(Role::User, text.clone()));
            }
            Some(Value::Array(items)) => {
                for item in items {
                    parse_input_item(item, &mut req.messages);
                }
            }
            _ => {}
        }

        for tool in raw.get("tools").and_then(Value::as_array).into_iter().flatten() {
            // Responses API flattens the function definition.
            if opt_str(tool, "type") == Some("function") || tool.get("name").is_some() {
                req.tools.push(ToolDefinition {
                    name: opt_str(tool, "name").unwrap_or_default().to_string(),
                    description: opt_str(tool, "description").unwrap_or_default().to_string(),
                    parameters: tool.get("parameters").cloned().unwrap_or(Value::Null),
                });
            }
        }
        if let Some(choice) = raw.get("tool_choice") {
            req.tool_choice = Some(choice.clone());
        }

        Ok(req)
    }

    fn parse_response(&self, payload: &[u8]) -> Result<ParsedResponse, ProxyError> {
        let raw = parse_body(payload)?;
        let mut message = Message::new(Role::Assistant);

        for item in raw.get("output").and_then(Value::as_array).into_iter().flatten() {
            match opt_str(item, "type") {
                Some("message") => {
                    for part in item.get("content").and_then(Value::as_array).into_iter().flatten() {
                        if opt_str(part, "type") == Some("output_text") {
                            if let Some(text) = opt_str(part, "text") {
                                message.content.push(ContentPart::text(text));
                            }
                        }
                    }
                }
                Some("reasoning") => {
                    for part in item.get("summary").and_then(Value::as_array).into_iter().flatten() {
                        if let Some(text) = opt_str(part, "text") {
                            message.content.push(ContentPart::reasoning(text, None));
                        }
                    }
                }
                Some("function_call") => {
                    message.tool_calls.push(ToolCall {
                        id: opt_str(item, "call_id")
                            .or_else(|| opt_str(item, "id"))
                            .unwrap_or_default()
                            .to_string(),
                        name: opt_str(item, "name").unwrap_or_default().to_string(),
                        args: ir::canonical_tool_args(
                            item.get("arguments").unwrap_or(&Value::Null),
                        ),
                    });
                }
                _ => {}
            }
        }

        let finish = if !message.tool_calls.is_empty() {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        };

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
                created: raw.get("created_at").and_then(Value::as_i64),
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
            Some("response.created") => {
                let response = raw.get("response").cloned().unwrap_or(Value::Null);
                events.push(UnifiedEvent::MessageStart {
                    id: opt_str(&response, "id").map(str::to_string),
                    model: opt_str(&response, "model").map(str::to_string),
                });
            }
            Some("response.output_text.delta") => {
                if let Some(text) = opt_str(&raw, "delta") {
                    events.push(UnifiedEvent::ContentDelta {
                        index: output_index(&raw),
                        kind: DeltaKind::Text,
                        text: text.to_string(),
                        thought_signature: None,
                    });
                }
            }
            Some("response.reasoning_summary_text.delta")
            | Some("response.reasoning_text.delta") => {
                if let Some(text) = opt_str(&raw, "delta") {
                    events.push(UnifiedEvent::ContentDelta {
                        index: output_index(&raw),
                        kind: DeltaKind::Reasoning,
                        text: text.to_string(),
                        thought_signature: None,
                    });
                }
            }
            Some("response.output_item.added") => {
                if let Some(item) = raw.get("item") {
                    if opt_str(item, "type") == Some("function_call") {
                        events.push(UnifiedEvent::ToolCallStart {
                            index: output_index(&raw),
                            id: opt_str(item, "call_id")
                                .or_else(|| opt_str(item, "id"))
                                .unwrap_or_default()
                                .to_string(),
                            name: opt_str(item, "name").unwrap_or_default().to_string(),
                        });
                    }
                }
            }
            Some("response.function_call_arguments.delta") => {
                if let Some(text) = opt_str(&raw, "delta") {
                    events.push(UnifiedEvent::ContentDelta {
                        index: output_index(&raw),
                        kind: DeltaKind::ToolArgs,
                        text: text.to_string(),
                        thought_signature: None,
                    });
                }
            }
            Some("response.output_item.done") => {
                if let Some(item) = raw.get("item") {
                    if opt_str(item, "type") == Some("function_call") {
                        events.push(UnifiedEvent::ToolCallEnd {
                            index: output_index(&raw),
                        });
                    }
                }
            }
            Some("response.completed") | Some("response.incomplete") => {
                let response = raw.get("response").cloned().unwrap_or(Value::Null);
                let usage = parse_usage(response.get("usage"));
                if !usage.is_empty() {
                    events.push(UnifiedEvent::Usage { usage });
                }
                let has_tool_calls = response
                    .get("output")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .any(|i| opt_str(i, "type") == Some("function_call"))
                    })
                    .unwrap_or(false);
                let reason = if has_tool_calls {
                    FinishReason::ToolCalls
                } else if opt_str(&raw, "type") == Some("response.incomplete") {
                    FinishReason::Length
                } else {
                    FinishReason::Stop
                };
                events.push(UnifiedEvent::Finish { reason });
            }
            _ => {}
        }

        Ok(events)
    }

    fn format(&self) -> &'static str {
        "codex"
    }
}

fn output_index(raw: &Value) -> usize {
    raw.get("output_index")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize
}

fn parse_input_item(item: &Value, messages: &mut Vec<Message>) {
    match opt_str(item, "type") {
        Some("message") | None => {
            let role = Role::from_str(opt_str(item, "role").unwrap_or("user"));
            let mut msg = Message::new(role);
            match item.get("content") {
                Some(Value::String(text)) => {
                    msg.content.push(ContentPart::text(text.clone()));
                }
                Some(Value::Array(parts)) => {
                    for part in parts {
                        match opt_str(part, "type") {
                            Some("input_text") | Some("output_text") | Some("text") => {
                                if let Some(text) = opt_str(part, "text") {
                                    msg.content.push(ContentPart::text(text));
                                }
                            }
                            Some("input_image") => {
                                if let Some(url) = opt_str(part, "image_url") {
                                    msg.content.push(ContentPart::Image {
                                        image: ir::normalize_image_source(url, None),
                                    });
                                }
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
            if !msg.content.is_empty() {
                messages.push(msg);
            }
        }
        Some("function_call") => {
            let mut msg = take_trailing_assistant(messages);
            msg.tool_calls.push(ToolCall {
                id: opt_str(item, "call_id").unwrap_or_default().to_string(),
                name: opt_str(item, "name").unwrap_or_default().to_string(),
                args: ir::canonical_tool_args(item.get("arguments").unwrap_or(&Value::Null)),
            });
            messages.push(msg);
        }
        Some("function_call_output") => {
            let mut msg = Message::new(Role::Tool);
            msg.tool_call_id = opt_str(item, "call_id").map(str::to_string);
            if let Some(output) = item.get("output") {
                msg.content
                    .push(ContentPart::text(ir::canonical_tool_args(output)));
            }
            messages.push(msg);
        }
        _ => {}
    }
}

/// Function_call items attach to the preceding assistant turn when one
/// exists; otherwise they open a new one.
fn take_trailing_assistant(messages: &mut Vec<Message>) -> Message {
    if messages
        .last()
        .map(|m| m.role == Role::Assistant)
        .unwrap_or(false)
    {
        messages.pop().expect("non-empty checked above")
    } else {
        Message::new(Role::Assistant)
    }
}

fn parse_usage(usage: Option<&Value>) -> Usage {
    let Some(usage) = usage else {
        return Usage::default();
    };
    let mut out = Usage {
        prompt_tokens: opt_u64(usage, "input_tokens").unwrap_or(0),
        completion_tokens: opt_u64(usage, "output_tokens").unwrap_or(0),
        total_tokens: opt_u64(usage, "total_tokens").unwrap_or(0),
        ..Default::default()
    };
    if let Some(details) = usage.get("output_tokens_details") {
        out.reasoning_tokens = opt_u64(details, "reasoning_tokens").unwrap_or(0);
    }
    if let Some(details) = usage.get("input_tokens_details") {
        out.cached_tokens = opt_u64(details, "cached_tokens").unwrap_or(0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instructions_and_input_items() {
        let body = br#"{
            "model": "gpt-5-codex",
            "instructions": "you are codex",
            "input": [
                {"type":"message","role":"user","content":[{"type":"input_text","text":"hi"}]},
                {"type":"function_call","call_id":"call_1","name":"f","arguments":"{\"x\":1}"},
                {"type":"function_call_output","call_id":"call_1","output":"42"}
            ],
            "reasoning": {"effort":"high","summary":"auto"}
        }"#;
        let req = CodexParser.parse_request(body).unwrap();
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[1].combined_text(), "hi");
        assert_eq!(req.messages[2].tool_calls[0].id, "call_1");
        assert_eq!(req.messages[3].role, Role::Tool);
        assert_eq!(req.reasoning.unwrap().effort.as_deref(), Some("high"));
    }

    #[test]
    fn function_call_attaches_to_preceding_assistant_turn() {
        let body = br#"{
            "model": "gpt-5",
            "input": [
                {"type":"message","role":"assistant","content":[{"type":"output_text","text":"calling"}]},
                {"type":"function_call","call_id":"call_2","name":"g","arguments":"{}"}
            ]
        }"#;
        let req = CodexParser.parse_request(body).unwrap();
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].combined_text(), "calling");
        assert_eq!(req.messages[0].tool_calls[0].name, "g");
    }

    #[test]
    fn response_output_items() {
        let body = br#"{
            "id": "resp_1",
            "model": "gpt-5-codex",
            "output": [
                {"type":"reasoning","summary":[{"type":"summary_text","text":"thinking"}]},
                {"type":"message","role":"assistant","content":[{"type":"output_text","text":"done"}]},
                {"type":"function_call","call_id":"call_3","name":"f","arguments":"{\"y\":2}"}
            ],
            "usage": {"input_tokens":10,"output_tokens":5,"total_tokens":15,
                      "output_tokens_details":{"reasoning_tokens":3}}
        }"#;
        let parsed = CodexParser.parse_response(body).unwrap();
        let msg = &parsed.first_messages()[0];
        assert_eq!(msg.combined_reasoning(), "thinking");
        assert_eq!(msg.combined_text(), "done");
        assert_eq!(msg.tool_calls[0].id, "call_3");
        assert_eq!(parsed.finish_reason(), FinishReason::ToolCalls);
        assert_eq!(parsed.usage.reasoning_tokens, 3);
    }

    #[test]
    fn stream_event_mapping() {
        let delta = br#"{"type":"response.output_text.delta","output_index":0,"delta":"he"}"#;
        let events = CodexParser.parse_chunk(delta).unwrap();
        assert!(matches!(
            &events[0],
            UnifiedEvent::ContentDelta { kind: DeltaKind::Text, text, .. } if text == "he"
        ));

        let added = br#"{"type":"response.output_item.added","output_index":1,"item":{"type":"function_call","call_id":"call_7","name":"f"}}"#;
        let events = CodexParser.parse_chunk(added).unwrap();
        assert!(matches!(
            &events[0],
            UnifiedEvent::ToolCallStart { index: 1, id, .. } if id == "call_7"
        ));

        let completed = br#"{"type":"response.completed","response":{"output":[],"usage":{"input_tokens":1,"output_tokens":2,"total_tokens":3}}}"#;
        let events = CodexParser.parse_chunk(completed).unwrap();
        assert!(matches!(&events[0], UnifiedEvent::Usage { .. }));
        assert!(matches!(
            events[1],
            UnifiedEvent::Finish { reason: FinishReason::Stop }
        ));
    }
}
