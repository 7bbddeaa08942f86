// Gemini generateContent -> IR. Handles both the bare API shape and parts
// that arrive through the Cloud Code envelope (the executor unwraps the
// envelope before chunks reach this parser).

use serde_json::Value;

use super::{opt_str, opt_u64, parse_body};
use crate::error::ProxyError;
use crate::ir::{
    self, CandidateResult, ContentPart, DeltaKind, FinishReason, Message, ParsedResponse,
    ReasoningConfig, ResponseMeta, Role, ToolCall, ToolDefinition, UnifiedChatRequest,
    UnifiedEvent, Usage,
};
use crate::translator::ToIrParser;

pub struct GeminiParser;

impl ToIrParser for GeminiParser {
    fn parse_request(&self, payload: &[u8]) -> Result<UnifiedChatRequest, ProxyError> {
        let raw = parse_body(payload)?;
        let mut req = UnifiedChatRequest {
            // The route carries the model and stream flag for Gemini-native
            // requests; the server injects both into the body.
            model: opt_str(&raw, "model").unwrap_or_default().to_string(),
            stream: raw.get("stream").and_then(Value::as_bool).unwrap_or(false),
            ..Default::default()
        };

        if let Some(system) = raw.get("systemInstruction").or_else(|| raw.get("system_instruction")) {
            let mut msg = Message::new(Role::System);
            for part in system.get("parts").and_then(Value::as_array).into_iter().flatten() {
                if let Some(text) = opt_str(part, "text") {
                    msg.content.push(ContentPart::text(text));
                }
            }
            if !msg.content.is_empty() {
                req.messages.push(msg);
            }
        }

        for content in raw.get("contents").and_then(Value::as_array).into_iter().flatten() {
            let role = Role::from_str(opt_str(content, "role").unwrap_or("user"));
            let mut msg = Message::new(role);
            let mut tool_results: Vec<Message> = Vec::new();
            for part in content.get("parts").and_then(Value::as_array).into_iter().flatten() {
                parse_part(part, &mut msg, &mut tool_results);
            }
            if !msg.content.is_empty() || !msg.tool_calls.is_empty() {
                req.messages.push(msg);
            }
            req.messages.append(&mut tool_results);
        }

        for tool in raw.get("tools").and_then(Value::as_array).into_iter().flatten() {
            for decl in tool
                .get("functionDeclarations")
                .or_else(|| tool.get("function_declarations"))
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                req.tools.push(ToolDefinition {
                    name: opt_str(decl, "name").unwrap_or_default().to_string(),
                    description: opt_str(decl, "description").unwrap_or_default().to_string(),
                    parameters: decl
                        .get("parameters")
                        .or_else(|| decl.get("parametersJsonSchema"))
                        .cloned()
                        .unwrap_or(Value::Null),
                });
            }
        }
        if let Some(tool_config) = raw.get("toolConfig") {
            req.tool_choice = Some(tool_config.clone());
        }

        if let Some(cfg) = raw.get("generationConfig").or_else(|| raw.get("generation_config")) {
            req.temperature = cfg.get("temperature").and_then(Value::as_f64);
            req.top_p = cfg.get("topP").and_then(Value::as_f64);
            req.top_k = cfg.get("topK").and_then(Value::as_u64).map(|k| k as u32);
            req.max_tokens = opt_u64(cfg, "maxOutputTokens");
            req.n = cfg.get("candidateCount").and_then(Value::as_u64).map(|n| n as u32);
            req.seed = cfg.get("seed").and_then(Value::as_i64);
            for stop in cfg.get("stopSequences").and_then(Value::as_array).into_iter().flatten() {
                if let Some(s) = stop.as_str() {
                    req.stop.push(s.to_string());
                }
            }
            if let Some(mime) = opt_str(cfg, "responseMimeType") {
                let mut format = serde_json::Map::new();
                format.insert("mime_type".to_string(), Value::String(mime.to_string()));
                if let Some(schema) = cfg.get("responseSchema") {
                    format.insert("schema".to_string(), schema.clone());
                }
                req.response_format = Some(Value::Object(format));
            }
            if let Some(thinking) = cfg.get("thinkingConfig") {
                req.reasoning = Some(ReasoningConfig {
                    budget_tokens: opt_u64(thinking, "thinkingBudget"),
                    include_thoughts: thinking
                        .get("includeThoughts")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    ..Default::default()
                });
            }
        }

        Ok(req)
    }

    fn parse_response(&self, payload: &[u8]) -> Result<ParsedResponse, ProxyError> {
        let raw = parse_body(payload)?;
        let mut parsed = ParsedResponse {
            usage: parse_usage_metadata(raw.get("usageMetadata")),
            meta: ResponseMeta {
                response_id: opt_str(&raw, "responseId").map(str::to_string),
                model_version: opt_str(&raw, "modelVersion").map(str::to_string),
                created: None,
            },
            ..Default::default()
        };

        for (pos, candidate) in raw
            .get("candidates")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .enumerate()
        {
            let index = candidate
                .get("index")
                .and_then(Value::as_u64)
                .map(|i| i as usize)
                .unwrap_or(pos);
            let mut message = Message::new(Role::Assistant);
            let mut tool_results = Vec::new();
            for part in candidate
                .get("content")
                .and_then(|c| c.get("parts"))
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                parse_part(part, &mut message, &mut tool_results);
            }
            let finish = opt_str(candidate, "finishReason")
                .map(FinishReason::from_gemini)
                .unwrap_or(FinishReason::Stop);
            let finish = if !message.tool_calls.is_empty() {
                FinishReason::ToolCalls
            } else {
                finish
            };
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
            Err(_) => return Ok(Vec::new()),
        };
        let mut events = Vec::new();

        if let Some(id) = opt_str(&raw, "responseId") {
            events.push(UnifiedEvent::MessageStart {
                id: Some(id.to_string()),
                model: opt_str(&raw, "modelVersion").map(str::to_string),
            });
        }

        let candidate = raw
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|c| c.first());

        let mut saw_tool_call = false;
        let mut finish: Option<UnifiedEvent> = None;
        if let Some(candidate) = candidate {
            for part in candidate
                .get("content")
                .and_then(|c| c.get("parts"))
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let signature = part
                    .get("thoughtSignature")
                    .or_else(|| part.get("thought_signature"))
                    .and_then(Value::as_str)
                    .map(str::to_string);

                if let Some(fc) = part.get("functionCall") {
                    saw_tool_call = true;
                    let name = opt_str(fc, "name").unwrap_or_default();
                    let id = opt_str(fc, "id")
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                    events.push(UnifiedEvent::ToolCallStart {
                        index: 0,
                        id,
                        name: name.to_string(),
                    });
                    let args = ir::canonical_tool_args(fc.get("args").unwrap_or(&Value::Null));
                    events.push(UnifiedEvent::ContentDelta {
                        index: 0,
                        kind: DeltaKind::ToolArgs,
                        text: args,
                        thought_signature: signature,
                    });
                    events.push(UnifiedEvent::ToolCallEnd { index: 0 });
                    continue;
                }

                if let Some(text) = opt_str(part, "text") {
                    let thought = part.get("thought").and_then(Value::as_bool).unwrap_or(false);
                    // Signature-only frames carry no content.
                    if text.is_empty() && signature.is_none() {
                        continue;
                    }
                    events.push(UnifiedEvent::ContentDelta {
                        index: 0,
                        kind: if thought { DeltaKind::Reasoning } else { DeltaKind::Text },
                        text: text.to_string(),
                        thought_signature: signature,
                    });
                }
            }

            if let Some(reason) = opt_str(candidate, "finishReason") {
                let reason = if saw_tool_call {
                    FinishReason::ToolCalls
                } else {
                    FinishReason::from_gemini(reason)
                };
                finish = Some(UnifiedEvent::Finish { reason });
            }
        }

        // Usage precedes the finish event in the unified ordering.
        let usage = parse_usage_metadata(raw.get("usageMetadata"));
        if !usage.is_empty() {
            events.push(UnifiedEvent::Usage { usage });
        }
        if let Some(finish) = finish {
            events.push(finish);
        }

        Ok(events)
    }

    fn format(&self) -> &'static str {
        "gemini"
    }
}

fn parse_part(part: &Value, message: &mut Message, tool_results: &mut Vec<Message>) {
    let signature = part
        .get("thoughtSignature")
        .or_else(|| part.get("thought_signature"))
        .and_then(Value::as_str)
        .map(str::to_string);

    if let Some(text) = opt_str(part, "text") {
        if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
            message.content.push(ContentPart::reasoning(text, signature));
        } else {
            message.content.push(ContentPart::text(text));
        }
        return;
    }
    if let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data")) {
        let mime = opt_str(inline, "mimeType")
            .or_else(|| opt_str(inline, "mime_type"))
            .unwrap_or("image/png");
        let data = opt_str(inline, "data").unwrap_or_default();
        if mime.starts_with("audio/") {
            message.content.push(ContentPart::Audio {
                audio: ir::MediaPart {
                    mime_type: mime.to_string(),
                    data: data.to_string(),
                    file_uri: String::new(),
                },
            });
        } else if mime.starts_with("video/") {
            message.content.push(ContentPart::Video {
                video: ir::MediaPart {
                    mime_type: mime.to_string(),
                    data: data.to_string(),
                    file_uri: String::new(),
                },
            });
        } else {
            message.content.push(ContentPart::Image {
                image: ir::ImagePart {
                    mime_type: mime.to_string(),
                    data: data.to_string(),
                    url: String::new(),
                },
            });
        }
        return;
    }
    if let Some(file) = part.get("fileData").or_else(|| part.get("file_data")) {
        let mime = opt_str(file, "mimeType").unwrap_or_default().to_string();
        let uri = opt_str(file, "fileUri")
            .or_else(|| opt_str(file, "file_uri"))
            .unwrap_or_default();
        if mime.starts_with("audio/") {
            message.content.push(ContentPart::Audio {
                audio: ir::MediaPart {
                    mime_type: mime,
                    data: String::new(),
                    file_uri: uri.to_string(),
                },
            });
        } else if mime.starts_with("video/") {
            message.content.push(ContentPart::Video {
                video: ir::MediaPart {
                    mime_type: mime,
                    data: String::new(),
                    file_uri: uri.to_string(),
                },
            });
        } else {
            message.content.push(ContentPart::Image {
                image: ir::ImagePart {
                    mime_type: mime,
                    data: String::new(),
                    url: uri.to_string(),
                },
            });
        }
        return;
    }
    if let Some(fc) = part.get("functionCall").or_else(|| part.get("function_call")) {
        message.tool_calls.push(ToolCall {
            id: opt_str(fc, "id").unwrap_or_default().to_string(),
            name: opt_str(fc, "name").unwrap_or_default().to_string(),
            args: ir::canonical_tool_args(fc.get("args").unwrap_or(&Value::Null)),
        });
        return;
    }
    if let Some(fr) = part.get("functionResponse").or_else(|| part.get("function_response")) {
        let mut tool_msg = Message::new(Role::Tool);
        tool_msg.tool_call_id = opt_str(fr, "id")
            .or_else(|| opt_str(fr, "name"))
            .map(str::to_string);
        if let Some(response) = fr.get("response") {
            tool_msg.content.push(ContentPart::text(
                ir::canonical_tool_args(response),
            ));
        }
        tool_results.push(tool_msg);
        return;
    }
    if let Some(code) = part.get("executableCode") {
        message.content.push(ContentPart::ExecutableCode {
            execution: ir::CodeExecution {
                language: opt_str(code, "language").unwrap_or_default().to_string(),
                code: opt_str(code, "code").unwrap_or_default().to_string(),
                ..Default::default()
            },
        });
        return;
    }
    if let Some(result) = part.get("codeExecutionResult") {
        message.content.push(ContentPart::CodeResult {
            execution: ir::CodeExecution {
                outcome: opt_str(result, "outcome").unwrap_or_default().to_string(),
                output: opt_str(result, "output").unwrap_or_default().to_string(),
                ..Default::default()
            },
        });
        return;
    }
    // Unknown part: keep it so it can round-trip.
    message.content.push(ContentPart::Opaque { value: part.clone() });
}

fn parse_usage_metadata(usage: Option<&Value>) -> Usage {
    let Some(usage) = usage else {
        return Usage::default();
    };
    Usage {
        prompt_tokens: opt_u64(usage, "promptTokenCount").unwrap_or(0),
        completion_tokens: opt_u64(usage, "candidatesTokenCount").unwrap_or(0),
        total_tokens: opt_u64(usage, "totalTokenCount").unwrap_or(0),
        reasoning_tokens: opt_u64(usage, "thoughtsTokenCount").unwrap_or(0),
        cached_tokens: opt_u64(usage, "cachedContentTokenCount").unwrap_or(0),
        tool_use_prompt_tokens: opt_u64(usage, "toolUsePromptTokenCount").unwrap_or(0),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_contents_and_generation_config() {
        let body = br#"{
            "contents": [{"role":"user","parts":[{"text":"hi"}]}],
            "systemInstruction": {"parts":[{"text":"be brief"}]},
            "generationConfig": {"temperature":0.4,"topK":32,"maxOutputTokens":512,
                                 "stopSequences":["END"],
                                 "thinkingConfig":{"includeThoughts":true,"thinkingBudget":1024}}
        }"#;
        let req = GeminiParser.parse_request(body).unwrap();
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[1].combined_text(), "hi");
        assert_eq!(req.temperature, Some(0.4));
        assert_eq!(req.top_k, Some(32));
        assert_eq!(req.max_tokens, Some(512));
        assert_eq!(req.stop, vec!["END".to_string()]);
        assert!(req.reasoning.unwrap().include_thoughts);
    }

    #[test]
    fn function_call_and_response_parts() {
        let body = br#"{
            "contents": [
                {"role":"model","parts":[{"functionCall":{"id":"fc1","name":"f","args":{"x":1}}}]},
                {"role":"user","parts":[{"functionResponse":{"id":"fc1","name":"f","response":{"ok":true}}}]}
            ]
        }"#;
        let req = GeminiParser.parse_request(body).unwrap();
        assert_eq!(req.messages[0].tool_calls[0].name, "f");
        assert_eq!(req.messages[0].tool_calls[0].args, "{\"x\":1}");
        assert_eq!(req.messages[1].role, Role::Tool);
        assert_eq!(req.messages[1].tool_call_id.as_deref(), Some("fc1"));
    }

    #[test]
    fn response_candidates_keep_grouping() {
        let body = br#"{
            "candidates": [
                {"index":0,"content":{"role":"model","parts":[{"text":"a"}]},"finishReason":"STOP"},
                {"index":1,"content":{"role":"model","parts":[{"text":"b"}]},"finishReason":"MAX_TOKENS"}
            ],
            "usageMetadata": {"promptTokenCount":1,"candidatesTokenCount":2,"totalTokenCount":3,
                              "thoughtsTokenCount":1}
        }"#;
        let parsed = GeminiParser.parse_response(body).unwrap();
        assert_eq!(parsed.candidates.len(), 2);
        assert_eq!(parsed.candidates[1].index, 1);
        assert_eq!(parsed.candidates[1].finish_reason, FinishReason::Length);
        assert_eq!(parsed.usage.reasoning_tokens, 1);
    }

    #[test]
    fn thought_parts_carry_signature() {
        let body = br#"{
            "candidates": [{"content":{"role":"model","parts":[
                {"text":"pondering","thought":true,"thoughtSignature":"c2lnLWJ5dGVzLW9wYXF1ZS12YWx1ZQ=="},
                {"text":"answer"}
            ]},"finishReason":"STOP"}]
        }"#;
        let parsed = GeminiParser.parse_response(body).unwrap();
        let msg = &parsed.first_messages()[0];
        match &msg.content[0] {
            ContentPart::Reasoning { thought_signature, .. } => {
                assert_eq!(
                    thought_signature.as_deref(),
                    Some("c2lnLWJ5dGVzLW9wYXF1ZS12YWx1ZQ==")
                );
            }
            other => panic!("expected reasoning, got {other:?}"),
        }
    }

    #[test]
    fn chunk_with_function_call_finishes_with_tool_calls() {
        let chunk = br#"{
            "candidates": [{"content":{"role":"model","parts":[
                {"functionCall":{"name":"f","args":{"a":1}}}
            ]},"finishReason":"STOP"}]
        }"#;
        let events = GeminiParser.parse_chunk(chunk).unwrap();
        assert!(matches!(&events[0], UnifiedEvent::ToolCallStart { name, .. } if name == "f"));
        assert!(matches!(
            events.last().unwrap(),
            UnifiedEvent::Finish { reason: FinishReason::ToolCalls }
        ));
    }

    #[test]
    fn unknown_parts_round_trip_as_opaque() {
        let body = br#"{
            "contents": [{"role":"user","parts":[{"mysteryField":{"a":1}}]}]
        }"#;
        let req = GeminiParser.parse_request(body).unwrap();
        assert!(matches!(
            &req.messages[0].content[0],
            ContentPart::Opaque { .. }
        ));
    }
}
