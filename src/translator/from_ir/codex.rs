// IR -> OpenAI Responses API (Codex upstream and openai-response clients).

use serde_json::{json, Value};

use super::sse_event;
use crate::error::ProxyError;
use crate::ir::{
    self, CandidateResult, ContentPart, DeltaKind, Message, Role, UnifiedChatRequest,
    UnifiedEvent, Usage,
};
use crate::translator::{first_candidate, EmitContext, FromIrEmitter};

pub struct CodexEmitter;

impl FromIrEmitter for CodexEmitter {
    fn request(&self, req: &UnifiedChatRequest) -> Result<Vec<u8>, ProxyError> {
        let mut body = json!({
            "model": req.model,
            "instructions": "",
            "input": [],
            "store": false,
            "stream": req.stream,
            "parallel_tool_calls": true,
            "include": ["reasoning.encrypted_content"],
            "reasoning": { "effort": "medium", "summary": "auto" },
        });

        if let Some(reasoning) = &req.reasoning {
            if let Some(effort) = &reasoning.effort {
                body["reasoning"]["effort"] = json!(effort);
            }
        }
        if let Some(m) = req.max_tokens {
            body["max_output_tokens"] = json!(m);
        }
        if let Some(format) = &req.response_format {
            body["text"] = json!({ "format": format });
        }

        let mut instructions: Vec<String> = Vec::new();
        let input = body["input"].as_array_mut().expect("input array");
        for msg in &req.messages {
            match msg.role {
                Role::System => {
                    let text = msg.combined_text();
                    if !text.is_empty() {
                        instructions.push(text);
                    }
                }
                Role::Tool => {
                    input.push(json!({
                        "type": "function_call_output",
                        "call_id": msg
                            .tool_call_id
                            .as_deref()
                            .map(ir::to_openai_tool_id)
                            .unwrap_or_default(),
                        "output": msg.combined_text(),
                    }));
                }
                role => {
                    let part_type = if role == Role::Assistant {
                        "output_text"
                    } else {
                        "input_text"
                    };
                    let mut content = Vec::new();
                    for part in &msg.content {
                        match part {
                            ContentPart::Text { text } => {
                                if !text.is_empty() {
                                    content.push(json!({ "type": part_type, "text": text }));
                                }
                            }
                            ContentPart::Image { image } if role == Role::User => {
                                let url = if !image.data.is_empty() {
                                    format!("data:{};base64,{}", image.mime_type, image.data)
                                } else {
                                    image.url.clone()
                                };
                                if !url.is_empty() {
                                    content.push(json!({ "type": "input_image", "image_url": url }));
                                }
                            }
                            _ => {}
                        }
                    }
                    if !content.is_empty() {
                        input.push(json!({
                            "type": "message",
                            "role": role.as_str(),
                            "content": content,
                        }));
                    }
                    for tc in &msg.tool_calls {
                        input.push(json!({
                            "type": "function_call",
                            "call_id": ir::to_openai_tool_id(&tc.id),
                            "name": tc.name,
                            "arguments": tc.args,
                        }));
                    }
                }
            }
        }
        if !instructions.is_empty() {
            body["instructions"] = json!(instructions.join("\n\n"));
        }

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                        "strict": false,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        Ok(body.to_string().into_bytes())
    }

    fn response(
        &self,
        candidates: &[CandidateResult],
        usage: &Usage,
        model: &str,
        message_id: &str,
    ) -> Result<Vec<u8>, ProxyError> {
        let messages = first_candidate(candidates);
        let message = messages.last();
        let mut output = Vec::new();

        if let Some(message) = message {
            let reasoning = message.combined_reasoning();
            if !reasoning.is_empty() {
                output.push(json!({
                    "type": "reasoning",
                    "id": format!("rs_{message_id}"),
                    "summary": [{ "type": "summary_text", "text": reasoning }],
                }));
            }
            let text = message.combined_text();
            if !text.is_empty() {
                output.push(json!({
                    "type": "message",
                    "id": format!("msg_{message_id}"),
                    "role": "assistant",
                    "status": "completed",
                    "content": [{ "type": "output_text", "text": text, "annotations": [] }],
                }));
            }
            for tc in &message.tool_calls {
                output.push(json!({
                    "type": "function_call",
                    "id": format!("fc_{message_id}"),
                    "call_id": ir::to_openai_tool_id(&tc.id),
                    "name": tc.name,
                    "arguments": tc.args,
                    "status": "completed",
                }));
            }
        }

        let body = json!({
            "id": format!("resp_{message_id}"),
            "object": "response",
            "created_at": chrono::Utc::now().timestamp(),
            "status": "completed",
            "model": model,
            "output": output,
            "usage": build_usage(usage),
        });
        Ok(body.to_string().into_bytes())
    }

    fn chunk(&self, event: &UnifiedEvent, ctx: &mut EmitContext) -> Result<Vec<u8>, ProxyError> {
        match event {
            UnifiedEvent::MessageStart { id, model } => {
                if let Some(id) = id {
                    ctx.message_id = id.clone();
                }
                if let Some(model) = model {
                    ctx.model = model.clone();
                }
                ctx.message_started = true;
                Ok(sse_event(
                    "response.created",
                    &json!({
                        "type": "response.created",
                        "response": {
                            "id": format!("resp_{}", ctx.message_id),
                            "object": "response",
                            "status": "in_progress",
                            "model": ctx.model,
                        }
                    }),
                ))
            }
            UnifiedEvent::ContentDelta { index, kind, text, .. } => match kind {
                DeltaKind::Text => Ok(sse_event(
                    "response.output_text.delta",
                    &json!({
                        "type": "response.output_text.delta",
                        "output_index": index,
                        "delta": text,
                    }),
                )),
                DeltaKind::Reasoning => Ok(sse_event(
                    "response.reasoning_summary_text.delta",
                    &json!({
                        "type": "response.reasoning_summary_text.delta",
                        "output_index": index,
                        "delta": text,
                    }),
                )),
                DeltaKind::ToolArgs => Ok(sse_event(
                    "response.function_call_arguments.delta",
                    &json!({
                        "type": "response.function_call_arguments.delta",
                        "output_index": index,
                        "delta": text,
                    }),
                )),
            },
            UnifiedEvent::ToolCallStart { index, id, name } => {
                ctx.saw_tool_call = true;
                Ok(sse_event(
                    "response.output_item.added",
                    &json!({
                        "type": "response.output_item.added",
                        "output_index": index,
                        "item": {
                            "type": "function_call",
                            "call_id": ir::to_openai_tool_id(id),
                            "name": name,
                            "arguments": "",
                        }
                    }),
                ))
            }
            UnifiedEvent::ToolCallEnd { index } => Ok(sse_event(
                "response.output_item.done",
                &json!({
                    "type": "response.output_item.done",
                    "output_index": index,
                    "item": { "type": "function_call", "status": "completed" },
                }),
            )),
            UnifiedEvent::Usage { usage } => {
                ctx.last_usage.merge(usage);
                Ok(Vec::new())
            }
            UnifiedEvent::Finish { .. } => {
                let mut out = sse_event(
                    "response.completed",
                    &json!({
                        "type": "response.completed",
                        "response": {
                            "id": format!("resp_{}", ctx.message_id),
                            "object": "response",
                            "status": "completed",
                            "model": ctx.model,
                            "usage": build_usage(&ctx.last_usage),
                        }
                    }),
                );
                out.extend_from_slice(b"data: [DONE]\n\n");
                Ok(out)
            }
        }
    }

    fn provider(&self) -> &'static str {
        "codex"
    }
}

fn build_usage(usage: &Usage) -> Value {
    let mut body = json!({
        "input_tokens": usage.prompt_tokens,
        "output_tokens": usage.completion_tokens,
        "total_tokens": usage.total_tokens,
    });
    if usage.reasoning_tokens > 0 {
        body["output_tokens_details"] = json!({ "reasoning_tokens": usage.reasoning_tokens });
    }
    if usage.cached_tokens > 0 {
        body["input_tokens_details"] = json!({ "cached_tokens": usage.cached_tokens });
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FinishReason, ToolCall};

    #[test]
    fn request_builds_input_items() {
        let mut assistant = Message::new(Role::Assistant);
        assistant.tool_calls.push(ToolCall {
            id: "toolu_1".to_string(),
            name: "f".to_string(),
            args: "{\"x\":1}".to_string(),
        });
        let mut tool = Message::new(Role::Tool);
        tool.tool_call_id = Some("toolu_1".to_string());
        tool.content.push(ContentPart::text("42"));

        let req = UnifiedChatRequest {
            model: "gpt-5-codex".to_string(),
            messages: vec![
                Message::text(Role::System, "you are codex"),
                Message::text(Role::User, "run it"),
                assistant,
                tool,
            ],
            stream: true,
            ..Default::default()
        };
        let body: Value =
            serde_json::from_slice(&CodexEmitter.request(&req).unwrap()).unwrap();
        assert_eq!(body["instructions"], "you are codex");
        assert_eq!(body["store"], false);
        assert_eq!(body["input"][0]["content"][0]["type"], "input_text");
        assert_eq!(body["input"][1]["type"], "function_call");
        assert_eq!(body["input"][1]["call_id"], "call_1");
        assert_eq!(body["input"][2]["type"], "function_call_output");
        assert_eq!(body["input"][2]["call_id"], "call_1");
    }

    #[test]
    fn response_orders_reasoning_message_calls() {
        let mut message = Message::new(Role::Assistant);
        message.content.push(ContentPart::reasoning("hmm", None));
        message.content.push(ContentPart::text("done"));
        message.tool_calls.push(ToolCall {
            id: "call_2".to_string(),
            name: "g".to_string(),
            args: "{}".to_string(),
        });
        let candidates = vec![CandidateResult {
            index: 0,
            messages: vec![message],
            finish_reason: FinishReason::ToolCalls,
        }];
        let body: Value = serde_json::from_slice(
            &CodexEmitter
                .response(&candidates, &Usage::default(), "gpt-5", "x")
                .unwrap(),
        )
        .unwrap();
        assert_eq!(body["output"][0]["type"], "reasoning");
        assert_eq!(body["output"][1]["type"], "message");
        assert_eq!(body["output"][2]["type"], "function_call");
    }

    #[test]
    fn finish_emits_completed_then_done() {
        let mut ctx = EmitContext::new("r9", "gpt-5");
        let bytes = CodexEmitter
            .chunk(
                &UnifiedEvent::Finish {
                    reason: FinishReason::Stop,
                },
                &mut ctx,
            )
            .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("event: response.completed\n"));
        assert!(text.ends_with("data: [DONE]\n\n"));
    }
}
