// IR -> Anthropic Messages.

use serde_json::{json, Value};

use super::sse_event;
use crate::error::ProxyError;
use crate::ir::{
    self, CandidateResult, ContentPart, DeltaKind, Message, Role, UnifiedChatRequest,
    UnifiedEvent, Usage,
};
use crate::translator::{first_candidate, EmitContext, FromIrEmitter};

pub struct ClaudeEmitter;

impl FromIrEmitter for ClaudeEmitter {
    fn request(&self, req: &UnifiedChatRequest) -> Result<Vec<u8>, ProxyError> {
        let mut body = json!({
            "model": req.model,
            // Anthropic requires max_tokens; 4096 mirrors the CLI default.
            "max_tokens": req.max_tokens.unwrap_or(4096),
        });

        let mut system_parts: Vec<String> = Vec::new();
        let mut messages: Vec<Value> = Vec::new();
        for msg in &req.messages {
            match msg.role {
                Role::System => {
                    let text = msg.combined_text();
                    if !text.is_empty() {
                        system_parts.push(text);
                    }
                }
                Role::Tool => {
                    messages.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": msg
                                .tool_call_id
                                .as_deref()
                                .map(ir::to_claude_tool_id)
                                .unwrap_or_default(),
                            "content": msg.combined_text(),
                        }],
                    }));
                }
                role => {
                    let blocks = build_content_blocks(msg);
                    if !blocks.is_empty() {
                        messages.push(json!({
                            "role": if role == Role::Assistant { "assistant" } else { "user" },
                            "content": blocks,
                        }));
                    }
                }
            }
        }
        if !system_parts.is_empty() {
            body["system"] = json!(system_parts.join("\n\n"));
        }
        body["messages"] = json!(messages);

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        if let Some(choice) = &req.tool_choice {
            body["tool_choice"] = choice.clone();
        }
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = req.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(k) = req.top_k {
            body["top_k"] = json!(k);
        }
        if !req.stop.is_empty() {
            body["stop_sequences"] = json!(req.stop);
        }
        if let Some(reasoning) = &req.reasoning {
            if reasoning.include_thoughts || reasoning.budget_tokens.is_some() {
                body["thinking"] = json!({
                    "type": "enabled",
                    "budget_tokens": reasoning.budget_tokens.unwrap_or(1024),
                });
            }
        }
        if req.stream {
            body["stream"] = json!(true);
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
        let mut content = Vec::new();
        if let Some(message) = message {
            for part in &message.content {
                match part {
                    ContentPart::Reasoning { text, thought_signature } => {
                        let mut block = json!({ "type": "thinking", "thinking": text });
                        if let Some(sig) = thought_signature {
                            block["signature"] = json!(sig);
                        }
                        content.push(block);
                    }
                    ContentPart::Text { text } => {
                        if !text.is_empty() {
                            content.push(json!({ "type": "text", "text": text }));
                        }
                    }
                    _ => {}
                }
            }
            for tc in &message.tool_calls {
                content.push(json!({
                    "type": "tool_use",
                    "id": ir::to_claude_tool_id(&tc.id),
                    "name": tc.name,
                    "input": ir::parse_tool_args(&tc.args),
                }));
            }
        }

        let stop_reason = candidates
            .first()
            .map(|c| c.finish_reason.as_claude())
            .unwrap_or("end_turn");

        let body = json!({
            "id": format!("msg_{message_id}"),
            "type": "message",
            "role": "assistant",
            "model": model,
            "content": content,
            "stop_reason": stop_reason,
            "stop_sequence": Value::Null,
            "usage": build_usage(usage),
        });
        Ok(body.to_string().into_bytes())
    }

    fn chunk(&self, event: &UnifiedEvent, ctx: &mut EmitContext) -> Result<Vec<u8>, ProxyError> {
        let mut out = Vec::new();

        match event {
            UnifiedEvent::MessageStart { id, model } => {
                if let Some(id) = id {
                    ctx.message_id = id.clone();
                }
                if let Some(model) = model {
                    ctx.model = model.clone();
                }
                ctx.message_started = true;
                out.extend(sse_event(
                    "message_start",
                    &json!({
                        "type": "message_start",
                        "message": {
                            "id": format!("msg_{}", ctx.message_id),
                            "type": "message",
                            "role": "assistant",
                            "model": ctx.model,
                            "content": [],
                            "stop_reason": Value::Null,
                            "usage": { "input_tokens": 0, "output_tokens": 0 },
                        }
                    }),
                ));
            }
            UnifiedEvent::ContentDelta { kind, text, thought_signature, .. } => {
                self.ensure_message_start(ctx, &mut out);
                if ctx.block_kind != Some(*kind) {
                    self.close_block(ctx, &mut out);
                    // Tool-arg deltas extend the block the ToolCallStart
                    // opened; text and thinking open their own.
                    if *kind != DeltaKind::ToolArgs {
                        let block = match kind {
                            DeltaKind::Reasoning => json!({ "type": "thinking", "thinking": "" }),
                            _ => json!({ "type": "text", "text": "" }),
                        };
                        out.extend(sse_event(
                            "content_block_start",
                            &json!({
                                "type": "content_block_start",
                                "index": ctx.block_index,
                                "content_block": block,
                            }),
                        ));
                        ctx.block_open = true;
                        ctx.block_kind = Some(*kind);
                    }
                }
                let delta = match kind {
                    DeltaKind::Text => json!({ "type": "text_delta", "text": text }),
                    DeltaKind::Reasoning => {
                        if let Some(sig) = thought_signature {
                            json!({ "type": "signature_delta", "signature": sig })
                        } else {
                            json!({ "type": "thinking_delta", "thinking": text })
                        }
                    }
                    DeltaKind::ToolArgs => json!({ "type": "input_json_delta", "partial_json": text }),
                };
                out.extend(sse_event(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": ctx.block_index,
                        "delta": delta,
                    }),
                ));
            }
            UnifiedEvent::ToolCallStart { id, name, .. } => {
                self.ensure_message_start(ctx, &mut out);
                self.close_block(ctx, &mut out);
                ctx.saw_tool_call = true;
                out.extend(sse_event(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": ctx.block_index,
                        "content_block": {
                            "type": "tool_use",
                            "id": ir::to_claude_tool_id(id),
                            "name": name,
                            "input": {},
                        }
                    }),
                ));
                ctx.block_open = true;
                ctx.block_kind = Some(DeltaKind::ToolArgs);
            }
            UnifiedEvent::ToolCallEnd { .. } => {
                self.close_block(ctx, &mut out);
            }
            UnifiedEvent::Usage { usage } => {
                ctx.last_usage.merge(usage);
            }
            UnifiedEvent::Finish { reason } => {
                self.close_block(ctx, &mut out);
                out.extend(sse_event(
                    "message_delta",
                    &json!({
                        "type": "message_delta",
                        "delta": { "stop_reason": reason.as_claude(), "stop_sequence": Value::Null },
                        "usage": { "output_tokens": ctx.last_usage.completion_tokens },
                    }),
                ));
                out.extend(sse_event(
                    "message_stop",
                    &json!({ "type": "message_stop" }),
                ));
            }
        }

        Ok(out)
    }

    fn provider(&self) -> &'static str {
        "claude"
    }
}

impl ClaudeEmitter {
    /// Upstreams that never emit a start event still need one on this side.
    fn ensure_message_start(&self, ctx: &mut EmitContext, out: &mut Vec<u8>) {
        if ctx.message_started {
            return;
        }
        ctx.message_started = true;
        out.extend(sse_event(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": format!("msg_{}", ctx.message_id),
                    "type": "message",
                    "role": "assistant",
                    "model": ctx.model,
                    "content": [],
                    "stop_reason": Value::Null,
                    "usage": { "input_tokens": 0, "output_tokens": 0 },
                }
            }),
        ));
    }

    fn close_block(&self, ctx: &mut EmitContext, out: &mut Vec<u8>) {
        if !ctx.block_open {
            return;
        }
        out.extend(sse_event(
            "content_block_stop",
            &json!({ "type": "content_block_stop", "index": ctx.block_index }),
        ));
        ctx.block_open = false;
        ctx.block_kind = None;
        ctx.block_index += 1;
    }
}

fn build_content_blocks(msg: &Message) -> Vec<Value> {
    let mut blocks = Vec::new();
    for part in &msg.content {
        match part {
            ContentPart::Text { text } => {
                if !text.is_empty() {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
            }
            ContentPart::Reasoning { text, thought_signature } => {
                let mut block = json!({ "type": "thinking", "thinking": text });
                if let Some(sig) = thought_signature {
                    block["signature"] = json!(sig);
                }
                blocks.push(block);
            }
            ContentPart::Image { image } => {
                if !image.data.is_empty() {
                    blocks.push(json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": image.mime_type,
                            "data": image.data,
                        }
                    }));
                } else if !image.url.is_empty() && !ir::is_file_reference(&image.url) {
                    blocks.push(json!({
                        "type": "image",
                        "source": { "type": "url", "url": image.url }
                    }));
                }
            }
            _ => {}
        }
    }
    for tc in &msg.tool_calls {
        blocks.push(json!({
            "type": "tool_use",
            "id": ir::to_claude_tool_id(&tc.id),
            "name": tc.name,
            "input": ir::parse_tool_args(&tc.args),
        }));
    }
    blocks
}

fn build_usage(usage: &Usage) -> Value {
    let mut body = json!({
        "input_tokens": usage.prompt_tokens,
        "output_tokens": usage.completion_tokens,
    });
    if usage.cache_creation_tokens > 0 {
        body["cache_creation_input_tokens"] = json!(usage.cache_creation_tokens);
    }
    if usage.cache_read_tokens > 0 {
        body["cache_read_input_tokens"] = json!(usage.cache_read_tokens);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FinishReason, ToolCall, ToolDefinition};

    #[test]
    fn system_messages_become_system_field() {
        let req = UnifiedChatRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages: vec![
                Message::text(Role::System, "be brief"),
                Message::text(Role::User, "hi"),
            ],
            ..Default::default()
        };
        let body: Value =
            serde_json::from_slice(&ClaudeEmitter.request(&req).unwrap()).unwrap();
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["max_tokens"], 4096);
    }

    #[test]
    fn tool_result_ids_rewritten_to_claude_namespace() {
        let mut assistant = Message::new(Role::Assistant);
        assistant.tool_calls.push(ToolCall {
            id: "call_A".to_string(),
            name: "f".to_string(),
            args: "{\"x\":1}".to_string(),
        });
        let mut tool = Message::new(Role::Tool);
        tool.tool_call_id = Some("call_A".to_string());
        tool.content.push(ContentPart::text("result"));

        let req = UnifiedChatRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages: vec![assistant, tool],
            tools: vec![ToolDefinition {
                name: "f".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let body: Value =
            serde_json::from_slice(&ClaudeEmitter.request(&req).unwrap()).unwrap();
        assert_eq!(body["messages"][0]["content"][0]["id"], "toolu_A");
        assert_eq!(
            body["messages"][1]["content"][0]["tool_use_id"],
            "toolu_A"
        );
        assert_eq!(body["messages"][0]["content"][0]["input"]["x"], 1);
    }

    #[test]
    fn stream_emits_block_lifecycle() {
        let mut ctx = EmitContext::new("m1", "claude-sonnet-4-5");
        let mut all = Vec::new();
        all.extend(
            ClaudeEmitter
                .chunk(
                    &UnifiedEvent::ContentDelta {
                        index: 0,
                        kind: DeltaKind::Text,
                        text: "hel".to_string(),
                        thought_signature: None,
                    },
                    &mut ctx,
                )
                .unwrap(),
        );
        all.extend(
            ClaudeEmitter
                .chunk(
                    &UnifiedEvent::Finish {
                        reason: FinishReason::Stop,
                    },
                    &mut ctx,
                )
                .unwrap(),
        );
        let text = String::from_utf8(all).unwrap();
        // Implicit message_start precedes the first block.
        let start_pos = text.find("event: message_start").unwrap();
        let block_pos = text.find("event: content_block_start").unwrap();
        let delta_pos = text.find("event: content_block_delta").unwrap();
        let stop_pos = text.find("event: content_block_stop").unwrap();
        let end_pos = text.find("event: message_stop").unwrap();
        assert!(start_pos < block_pos && block_pos < delta_pos);
        assert!(delta_pos < stop_pos && stop_pos < end_pos);
        assert!(text.contains("\"stop_reason\":\"end_turn\""));
    }

    #[test]
    fn tool_call_stream_uses_input_json_delta() {
        let mut ctx = EmitContext::new("m1", "claude-sonnet-4-5");
        ctx.message_started = true;
        let mut all = Vec::new();
        all.extend(
            ClaudeEmitter
                .chunk(
                    &UnifiedEvent::ToolCallStart {
                        index: 0,
                        id: "call_9".to_string(),
                        name: "f".to_string(),
                    },
                    &mut ctx,
                )
                .unwrap(),
        );
        all.extend(
            ClaudeEmitter
                .chunk(
                    &UnifiedEvent::ContentDelta {
                        index: 0,
                        kind: DeltaKind::ToolArgs,
                        text: "{\"x\":1}".to_string(),
                        thought_signature: None,
                    },
                    &mut ctx,
                )
                .unwrap(),
        );
        let text = String::from_utf8(all).unwrap();
        assert!(text.contains("\"id\":\"toolu_9\""));
        assert!(text.contains("input_json_delta"));
    }
}
