// IR -> OpenAI Chat Completions.

use serde_json::{json, Map, Value};

use super::sse_data;
use crate::error::ProxyError;
use crate::ir::{
    self, CandidateResult, ContentPart, DeltaKind, Message, Role, UnifiedChatRequest,
    UnifiedEvent, Usage,
};
use crate::translator::{EmitContext, FromIrEmitter};

pub struct OpenAIEmitter;

impl FromIrEmitter for OpenAIEmitter {
    fn request(&self, req: &UnifiedChatRequest) -> Result<Vec<u8>, ProxyError> {
        let mut body = json!({
            "model": req.model,
            "messages": build_messages(&req.messages),
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
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
        if let Some(m) = req.max_tokens {
            body["max_tokens"] = json!(m);
        }
        if !req.stop.is_empty() {
            body["stop"] = json!(req.stop);
        }
        if let Some(n) = req.n {
            body["n"] = json!(n);
        }
        if let Some(seed) = req.seed {
            body["seed"] = json!(seed);
        }
        if let Some(reasoning) = &req.reasoning {
            if let Some(effort) = &reasoning.effort {
                body["reasoning_effort"] = json!(effort);
            }
        }
        if let Some(format) = &req.response_format {
            body["response_format"] = format.clone();
        }
        if req.stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
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
        let mut choices = Vec::new();
        for candidate in candidates {
            let Some(message) = candidate.messages.last() else {
                continue;
            };
            let mut body = json!({
                "role": "assistant",
                "content": message.combined_text(),
            });
            let reasoning = message.combined_reasoning();
            if !reasoning.is_empty() {
                body["reasoning_content"] = json!(reasoning);
            }
            if !message.tool_calls.is_empty() {
                body["tool_calls"] = json!(build_tool_calls(message));
            }
            choices.push(json!({
                "index": candidate.index,
                "message": body,
                "finish_reason": candidate.finish_reason.as_openai(),
            }));
        }

        let body = json!({
            "id": format!("chatcmpl-{message_id}"),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": model,
            "choices": choices,
            "usage": build_usage(usage),
        });
        Ok(body.to_string().into_bytes())
    }

    fn chunk(&self, event: &UnifiedEvent, ctx: &mut EmitContext) -> Result<Vec<u8>, ProxyError> {
        let mut delta = Map::new();
        let mut finish_reason = Value::Null;
        let mut usage_field: Option<Value> = None;

        match event {
            UnifiedEvent::MessageStart { id, model } => {
                if let Some(id) = id {
                    ctx.message_id = id.clone();
                }
                if let Some(model) = model {
                    ctx.model = model.clone();
                }
                ctx.message_started = true;
                delta.insert("role".to_string(), json!("assistant"));
            }
            UnifiedEvent::ContentDelta { index, kind, text, .. } => match kind {
                DeltaKind::Text => {
                    delta.insert("content".to_string(), json!(text));
                }
                DeltaKind::Reasoning => {
                    if text.is_empty() {
                        return Ok(Vec::new());
                    }
                    delta.insert("reasoning_content".to_string(), json!(text));
                }
                DeltaKind::ToolArgs => {
                    delta.insert(
                        "tool_calls".to_string(),
                        json!([{
                            "index": index,
                            "function": { "arguments": text }
                        }]),
                    );
                }
            },
            UnifiedEvent::ToolCallStart { index, id, name } => {
                ctx.saw_tool_call = true;
                delta.insert(
                    "tool_calls".to_string(),
                    json!([{
                        "index": index,
                        "id": ir::to_openai_tool_id(id),
                        "type": "function",
                        "function": { "name": name, "arguments": "" }
                    }]),
                );
            }
            UnifiedEvent::ToolCallEnd { .. } => return Ok(Vec::new()),
            UnifiedEvent::Usage { usage } => {
                ctx.last_usage.merge(usage);
                usage_field = Some(build_usage(&ctx.last_usage));
            }
            UnifiedEvent::Finish { reason } => {
                finish_reason = json!(reason.as_openai());
            }
        }

        let mut chunk = json!({
            "id": format!("chatcmpl-{}", ctx.message_id),
            "object": "chat.completion.chunk",
            "created": ctx.created,
            "model": ctx.model,
            "choices": [{
                "index": 0,
                "delta": Value::Object(delta),
                "finish_reason": finish_reason,
            }],
        });
        if let Some(usage) = usage_field {
            chunk["usage"] = usage;
        }

        let mut out = sse_data(&chunk);
        if matches!(event, UnifiedEvent::Finish { .. }) {
            out.extend_from_slice(b"data: [DONE]\n\n");
        }
        Ok(out)
    }

    fn provider(&self) -> &'static str {
        "openai"
    }
}

fn build_messages(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len());
    for msg in messages {
        match msg.role {
            Role::Tool => {
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": msg
                        .tool_call_id
                        .as_deref()
                        .map(ir::to_openai_tool_id)
                        .unwrap_or_default(),
                    "content": msg.combined_text(),
                }));
            }
            role => {
                let mut body = json!({ "role": role.as_str() });
                body["content"] = build_content(msg);
                if !msg.tool_calls.is_empty() {
                    body["tool_calls"] = json!(build_tool_calls(msg));
                }
                out.push(body);
            }
        }
    }
    out
}

fn build_content(msg: &Message) -> Value {
    let has_media = msg
        .content
        .iter()
        .any(|p| matches!(p, ContentPart::Image { .. } | ContentPart::Audio { .. }));
    if !has_media {
        return json!(msg.combined_text());
    }

    let mut parts = Vec::new();
    for part in &msg.content {
        match part {
            ContentPart::Text { text } => {
                parts.push(json!({ "type": "text", "text": text }));
            }
            ContentPart::Image { image } => {
                let url = if !image.data.is_empty() {
                    format!("data:{};base64,{}", image.mime_type, image.data)
                } else {
                    image.url.clone()
                };
                parts.push(json!({ "type": "image_url", "image_url": { "url": url } }));
            }
            ContentPart::Audio { audio } => {
                parts.push(json!({
                    "type": "input_audio",
                    "input_audio": {
                        "data": audio.data,
                        "format": audio.mime_type.strip_prefix("audio/").unwrap_or("wav"),
                    }
                }));
            }
            _ => {}
        }
    }
    json!(parts)
}

fn build_tool_calls(msg: &Message) -> Vec<Value> {
    msg.tool_calls
        .iter()
        .map(|tc| {
            json!({
                "id": ir::to_openai_tool_id(&tc.id),
                "type": "function",
                "function": { "name": tc.name, "arguments": tc.args },
            })
        })
        .collect()
}

pub(crate) fn build_usage(usage: &Usage) -> Value {
    let mut body = json!({
        "prompt_tokens": usage.prompt_tokens,
        "completion_tokens": usage.completion_tokens,
        "total_tokens": usage.total_tokens,
    });
    if usage.reasoning_tokens > 0 || usage.audio_tokens > 0 {
        body["completion_tokens_details"] = json!({
            "reasoning_tokens": usage.reasoning_tokens,
            "audio_tokens": usage.audio_tokens,
        });
    }
    if usage.cached_tokens > 0 {
        body["prompt_tokens_details"] = json!({ "cached_tokens": usage.cached_tokens });
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FinishReason, ToolCall};

    fn sample_request() -> UnifiedChatRequest {
        UnifiedChatRequest {
            model: "gpt-5".to_string(),
            messages: vec![Message::text(Role::User, "hi")],
            temperature: Some(0.3),
            max_tokens: Some(64),
            ..Default::default()
        }
    }

    #[test]
    fn request_round_trips_core_fields() {
        let bytes = OpenAIEmitter.request(&sample_request()).unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["model"], "gpt-5");
        assert_eq!(body["messages"][0]["content"], "hi");
        assert_eq!(body["temperature"], 0.3);
        assert_eq!(body["max_tokens"], 64);
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn tool_ids_are_rewritten_to_openai_namespace() {
        let mut msg = Message::new(Role::Assistant);
        msg.tool_calls.push(ToolCall {
            id: "toolu_abc".to_string(),
            name: "f".to_string(),
            args: "{}".to_string(),
        });
        let mut tool = Message::new(Role::Tool);
        tool.tool_call_id = Some("toolu_abc".to_string());
        tool.content.push(ContentPart::text("42"));

        let req = UnifiedChatRequest {
            model: "gpt-5".to_string(),
            messages: vec![msg, tool],
            ..Default::default()
        };
        let body: Value =
            serde_json::from_slice(&OpenAIEmitter.request(&req).unwrap()).unwrap();
        assert_eq!(body["messages"][0]["tool_calls"][0]["id"], "call_abc");
        assert_eq!(body["messages"][1]["tool_call_id"], "call_abc");
    }

    #[test]
    fn response_carries_usage_and_finish() {
        let mut message = Message::new(Role::Assistant);
        message.content.push(ContentPart::text("hello"));
        let candidates = vec![CandidateResult {
            index: 0,
            messages: vec![message],
            finish_reason: FinishReason::Stop,
        }];
        let usage = Usage {
            prompt_tokens: 1,
            completion_tokens: 1,
            total_tokens: 2,
            ..Default::default()
        };
        let bytes = OpenAIEmitter
            .response(&candidates, &usage, "gemini-2.5-flash", "req1")
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], "hello");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(body["usage"]["total_tokens"], 2);
    }

    #[test]
    fn finish_chunk_is_followed_by_done() {
        let mut ctx = EmitContext::new("id1", "gpt-5");
        let bytes = OpenAIEmitter
            .chunk(
                &UnifiedEvent::Finish {
                    reason: FinishReason::Stop,
                },
                &mut ctx,
            )
            .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"finish_reason\":\"stop\""));
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[test]
    fn text_delta_chunk_shape() {
        let mut ctx = EmitContext::new("id1", "gpt-5");
        let bytes = OpenAIEmitter
            .chunk(
                &UnifiedEvent::ContentDelta {
                    index: 0,
                    kind: DeltaKind::Text,
                    text: "he".to_string(),
                    thought_signature: None,
                },
                &mut ctx,
            )
            .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let json_part = text.trim_start_matches("data: ").trim();
        let chunk: Value = serde_json::from_str(json_part).unwrap();
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert_eq!(chunk["choices"][0]["delta"]["content"], "he");
    }
}
