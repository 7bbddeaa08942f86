// IR -> Ollama /api/chat. Streaming is newline-delimited JSON, no SSE
// prefix.

use serde_json::{json, Map, Value};

use crate::error::ProxyError;
use crate::ir::{
    self, CandidateResult, ContentPart, DeltaKind, Message, Role, UnifiedChatRequest,
    UnifiedEvent, Usage,
};
use crate::translator::{first_candidate, EmitContext, FromIrEmitter};

pub struct OllamaEmitter;

impl FromIrEmitter for OllamaEmitter {
    fn request(&self, req: &UnifiedChatRequest) -> Result<Vec<u8>, ProxyError> {
        let mut messages = Vec::new();
        for msg in &req.messages {
            let mut body = json!({
                "role": msg.role.as_str(),
                "content": msg.combined_text(),
            });
            let images: Vec<String> = msg
                .content
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Image { image } if !image.data.is_empty() => {
                        Some(image.data.clone())
                    }
                    _ => None,
                })
                .collect();
            if !images.is_empty() {
                body["images"] = json!(images);
            }
            if !msg.tool_calls.is_empty() {
                let calls: Vec<Value> = msg
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "function": {
                                "name": tc.name,
                                "arguments": ir::parse_tool_args(&tc.args),
                            }
                        })
                    })
                    .collect();
                body["tool_calls"] = json!(calls);
            }
            messages.push(body);
        }

        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "stream": req.stream,
        });

        let mut options = Map::new();
        if let Some(t) = req.temperature {
            options.insert("temperature".to_string(), json!(t));
        }
        if let Some(p) = req.top_p {
            options.insert("top_p".to_string(), json!(p));
        }
        if let Some(k) = req.top_k {
            options.insert("top_k".to_string(), json!(k));
        }
        if let Some(m) = req.max_tokens {
            options.insert("num_predict".to_string(), json!(m));
        }
        if let Some(seed) = req.seed {
            options.insert("seed".to_string(), json!(seed));
        }
        if !req.stop.is_empty() {
            options.insert("stop".to_string(), json!(req.stop));
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }

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

        Ok(body.to_string().into_bytes())
    }

    fn response(
        &self,
        candidates: &[CandidateResult],
        usage: &Usage,
        model: &str,
        _message_id: &str,
    ) -> Result<Vec<u8>, ProxyError> {
        let messages = first_candidate(candidates);
        let message = messages.last();
        let mut body_message = json!({
            "role": "assistant",
            "content": message.map(|m| m.combined_text()).unwrap_or_default(),
        });
        if let Some(message) = message {
            if !message.tool_calls.is_empty() {
                let calls: Vec<Value> = message
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "function": {
                                "name": tc.name,
                                "arguments": ir::parse_tool_args(&tc.args),
                            }
                        })
                    })
                    .collect();
                body_message["tool_calls"] = json!(calls);
            }
        }

        let done_reason = candidates
            .first()
            .map(|c| match c.finish_reason {
                ir::FinishReason::Length => "length",
                _ => "stop",
            })
            .unwrap_or("stop");

        let body = json!({
            "model": model,
            "created_at": chrono::Utc::now().to_rfc3339(),
            "message": body_message,
            "done": true,
            "done_reason": done_reason,
            "prompt_eval_count": usage.prompt_tokens,
            "eval_count": usage.completion_tokens,
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
                Ok(Vec::new())
            }
            UnifiedEvent::ContentDelta { kind, text, .. } => match kind {
                DeltaKind::Text => Ok(ndjson(&json!({
                    "model": ctx.model,
                    "created_at": chrono::Utc::now().to_rfc3339(),
                    "message": { "role": "assistant", "content": text },
                    "done": false,
                }))),
                // Ollama has no reasoning channel; args buffer like Gemini's.
                DeltaKind::Reasoning => Ok(Vec::new()),
                DeltaKind::ToolArgs => {
                    ctx.pending_args.push_str(text);
                    Ok(Vec::new())
                }
            },
            UnifiedEvent::ToolCallStart { id, name, .. } => {
                ctx.saw_tool_call = true;
                ctx.pending_tool = Some((id.clone(), name.clone()));
                ctx.pending_args.clear();
                Ok(Vec::new())
            }
            UnifiedEvent::ToolCallEnd { .. } => Ok(self.flush_tool(ctx)),
            UnifiedEvent::Usage { usage } => {
                ctx.last_usage.merge(usage);
                Ok(Vec::new())
            }
            UnifiedEvent::Finish { reason } => {
                let mut out = self.flush_tool(ctx);
                out.extend(ndjson(&json!({
                    "model": ctx.model,
                    "created_at": chrono::Utc::now().to_rfc3339(),
                    "message": { "role": "assistant", "content": "" },
                    "done": true,
                    "done_reason": match reason {
                        ir::FinishReason::Length => "length",
                        _ => "stop",
                    },
                    "prompt_eval_count": ctx.last_usage.prompt_tokens,
                    "eval_count": ctx.last_usage.completion_tokens,
                })));
                Ok(out)
            }
        }
    }

    fn provider(&self) -> &'static str {
        "ollama"
    }
}

impl OllamaEmitter {
    fn flush_tool(&self, ctx: &mut EmitContext) -> Vec<u8> {
        let Some((_, name)) = ctx.pending_tool.take() else {
            return Vec::new();
        };
        let args = std::mem::take(&mut ctx.pending_args);
        ndjson(&json!({
            "model": ctx.model,
            "created_at": chrono::Utc::now().to_rfc3339(),
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{
                    "function": { "name": name, "arguments": ir::parse_tool_args(&args) }
                }],
            },
            "done": false,
        }))
    }
}

fn ndjson(value: &Value) -> Vec<u8> {
    let mut out = value.to_string().into_bytes();
    out.push(b'\n');
    out
}
