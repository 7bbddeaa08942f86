// IR -> Gemini generateContent. The Cloud Code envelope is the executor's
// concern; this emitter produces the bare {contents, generationConfig} shape.

use serde_json::{json, Map, Value};

use super::sse_data;
use crate::error::ProxyError;
use crate::ir::{
    self, CandidateResult, ContentPart, DeltaKind, Message, Role, UnifiedChatRequest,
    UnifiedEvent, Usage,
};
use crate::translator::{EmitContext, FromIrEmitter};

pub struct GeminiEmitter;

impl FromIrEmitter for GeminiEmitter {
    fn request(&self, req: &UnifiedChatRequest) -> Result<Vec<u8>, ProxyError> {
        let is_g3 = ir::is_g3_model(&req.model);
        let mut contents: Vec<Value> = Vec::new();
        let mut system_parts: Vec<Value> = Vec::new();

        for msg in &req.messages {
            match msg.role {
                Role::System => {
                    let text = msg.combined_text();
                    if !text.is_empty() {
                        system_parts.push(json!({ "text": text }));
                    }
                }
                Role::Tool => {
                    let response = parse_tool_response(&msg.combined_text());
                    contents.push(json!({
                        "role": "user",
                        "parts": [{
                            "functionResponse": {
                                "id": msg.tool_call_id.clone().unwrap_or_default(),
                                "name": msg.tool_call_id.clone().unwrap_or_default(),
                                "response": response,
                            }
                        }],
                    }));
                }
                role => {
                    let mut parts = build_parts(msg);
                    if parts.is_empty() && msg.tool_calls.is_empty() {
                        continue;
                    }
                    for tc in &msg.tool_calls {
                        parts.push(build_function_call(tc, is_g3));
                    }
                    contents.push(json!({
                        "role": if role == Role::Assistant { "model" } else { "user" },
                        "parts": parts,
                    }));
                }
            }
        }

        let mut body = json!({ "contents": contents });
        if !system_parts.is_empty() {
            body["systemInstruction"] = json!({ "role": "user", "parts": system_parts });
        }

        let mut generation_config = Map::new();
        if let Some(t) = req.temperature {
            generation_config.insert("temperature".to_string(), json!(t));
        }
        if let Some(p) = req.top_p {
            generation_config.insert("topP".to_string(), json!(p));
        }
        if let Some(k) = req.top_k {
            generation_config.insert("topK".to_string(), json!(k));
        }
        if let Some(m) = req.max_tokens {
            generation_config.insert("maxOutputTokens".to_string(), json!(m));
        }
        if !req.stop.is_empty() {
            generation_config.insert("stopSequences".to_string(), json!(req.stop));
        }
        if let Some(n) = req.n {
            generation_config.insert("candidateCount".to_string(), json!(n));
        }
        if let Some(seed) = req.seed {
            generation_config.insert("seed".to_string(), json!(seed));
        }
        if let Some(format) = &req.response_format {
            if let Some(mime) = format.get("mime_type").and_then(Value::as_str) {
                generation_config.insert("responseMimeType".to_string(), json!(mime));
            }
            if let Some(schema) = format.get("schema") {
                generation_config.insert("responseSchema".to_string(), schema.clone());
            }
        }
        if let Some(reasoning) = &req.reasoning {
            let mut thinking = Map::new();
            thinking.insert("includeThoughts".to_string(), json!(reasoning.include_thoughts));
            if let Some(budget) = reasoning.budget_tokens {
                thinking.insert("thinkingBudget".to_string(), json!(budget));
            }
            generation_config.insert("thinkingConfig".to_string(), Value::Object(thinking));
        }
        body["generationConfig"] = Value::Object(generation_config);

        if !req.tools.is_empty() {
            let declarations: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }
        if let Some(choice) = &req.tool_choice {
            // A toolConfig passed through from a Gemini client wins; OpenAI
            // style strings lower to the mode enum.
            body["toolConfig"] = match choice {
                Value::String(mode) => json!({
                    "functionCallingConfig": {
                        "mode": match mode.as_str() {
                            "none" => "NONE",
                            "required" => "ANY",
                            _ => "AUTO",
                        }
                    }
                }),
                other => other.clone(),
            };
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
        let is_g3 = ir::is_g3_model(model);
        let mut out_candidates = Vec::new();
        for candidate in candidates {
            let Some(message) = candidate.messages.last() else {
                continue;
            };
            let mut parts = build_parts(message);
            for tc in &message.tool_calls {
                parts.push(build_function_call(tc, is_g3));
            }
            out_candidates.push(json!({
                "index": candidate.index,
                "content": { "role": "model", "parts": parts },
                "finishReason": candidate.finish_reason.as_gemini(),
            }));
        }

        let body = json!({
            "candidates": out_candidates,
            "usageMetadata": build_usage_metadata(usage),
            "modelVersion": model,
        });
        Ok(body.to_string().into_bytes())
    }

    fn chunk(&self, event: &UnifiedEvent, ctx: &mut EmitContext) -> Result<Vec<u8>, ProxyError> {
        let mut parts: Vec<Value> = Vec::new();
        let mut finish: Option<&'static str> = None;
        let mut usage_meta: Option<Value> = None;

        match event {
            UnifiedEvent::MessageStart { id, model } => {
                if let Some(id) = id {
                    ctx.message_id = id.clone();
                }
                if let Some(model) = model {
                    ctx.model = model.clone();
                }
                ctx.message_started = true;
                return Ok(Vec::new());
            }
            UnifiedEvent::ContentDelta { kind, text, thought_signature, .. } => match kind {
                DeltaKind::Text => parts.push(json!({ "text": text })),
                DeltaKind::Reasoning => {
                    let mut part = json!({ "text": text, "thought": true });
                    if let Some(sig) = thought_signature {
                        part["thoughtSignature"] = json!(sig);
                    }
                    parts.push(part);
                }
                // Gemini streams function calls whole: buffer until the end
                // marker, then emit one functionCall part.
                DeltaKind::ToolArgs => {
                    ctx.pending_args.push_str(text);
                    return Ok(Vec::new());
                }
            },
            UnifiedEvent::ToolCallStart { id, name, .. } => {
                ctx.saw_tool_call = true;
                ctx.pending_tool = Some((id.clone(), name.clone()));
                ctx.pending_args.clear();
                return Ok(Vec::new());
            }
            UnifiedEvent::ToolCallEnd { .. } => {
                if let Some(part) = flush_pending_call(ctx) {
                    parts.push(part);
                } else {
                    return Ok(Vec::new());
                }
            }
            UnifiedEvent::Usage { usage } => {
                ctx.last_usage.merge(usage);
                usage_meta = Some(build_usage_metadata(&ctx.last_usage));
            }
            UnifiedEvent::Finish { reason } => {
                // Upstreams without an explicit end marker leave the call
                // pending until the stream finishes.
                if let Some(part) = flush_pending_call(ctx) {
                    parts.push(part);
                }
                finish = Some(reason.as_gemini());
            }
        }

        let mut chunk = json!({
            "candidates": [{
                "index": 0,
                "content": { "role": "model", "parts": parts },
            }],
            "modelVersion": ctx.model,
        });
        if let Some(reason) = finish {
            chunk["candidates"][0]["finishReason"] = json!(reason);
        }
        if let Some(meta) = usage_meta {
            chunk["usageMetadata"] = meta;
        }
        if !ctx.message_id.is_empty() {
            chunk["responseId"] = json!(ctx.message_id);
        }

        Ok(sse_data(&chunk))
    }

    fn provider(&self) -> &'static str {
        "gemini"
    }
}

/// Emits the buffered tool call as one functionCall part, through the same
/// builder the non-stream paths use so the gemini-3 sentinel applies.
fn flush_pending_call(ctx: &mut EmitContext) -> Option<Value> {
    let (id, name) = ctx.pending_tool.take()?;
    let call = ir::ToolCall {
        id,
        name,
        args: std::mem::take(&mut ctx.pending_args),
    };
    Some(build_function_call(&call, ir::is_g3_model(&ctx.model)))
}

fn build_parts(msg: &Message) -> Vec<Value> {
    let mut parts = Vec::new();
    for part in &msg.content {
        match part {
            ContentPart::Text { text } => {
                if !text.is_empty() {
                    parts.push(json!({ "text": text }));
                }
            }
            ContentPart::Reasoning { text, thought_signature } => {
                let mut p = json!({ "text": text, "thought": true });
                if ir::is_valid_thought_signature(thought_signature.as_deref()) {
                    p["thoughtSignature"] = json!(thought_signature);
                }
                parts.push(p);
            }
            ContentPart::Image { image } => {
                if !image.data.is_empty() {
                    parts.push(json!({
                        "inlineData": { "mimeType": image.mime_type, "data": image.data }
                    }));
                } else if ir::is_file_reference(&image.url) {
                    parts.push(json!({
                        "fileData": { "mimeType": image.mime_type, "fileUri": image.url }
                    }));
                }
            }
            ContentPart::Audio { audio } | ContentPart::Video { video: audio } => {
                if !audio.file_uri.is_empty() {
                    parts.push(json!({
                        "fileData": { "mimeType": audio.mime_type, "fileUri": audio.file_uri }
                    }));
                } else if !audio.data.is_empty() {
                    parts.push(json!({
                        "inlineData": { "mimeType": audio.mime_type, "data": audio.data }
                    }));
                }
            }
            ContentPart::ExecutableCode { execution } => {
                parts.push(json!({
                    "executableCode": { "language": execution.language, "code": execution.code }
                }));
            }
            ContentPart::CodeResult { execution } => {
                parts.push(json!({
                    "codeExecutionResult": { "outcome": execution.outcome, "output": execution.output }
                }));
            }
            ContentPart::Opaque { value } => {
                parts.push(value.clone());
            }
        }
    }
    parts
}

/// A function call part. For the gemini-3 family the upstream validates
/// thoughtSignature presence, so a sentinel stands in when none survived
/// translation.
fn build_function_call(tc: &ir::ToolCall, is_g3: bool) -> Value {
    let mut part = json!({
        "functionCall": {
            "id": tc.id,
            "name": tc.name,
            "args": ir::parse_tool_args(&tc.args),
        }
    });
    if is_g3 {
        part["thoughtSignature"] = json!(ir::DUMMY_THOUGHT_SIGNATURE);
    }
    part
}

fn parse_tool_response(text: &str) -> Value {
    match serde_json::from_str::<Value>(text) {
        Ok(v) if v.is_object() => v,
        Ok(v) => json!({ "result": v }),
        Err(_) => json!({ "result": text }),
    }
}

fn build_usage_metadata(usage: &Usage) -> Value {
    let mut body = json!({
        "promptTokenCount": usage.prompt_tokens,
        "candidatesTokenCount": usage.completion_tokens,
        "totalTokenCount": usage.total_tokens,
    });
    if usage.reasoning_tokens > 0 {
        body["thoughtsTokenCount"] = json!(usage.reasoning_tokens);
    }
    if usage.cached_tokens > 0 {
        body["cachedContentTokenCount"] = json!(usage.cached_tokens);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FinishReason, ToolCall};

    #[test]
    fn scenario_s1_request_shape() {
        let req = UnifiedChatRequest {
            model: "gemini-2.5-flash".to_string(),
            messages: vec![Message::text(Role::User, "hi")],
            ..Default::default()
        };
        let body: Value =
            serde_json::from_slice(&GeminiEmitter.request(&req).unwrap()).unwrap();
        assert_eq!(
            body,
            json!({
                "contents": [{"role":"user","parts":[{"text":"hi"}]}],
                "generationConfig": {}
            })
        );
    }

    #[test]
    fn tool_results_become_function_responses() {
        let mut tool = Message::new(Role::Tool);
        tool.tool_call_id = Some("fc1".to_string());
        tool.content.push(ContentPart::text("{\"ok\":true}"));
        let req = UnifiedChatRequest {
            model: "gemini-2.5-pro".to_string(),
            messages: vec![tool],
            ..Default::default()
        };
        let body: Value =
            serde_json::from_slice(&GeminiEmitter.request(&req).unwrap()).unwrap();
        let fr = &body["contents"][0]["parts"][0]["functionResponse"];
        assert_eq!(fr["id"], "fc1");
        assert_eq!(fr["response"]["ok"], true);
    }

    #[test]
    fn g3_function_calls_get_sentinel_signature() {
        let mut msg = Message::new(Role::Assistant);
        msg.tool_calls.push(ToolCall {
            id: "fc1".to_string(),
            name: "f".to_string(),
            args: "{}".to_string(),
        });
        let req = UnifiedChatRequest {
            model: "gemini-3-pro-preview".to_string(),
            messages: vec![msg],
            ..Default::default()
        };
        let body: Value =
            serde_json::from_slice(&GeminiEmitter.request(&req).unwrap()).unwrap();
        assert_eq!(
            body["contents"][0]["parts"][0]["thoughtSignature"],
            ir::DUMMY_THOUGHT_SIGNATURE
        );

        // Non-g3 models carry no sentinel.
        let mut msg = Message::new(Role::Assistant);
        msg.tool_calls.push(ToolCall {
            id: "fc1".to_string(),
            name: "f".to_string(),
            args: "{}".to_string(),
        });
        let req = UnifiedChatRequest {
            model: "gemini-2.5-pro".to_string(),
            messages: vec![msg],
            ..Default::default()
        };
        let body: Value =
            serde_json::from_slice(&GeminiEmitter.request(&req).unwrap()).unwrap();
        assert!(body["contents"][0]["parts"][0].get("thoughtSignature").is_none());
    }

    #[test]
    fn valid_signature_is_reattached() {
        let sig = "b3BhcXVlLXNpZ25hdHVyZS1ieXRlcw==";
        let mut msg = Message::new(Role::Assistant);
        msg.content
            .push(ContentPart::reasoning("thinking", Some(sig.to_string())));
        let req = UnifiedChatRequest {
            model: "gemini-2.5-pro".to_string(),
            messages: vec![msg],
            ..Default::default()
        };
        let body: Value =
            serde_json::from_slice(&GeminiEmitter.request(&req).unwrap()).unwrap();
        assert_eq!(body["contents"][0]["parts"][0]["thoughtSignature"], sig);
    }

    #[test]
    fn response_grouping_and_usage() {
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
        let body: Value = serde_json::from_slice(
            &GeminiEmitter
                .response(&candidates, &usage, "gemini-2.5-flash", "r")
                .unwrap(),
        )
        .unwrap();
        assert_eq!(body["candidates"][0]["content"]["parts"][0]["text"], "hello");
        assert_eq!(body["candidates"][0]["finishReason"], "STOP");
        assert_eq!(body["usageMetadata"]["totalTokenCount"], 2);
    }

    #[test]
    fn streamed_g3_tool_call_gets_sentinel_signature() {
        let mut ctx = EmitContext::new("r1", "gemini-3-pro-high");
        assert!(GeminiEmitter
            .chunk(
                &UnifiedEvent::ToolCallStart {
                    index: 0,
                    id: "fc1".to_string(),
                    name: "f".to_string(),
                },
                &mut ctx,
            )
            .unwrap()
            .is_empty());
        assert!(GeminiEmitter
            .chunk(
                &UnifiedEvent::ContentDelta {
                    index: 0,
                    kind: DeltaKind::ToolArgs,
                    text: "{\"x\":1}".to_string(),
                    thought_signature: None,
                },
                &mut ctx,
            )
            .unwrap()
            .is_empty());
        let bytes = GeminiEmitter
            .chunk(&UnifiedEvent::ToolCallEnd { index: 0 }, &mut ctx)
            .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let chunk: Value =
            serde_json::from_str(text.trim_start_matches("data: ").trim()).unwrap();
        let part = &chunk["candidates"][0]["content"]["parts"][0];
        assert_eq!(part["functionCall"]["name"], "f");
        assert_eq!(part["functionCall"]["args"]["x"], 1);
        assert_eq!(part["thoughtSignature"], ir::DUMMY_THOUGHT_SIGNATURE);

        // Calls left pending at stream end flush through Finish and still
        // carry the sentinel.
        let mut ctx = EmitContext::new("r2", "gemini-3-flash");
        GeminiEmitter
            .chunk(
                &UnifiedEvent::ToolCallStart {
                    index: 0,
                    id: "fc2".to_string(),
                    name: "g".to_string(),
                },
                &mut ctx,
            )
            .unwrap();
        let bytes = GeminiEmitter
            .chunk(
                &UnifiedEvent::Finish {
                    reason: FinishReason::ToolCalls,
                },
                &mut ctx,
            )
            .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let chunk: Value =
            serde_json::from_str(text.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(
            chunk["candidates"][0]["content"]["parts"][0]["thoughtSignature"],
            ir::DUMMY_THOUGHT_SIGNATURE
        );
    }

    #[test]
    fn streamed_tool_call_on_non_g3_has_no_sentinel() {
        let mut ctx = EmitContext::new("r3", "gemini-2.5-pro");
        GeminiEmitter
            .chunk(
                &UnifiedEvent::ToolCallStart {
                    index: 0,
                    id: "fc3".to_string(),
                    name: "h".to_string(),
                },
                &mut ctx,
            )
            .unwrap();
        let bytes = GeminiEmitter
            .chunk(&UnifiedEvent::ToolCallEnd { index: 0 }, &mut ctx)
            .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let chunk: Value =
            serde_json::from_str(text.trim_start_matches("data: ").trim()).unwrap();
        let part = &chunk["candidates"][0]["content"]["parts"][0];
        assert_eq!(part["functionCall"]["name"], "h");
        assert!(part.get("thoughtSignature").is_none());
    }

    #[test]
    fn chunk_framing_is_sse_data() {
        let mut ctx = EmitContext::new("r1", "gemini-2.5-flash");
        let bytes = GeminiEmitter
            .chunk(
                &UnifiedEvent::ContentDelta {
                    index: 0,
                    kind: DeltaKind::Text,
                    text: "hi".to_string(),
                    thought_signature: None,
                },
                &mut ctx,
            )
            .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("data: "));
        assert!(text.ends_with("\n\n"));
        assert!(text.contains("\"text\":\"hi\""));
    }
}
