// Translator registry: inbound format name -> to-IR parser, upstream
// provider name -> from-IR emitter. Populated once during startup; all later
// access is read-only.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use crate::error::ProxyError;
use crate::ir::{
    CandidateResult, Message, ParsedResponse, UnifiedChatRequest, UnifiedEvent, Usage,
};

pub mod from_ir;
pub mod to_ir;

/// Parses one wire format into the IR. Implementations are stateless;
/// streaming aggregation (tool-arg concatenation) happens in the pipeline.
pub trait ToIrParser: Send + Sync {
    fn parse_request(&self, payload: &[u8]) -> Result<UnifiedChatRequest, ProxyError>;
    fn parse_response(&self, payload: &[u8]) -> Result<ParsedResponse, ProxyError>;
    fn parse_chunk(&self, payload: &[u8]) -> Result<Vec<UnifiedEvent>, ProxyError>;
    fn format(&self) -> &'static str;
}

/// Per-stream counters owned by the caller so emitters stay pure.
#[derive(Debug, Default, Clone)]
pub struct EmitContext {
    pub message_id: String,
    pub model: String,
    pub created: i64,
    /// Index of the currently open content block, per the target's numbering.
    pub block_index: usize,
    pub message_started: bool,
    pub block_open: bool,
    /// Kind of the open block, to know when a new one must be started.
    pub block_kind: Option<crate::ir::DeltaKind>,
    /// Last usage reading, embedded into the closing frame where the target
    /// schema wants it (Claude message_delta, Ollama done).
    pub last_usage: crate::ir::Usage,
    pub saw_tool_call: bool,
    /// Tool call being buffered for targets that emit calls whole (Gemini,
    /// Ollama): (id, name) plus the raw args accumulated so far.
    pub pending_tool: Option<(String, String)>,
    pub pending_args: String,
}

impl EmitContext {
    pub fn new(message_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
            ..Default::default()
        }
    }
}

/// Emits the IR in one wire format. `chunk` returns fully framed SSE bytes
/// (including `event:`/`data:` lines and trailing blank line).
pub trait FromIrEmitter: Send + Sync {
    fn request(&self, req: &UnifiedChatRequest) -> Result<Vec<u8>, ProxyError>;
    fn response(
        &self,
        candidates: &[CandidateResult],
        usage: &Usage,
        model: &str,
        message_id: &str,
    ) -> Result<Vec<u8>, ProxyError>;
    fn chunk(&self, event: &UnifiedEvent, ctx: &mut EmitContext) -> Result<Vec<u8>, ProxyError>;
    fn provider(&self) -> &'static str;
}

#[derive(Default)]
pub struct Registry {
    to_ir: RwLock<HashMap<String, Arc<dyn ToIrParser>>>,
    from_ir: RwLock<HashMap<String, Arc<dyn FromIrEmitter>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_to_ir(&self, format: &str, parser: Arc<dyn ToIrParser>) {
        self.to_ir.write().insert(format.to_string(), parser);
    }

    pub fn register_from_ir(&self, provider: &str, emitter: Arc<dyn FromIrEmitter>) {
        self.from_ir.write().insert(provider.to_string(), emitter);
    }

    pub fn get_to_ir(&self, format: &str) -> Option<Arc<dyn ToIrParser>> {
        self.to_ir.read().get(format).cloned()
    }

    pub fn get_from_ir(&self, provider: &str) -> Option<Arc<dyn FromIrEmitter>> {
        self.from_ir.read().get(provider).cloned()
    }

    /// A missing key after warm-up is a wiring bug, not a client mistake.
    pub fn must_to_ir(&self, format: &str) -> Result<Arc<dyn ToIrParser>, ProxyError> {
        self.get_to_ir(format).ok_or_else(|| {
            ProxyError::upstream(500, format!("no parser registered for format '{format}'"))
        })
    }

    pub fn must_from_ir(&self, provider: &str) -> Result<Arc<dyn FromIrEmitter>, ProxyError> {
        self.get_from_ir(provider).ok_or_else(|| {
            ProxyError::upstream(500, format!("no emitter registered for provider '{provider}'"))
        })
    }

    pub fn list_to_ir_formats(&self) -> Vec<String> {
        self.to_ir.read().keys().cloned().collect()
    }

    pub fn list_from_ir_providers(&self) -> Vec<String> {
        self.from_ir.read().keys().cloned().collect()
    }
}

static REGISTRY: OnceCell<Registry> = OnceCell::new();

/// Process-wide registry with every built-in translator registered.
pub fn global() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        let registry = Registry::new();
        register_builtins(&registry);
        registry
    })
}

fn register_builtins(registry: &Registry) {
    let openai = Arc::new(to_ir::openai::OpenAIParser);
    registry.register_to_ir("openai", openai.clone());
    // Cline speaks OpenAI chat-completions on the wire.
    registry.register_to_ir("cline", openai);
    registry.register_to_ir("claude", Arc::new(to_ir::claude::ClaudeParser));
    registry.register_to_ir("gemini", Arc::new(to_ir::gemini::GeminiParser));
    registry.register_to_ir("ollama", Arc::new(to_ir::ollama::OllamaParser));
    let codex = Arc::new(to_ir::codex::CodexParser);
    registry.register_to_ir("codex", codex.clone());
    registry.register_to_ir("openai-response", codex);

    registry.register_from_ir("openai", Arc::new(from_ir::openai::OpenAIEmitter));
    registry.register_from_ir("claude", Arc::new(from_ir::claude::ClaudeEmitter));
    registry.register_from_ir("gemini", Arc::new(from_ir::gemini::GeminiEmitter));
    registry.register_from_ir("ollama", Arc::new(from_ir::ollama::OllamaEmitter));
    registry.register_from_ir("codex", Arc::new(from_ir::codex::CodexEmitter));
}

/// Convenience for one-shot request parsing.
pub fn parse_request(format: &str, payload: &[u8]) -> Result<UnifiedChatRequest, ProxyError> {
    global().must_to_ir(format)?.parse_request(payload)
}

/// Whether a format string names the Gemini data format; "gemini-cli" shares
/// it and differs only in transport enveloping.
pub fn is_gemini_format(format: &str) -> bool {
    format == "gemini" || format == "gemini-cli"
}

/// Messages from the first candidate, for single-candidate emitters.
pub fn first_candidate(candidates: &[CandidateResult]) -> &[Message] {
    candidates
        .first()
        .map(|c| c.messages.as_slice())
        .unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockParser;

    impl ToIrParser for MockParser {
        fn parse_request(&self, _payload: &[u8]) -> Result<UnifiedChatRequest, ProxyError> {
            Ok(UnifiedChatRequest {
                model: "mock-model".to_string(),
                ..Default::default()
            })
        }
        fn parse_response(&self, _payload: &[u8]) -> Result<ParsedResponse, ProxyError> {
            Ok(ParsedResponse::default())
        }
        fn parse_chunk(&self, _payload: &[u8]) -> Result<Vec<UnifiedEvent>, ProxyError> {
            Ok(Vec::new())
        }
        fn format(&self) -> &'static str {
            "mock"
        }
    }

    #[test]
    fn registration_and_lookup() {
        let registry = Registry::new();
        registry.register_to_ir("mock", Arc::new(MockParser));
        let parser = registry.get_to_ir("mock").expect("registered parser");
        assert_eq!(parser.format(), "mock");
        assert!(registry.get_to_ir("nonexistent").is_none());
    }

    #[test]
    fn missing_key_is_internal_error() {
        let registry = Registry::new();
        let err = match registry.must_to_ir("nope") {
            Err(e) => e,
            Ok(_) => panic!("expected missing-key error"),
        };
        assert_eq!(err.status_code(), 500);
        let err = match registry.must_from_ir("nope") {
            Err(e) => e,
            Ok(_) => panic!("expected missing-key error"),
        };
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn global_registry_has_builtins() {
        let registry = global();
        for format in ["openai", "claude", "gemini", "ollama", "codex", "openai-response", "cline"] {
            assert!(registry.get_to_ir(format).is_some(), "missing parser {format}");
        }
        for provider in ["openai", "claude", "gemini", "ollama", "codex"] {
            assert!(
                registry.get_from_ir(provider).is_some(),
                "missing emitter {provider}"
            );
        }
    }

    #[test]
    fn global_registry_is_singleton() {
        let a = global() as *const Registry;
        let b = global() as *const Registry;
        assert_eq!(a, b);
    }

    // -----------------------------------------------------------------------
    // Round-trip and cross-format properties
    // -----------------------------------------------------------------------

    const OPENAI_BODY: &[u8] = br#"{
        "model": "gemini-2.5-flash",
        "messages": [
            {"role": "system", "content": "be brief"},
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "calling a tool",
             "tool_calls": [{"id":"call_A","type":"function","function":{"name":"lookup","arguments":"{\"q\":\"x\"}"}}]},
            {"role": "tool", "tool_call_id": "call_A", "content": "42"}
        ],
        "temperature": 0.5,
        "max_tokens": 128,
        "tools": [{"type":"function","function":{"name":"lookup","description":"d","parameters":{"type":"object"}}}]
    }"#;

    fn parse(format: &str, body: &[u8]) -> UnifiedChatRequest {
        global()
            .must_to_ir(format)
            .unwrap()
            .parse_request(body)
            .unwrap()
    }

    fn emit(provider: &str, req: &UnifiedChatRequest) -> Vec<u8> {
        global()
            .must_from_ir(provider)
            .unwrap()
            .request(req)
            .unwrap()
    }

    #[test]
    fn openai_round_trip_is_semantically_equal() {
        let first = parse("openai", OPENAI_BODY);
        let re_emitted = emit("openai", &first);
        let second = parse("openai", &re_emitted);

        assert_eq!(first.model, second.model);
        assert_eq!(first.messages.len(), second.messages.len());
        for (a, b) in first.messages.iter().zip(second.messages.iter()) {
            assert_eq!(a.role, b.role);
            assert_eq!(a.combined_text(), b.combined_text());
            assert_eq!(a.tool_calls, b.tool_calls);
            assert_eq!(a.tool_call_id, b.tool_call_id);
        }
        assert_eq!(first.tools, second.tools);
        assert_eq!(first.temperature, second.temperature);
        assert_eq!(first.max_tokens, second.max_tokens);
    }

    #[test]
    fn openai_to_claude_and_back_preserves_tool_pairing() {
        // S2: a tool id crossing the Claude boundary twice comes back as
        // itself, so results stay matchable against their calls.
        let ir = parse("openai", OPENAI_BODY);
        let claude_body = emit("claude", &ir);
        let reparsed = parse("claude", &claude_body);

        let call = reparsed
            .messages
            .iter()
            .flat_map(|m| m.tool_calls.iter())
            .next()
            .expect("tool call survives");
        assert_eq!(call.id, "toolu_A");
        let result = reparsed
            .messages
            .iter()
            .find(|m| m.role == crate::ir::Role::Tool)
            .expect("tool result survives");
        assert_eq!(result.tool_call_id.as_deref(), Some("toolu_A"));

        // Back out through the OpenAI emitter: the original namespace.
        let openai_again = emit("openai", &reparsed);
        let final_ir = parse("openai", &openai_again);
        let call = final_ir
            .messages
            .iter()
            .flat_map(|m| m.tool_calls.iter())
            .next()
            .unwrap();
        assert_eq!(call.id, "call_A");
    }

    #[test]
    fn openai_to_gemini_preserves_sampling_and_tools() {
        let ir = parse("openai", OPENAI_BODY);
        let gemini_body = emit("gemini", &ir);
        let reparsed = parse("gemini", &gemini_body);

        assert_eq!(reparsed.temperature, ir.temperature);
        assert_eq!(reparsed.max_tokens, ir.max_tokens);
        assert_eq!(reparsed.tools.len(), 1);
        assert_eq!(reparsed.tools[0].name, "lookup");
        // System instruction survives as a system message.
        assert_eq!(reparsed.messages[0].role, crate::ir::Role::System);
        assert_eq!(reparsed.messages[0].combined_text(), "be brief");
    }

    #[test]
    fn gemini_response_to_openai_client_matches_wire_contract() {
        // S1 end-to-end shape: Gemini upstream answer rendered for an
        // OpenAI client.
        let upstream = br#"{
            "candidates":[{"content":{"parts":[{"text":"hello"}],"role":"model"},"finishReason":"STOP"}],
            "usageMetadata":{"promptTokenCount":1,"candidatesTokenCount":1,"totalTokenCount":2}
        }"#;
        let parsed = global()
            .must_to_ir("gemini")
            .unwrap()
            .parse_response(upstream)
            .unwrap();
        let out = global()
            .must_from_ir("openai")
            .unwrap()
            .response(&parsed.candidates, &parsed.usage, "gemini-2.5-flash", "r1")
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(body["choices"][0]["index"], 0);
        assert_eq!(body["choices"][0]["message"]["role"], "assistant");
        assert_eq!(body["choices"][0]["message"]["content"], "hello");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(body["usage"]["prompt_tokens"], 1);
        assert_eq!(body["usage"]["completion_tokens"], 1);
        assert_eq!(body["usage"]["total_tokens"], 2);
    }
}
