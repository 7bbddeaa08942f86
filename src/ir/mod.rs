// Canonical intermediate representation for chat requests, responses and
// streaming events. Every wire format is parsed into these types and emitted
// back out of them; translators never talk to each other directly.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Placeholder signature attached to gemini-3 family function calls when the
/// upstream expects a thoughtSignature and none was carried through.
pub const DUMMY_THOUGHT_SIGNATURE: &str = "skip_thought_signature_validator";

/// Minimum length below which a signature is treated as noise.
const MIN_SIGNATURE_LENGTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn from_str(s: &str) -> Role {
        match s {
            "system" | "developer" => Role::System,
            "assistant" | "model" => Role::Assistant,
            "tool" | "function" => Role::Tool,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImagePart {
    pub mime_type: String,
    /// Inline base64 payload, if the image arrived inline.
    #[serde(default)]
    pub data: String,
    /// File reference (`files/...`, `gs://...`) or passthrough URL.
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaPart {
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub file_uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeExecution {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub output: String,
}

/// One block of message content. Unknown provider parts that fit none of
/// these variants are preserved verbatim in `Opaque` so they can round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought_signature: Option<String>,
    },
    Image {
        image: ImagePart,
    },
    Audio {
        audio: MediaPart,
    },
    Video {
        video: MediaPart,
    },
    ExecutableCode {
        execution: CodeExecution,
    },
    CodeResult {
        execution: CodeExecution,
    },
    Opaque {
        value: Value,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn reasoning(text: impl Into<String>, signature: Option<String>) -> Self {
        ContentPart::Reasoning {
            text: text.into(),
            thought_signature: signature,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Canonical JSON string; streaming deltas are concatenated raw and only
    /// validated once the call is complete.
    pub args: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: Vec<ContentPart>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// For role=tool: which call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            content: Vec::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn text(role: Role, text: impl Into<String>) -> Self {
        let mut msg = Self::new(role);
        msg.content.push(ContentPart::text(text));
        msg
    }

    /// Concatenated plain-text parts.
    pub fn combined_text(&self) -> String {
        let mut out = String::new();
        for part in &self.content {
            if let ContentPart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }

    /// Concatenated reasoning parts.
    pub fn combined_reasoning(&self) -> String {
        let mut out = String::new();
        for part in &self.content {
            if let ContentPart::Reasoning { text, .. } = part {
                out.push_str(text);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u64>,
    #[serde(default)]
    pub include_thoughts: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnifiedChatRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(default)]
    pub stream: bool,
    /// Provider hints the inbound payload carried that no IR field models.
    #[serde(default)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub reasoning_tokens: u64,
    pub cached_tokens: u64,
    pub audio_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub tool_use_prompt_tokens: u64,
}

impl Usage {
    pub fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0 && self.total_tokens == 0
    }

    /// Later readings replace earlier ones field-wise; upstreams report
    /// cumulative usage in their final chunk.
    pub fn merge(&mut self, other: &Usage) {
        macro_rules! take_max {
            ($field:ident) => {
                if other.$field > self.$field {
                    self.$field = other.$field;
                }
            };
        }
        take_max!(prompt_tokens);
        take_max!(completion_tokens);
        take_max!(total_tokens);
        take_max!(reasoning_tokens);
        take_max!(cached_tokens);
        take_max!(audio_tokens);
        take_max!(cache_creation_tokens);
        take_max!(cache_read_tokens);
        take_max!(tool_use_prompt_tokens);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

impl FinishReason {
    pub fn as_openai(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
        }
    }

    pub fn as_claude(&self) -> &'static str {
        match self {
            FinishReason::Stop => "end_turn",
            FinishReason::Length => "max_tokens",
            FinishReason::ToolCalls => "tool_use",
            FinishReason::ContentFilter => "refusal",
        }
    }

    pub fn as_gemini(&self) -> &'static str {
        match self {
            FinishReason::Stop => "STOP",
            FinishReason::Length => "MAX_TOKENS",
            FinishReason::ToolCalls => "STOP",
            FinishReason::ContentFilter => "SAFETY",
        }
    }

    pub fn from_openai(s: &str) -> FinishReason {
        match s {
            "length" => FinishReason::Length,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    }

    pub fn from_claude(s: &str) -> FinishReason {
        match s {
            "max_tokens" => FinishReason::Length,
            "tool_use" => FinishReason::ToolCalls,
            "refusal" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    }

    pub fn from_gemini(s: &str) -> FinishReason {
        match s {
            "MAX_TOKENS" => FinishReason::Length,
            "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    Text,
    Reasoning,
    ToolArgs,
}

/// One streaming event. Per stream the order is: optional `MessageStart`,
/// interleaved deltas, per-tool-call start/deltas/end, `Usage`, `Finish`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UnifiedEvent {
    MessageStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    ContentDelta {
        index: usize,
        kind: DeltaKind,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thought_signature: Option<String>,
    },
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    ToolCallEnd {
        index: usize,
    },
    Usage {
        usage: Usage,
    },
    Finish {
        reason: FinishReason,
    },
}

/// One answer candidate. Only Gemini produces more than one; other formats
/// always use index 0.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateResult {
    pub index: usize,
    pub messages: Vec<Message>,
    pub finish_reason: FinishReason,
}

/// Provider metadata that survives the IR hop (response id, created time).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseMeta {
    pub response_id: Option<String>,
    pub model_version: Option<String>,
    pub created: Option<i64>,
}

/// Non-stream parse result shared by every to-IR parser.
#[derive(Debug, Clone, Default)]
pub struct ParsedResponse {
    pub candidates: Vec<CandidateResult>,
    pub usage: Usage,
    pub meta: ResponseMeta,
}

impl ParsedResponse {
    pub fn first_messages(&self) -> &[Message] {
        self.candidates
            .first()
            .map(|c| c.messages.as_slice())
            .unwrap_or(&[])
    }

    pub fn finish_reason(&self) -> FinishReason {
        self.candidates
            .first()
            .map(|c| c.finish_reason)
            .unwrap_or(FinishReason::Stop)
    }
}

// ---------------------------------------------------------------------------
// Tool-call id namespacing
// ---------------------------------------------------------------------------

/// Rewrites a tool-call id into Claude's `toolu_` namespace. Ids already in
/// that namespace pass through untouched so the conversion is bijective with
/// `to_openai_tool_id` on prefixed ids.
pub fn to_claude_tool_id(id: &str) -> String {
    if id.starts_with("toolu_") {
        return id.to_string();
    }
    if let Some(rest) = id.strip_prefix("call_") {
        return format!("toolu_{rest}");
    }
    format!("toolu_{id}")
}

/// Rewrites a tool-call id into OpenAI's `call_` namespace.
pub fn to_openai_tool_id(id: &str) -> String {
    if id.starts_with("call_") {
        return id.to_string();
    }
    if let Some(rest) = id.strip_prefix("toolu_") {
        return format!("call_{rest}");
    }
    format!("call_{id}")
}

// ---------------------------------------------------------------------------
// Thought signatures
// ---------------------------------------------------------------------------

pub fn is_valid_thought_signature(sig: Option<&str>) -> bool {
    match sig {
        Some(s) => s.len() >= MIN_SIGNATURE_LENGTH && s != DUMMY_THOUGHT_SIGNATURE,
        None => false,
    }
}

/// Whether the model belongs to the gemini-3 family that requires a
/// signature (real or sentinel) on function-call parts.
pub fn is_g3_model(model: &str) -> bool {
    let m = model.to_ascii_lowercase();
    m.contains("gemini-3") || m.starts_with("g3-") || m == "g3"
}

// ---------------------------------------------------------------------------
// Tool argument canonicalization
// ---------------------------------------------------------------------------

/// Tool arguments arrive either as a JSON object or as a pre-serialized
/// string; the IR stores the string form.
pub fn canonical_tool_args(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "{}".to_string(),
        other => other.to_string(),
    }
}

/// Inverse of `canonical_tool_args` for formats that want a JSON object.
pub fn parse_tool_args(args: &str) -> Value {
    if args.trim().is_empty() {
        return Value::Object(Map::new());
    }
    serde_json::from_str(args).unwrap_or_else(|_| Value::Object(Map::new()))
}

// ---------------------------------------------------------------------------
// Inline image normalization
// ---------------------------------------------------------------------------

/// Splits a `data:` URI into (mime, base64 payload).
pub fn parse_data_uri(uri: &str) -> Option<(String, String)> {
    let rest = uri.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let mime = header
        .split(';')
        .next()
        .filter(|m| !m.is_empty())
        .unwrap_or("application/octet-stream");
    Some((mime.to_string(), data.to_string()))
}

/// Whether a URL is a provider file reference that must be preserved as-is.
pub fn is_file_reference(url: &str) -> bool {
    url.starts_with("files/") || url.starts_with("gs://")
}

/// Normalizes an inbound image source into an `ImagePart` per the ingress
/// contract: data URIs decoded, file references preserved, other URLs pass
/// through untouched.
pub fn normalize_image_source(url: &str, mime_hint: Option<&str>) -> ImagePart {
    if let Some((mime, data)) = parse_data_uri(url) {
        return ImagePart {
            mime_type: mime,
            data,
            url: String::new(),
        };
    }
    ImagePart {
        mime_type: mime_hint.unwrap_or("").to_string(),
        data: String::new(),
        url: url.to_string(),
    }
}

// ---------------------------------------------------------------------------
// "[undefined]" scrubbing
// ---------------------------------------------------------------------------

const UNDEFINED_PLACEHOLDER: &str = "[undefined]";

/// Recursively removes `"[undefined]"` placeholder values some clients send
/// for missing fields. Objects emptied by the scrub are elided. Idempotent.
pub fn scrub_undefined(value: &Value) -> Option<Value> {
    match value {
        Value::String(s) if s == UNDEFINED_PLACEHOLDER => None,
        Value::Object(map) => {
            let mut cleaned = Map::new();
            for (k, v) in map {
                if let Some(kept) = scrub_undefined(v) {
                    cleaned.insert(k.clone(), kept);
                }
            }
            if cleaned.is_empty() && !map.is_empty() {
                return None;
            }
            Some(Value::Object(cleaned))
        }
        Value::Array(items) => {
            let cleaned: Vec<Value> = items.iter().filter_map(scrub_undefined).collect();
            Some(Value::Array(cleaned))
        }
        other => Some(other.clone()),
    }
}

/// Scrubs a payload only if the placeholder appears anywhere in it; the byte
/// scan keeps the common path allocation-free.
pub fn sanitize_undefined_payload(payload: &[u8]) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(payload).ok()?;
    if !text.contains(UNDEFINED_PLACEHOLDER) {
        return None;
    }
    let parsed: Value = serde_json::from_str(text).ok()?;
    let cleaned = scrub_undefined(&parsed)?;
    serde_json::to_vec(&cleaned).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_id_conversion_is_bijective() {
        assert_eq!(to_claude_tool_id("call_abc"), "toolu_abc");
        assert_eq!(to_openai_tool_id("toolu_abc"), "call_abc");
        assert_eq!(to_openai_tool_id(&to_claude_tool_id("call_x1")), "call_x1");
        assert_eq!(to_claude_tool_id(&to_openai_tool_id("toolu_x1")), "toolu_x1");
        // Already-namespaced ids are untouched.
        assert_eq!(to_claude_tool_id("toolu_k"), "toolu_k");
        assert_eq!(to_openai_tool_id("call_k"), "call_k");
    }

    #[test]
    fn scrub_removes_placeholders_recursively() {
        let payload = json!({
            "keep": "value",
            "drop": "[undefined]",
            "nested": { "only": "[undefined]" },
            "list": ["a", "[undefined]", { "x": "[undefined]" }]
        });
        let cleaned = scrub_undefined(&payload).unwrap();
        assert_eq!(cleaned["keep"], "value");
        assert!(cleaned.get("drop").is_none());
        // Object emptied by the scrub is elided entirely.
        assert!(cleaned.get("nested").is_none());
        assert_eq!(cleaned["list"], json!(["a"]));
    }

    #[test]
    fn scrub_is_idempotent() {
        let payload = json!({ "a": "[undefined]", "b": { "c": ["[undefined]", 1] } });
        let once = scrub_undefined(&payload).unwrap();
        let twice = scrub_undefined(&once).unwrap();
        assert_eq!(once, twice);
        assert!(!once.to_string().contains("[undefined]"));
    }

    #[test]
    fn data_uri_parsing() {
        let (mime, data) = parse_data_uri("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(data, "aGVsbG8=");
        assert!(parse_data_uri("https://example.com/x.png").is_none());
    }

    #[test]
    fn image_normalization() {
        let inline = normalize_image_source("data:image/jpeg;base64,QUJD", None);
        assert_eq!(inline.mime_type, "image/jpeg");
        assert_eq!(inline.data, "QUJD");

        let file_ref = normalize_image_source("files/abc123", Some("image/png"));
        assert_eq!(file_ref.url, "files/abc123");
        assert!(is_file_reference(&file_ref.url));

        let passthrough = normalize_image_source("https://example.com/a.png", None);
        assert_eq!(passthrough.url, "https://example.com/a.png");
        assert!(!is_file_reference(&passthrough.url));
    }

    #[test]
    fn tool_args_canonicalization() {
        assert_eq!(canonical_tool_args(&json!({"a": 1})), "{\"a\":1}");
        assert_eq!(canonical_tool_args(&json!("{\"b\":2}")), "{\"b\":2}");
        assert_eq!(canonical_tool_args(&Value::Null), "{}");
        assert_eq!(parse_tool_args("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(parse_tool_args("not json"), json!({}));
    }

    #[test]
    fn signature_validity() {
        assert!(!is_valid_thought_signature(None));
        assert!(!is_valid_thought_signature(Some("short")));
        assert!(!is_valid_thought_signature(Some(DUMMY_THOUGHT_SIGNATURE)));
        assert!(is_valid_thought_signature(Some(
            "CqQBAXGd2m1pZ2h0eS1sb25nLXNpZ25hdHVyZQ=="
        )));
    }

    #[test]
    fn finish_reason_spellings() {
        assert_eq!(FinishReason::ToolCalls.as_claude(), "tool_use");
        assert_eq!(FinishReason::Length.as_gemini(), "MAX_TOKENS");
        assert_eq!(FinishReason::from_gemini("SAFETY"), FinishReason::ContentFilter);
        assert_eq!(FinishReason::from_claude("end_turn"), FinishReason::Stop);
        assert_eq!(FinishReason::from_openai("tool_calls"), FinishReason::ToolCalls);
    }

    #[test]
    fn usage_merge_keeps_cumulative_maximum() {
        let mut total = Usage::default();
        total.merge(&Usage {
            prompt_tokens: 10,
            completion_tokens: 2,
            total_tokens: 12,
            ..Default::default()
        });
        total.merge(&Usage {
            prompt_tokens: 10,
            completion_tokens: 9,
            total_tokens: 19,
            reasoning_tokens: 4,
            ..Default::default()
        });
        assert_eq!(total.completion_tokens, 9);
        assert_eq!(total.total_tokens, 19);
        assert_eq!(total.reasoning_tokens, 4);
    }
}
