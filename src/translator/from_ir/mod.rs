// IR -> outbound wire formats.

pub mod claude;
pub mod codex;
pub mod gemini;
pub mod ollama;
pub mod openai;

use serde_json::Value;

/// One SSE frame: `data: <json>\n\n`.
pub(crate) fn sse_data(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(value.to_string().as_bytes());
    out.extend_from_slice(b"\n\n");
    out
}

/// One named SSE frame: `event: <name>\ndata: <json>\n\n` (Anthropic style).
pub(crate) fn sse_event(name: &str, value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    out.extend_from_slice(b"event: ");
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b"\ndata: ");
    out.extend_from_slice(value.to_string().as_bytes());
    out.extend_from_slice(b"\n\n");
    out
}
