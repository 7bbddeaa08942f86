// Inbound wire formats -> IR.

pub mod claude;
pub mod codex;
pub mod gemini;
pub mod ollama;
pub mod openai;

use serde_json::Value;

use crate::error::ProxyError;
use crate::ir;

/// Parses and scrubs an inbound JSON body. Shared first step of every
/// request parser: tolerate unknown fields, reject non-JSON, remove
/// "[undefined]" placeholder values.
pub(crate) fn parse_body(payload: &[u8]) -> Result<Value, ProxyError> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| ProxyError::user(format!("invalid JSON body: {e}")))?;
    Ok(ir::scrub_undefined(&value).unwrap_or(Value::Null))
}

pub(crate) fn opt_f64(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(Value::as_f64)
}

pub(crate) fn opt_u64(v: &Value, key: &str) -> Option<u64> {
    v.get(key).and_then(Value::as_u64)
}

pub(crate) fn opt_str<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str)
}

/// `stop` may be a single string or an array of strings.
pub(crate) fn parse_stop(v: &Value) -> Vec<String> {
    match v {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}
