// Cloud Code envelope used by the Gemini CLI and Antigravity upstreams:
// requests are wrapped as {"request": ...}, responses arrive as
// {"response": ...}.

use serde_json::{json, Value};

/// Wraps a Gemini payload unless it is already enveloped.
pub fn ensure_request_envelope(payload: Value) -> Value {
    if is_enveloped(&payload) {
        return payload;
    }
    json!({ "request": payload })
}

/// Extracts the inner response if the payload is enveloped; otherwise the
/// payload passes through untouched.
pub fn unwrap_response(payload: &Value) -> Value {
    match payload.get("response") {
        Some(inner) if inner.is_object() => inner.clone(),
        _ => payload.clone(),
    }
}

/// Byte-level variant for response bodies and stream chunks.
pub fn unwrap_response_bytes(payload: Vec<u8>) -> Vec<u8> {
    let Ok(parsed) = serde_json::from_slice::<Value>(&payload) else {
        return payload;
    };
    match parsed.get("response") {
        Some(inner) if inner.is_object() => {
            serde_json::to_vec(inner).unwrap_or(payload)
        }
        _ => payload,
    }
}

pub fn is_enveloped(payload: &Value) -> bool {
    payload.get("request").is_some() || payload.get("response").is_some()
}

/// Sets additional top-level fields on a wrapped request (project, model,
/// requestId and the like).
pub fn add_envelope_fields(mut payload: Value, fields: &[(&str, Value)]) -> Value {
    for (key, value) in fields {
        payload[*key] = value.clone();
    }
    payload
}
