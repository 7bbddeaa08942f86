// HTTP server: every supported inbound surface on one port, dispatching
// into the pipeline.

use anyhow::Result;
use axum::body::Body;
use axum::extract::Path;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};

use crate::auth::store::{FileTokenStore, TokenStore};
use crate::config;
use crate::error::ProxyError;
use crate::pipeline::{Pipeline, PipelineResponse};
use crate::registry;

static SERVER_HANDLE: OnceCell<RwLock<Option<oneshot::Sender<()>>>> = OnceCell::new();

pub async fn start_server() -> Result<()> {
    let cfg = config::get_config();
    let host = if cfg.host.is_empty() {
        "0.0.0.0"
    } else {
        &cfg.host
    };
    let addr = format!("{}:{}", host, cfg.port);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/v1/models", get(openai_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/messages", post(claude_messages))
        .route("/v1beta/models", get(gemini_models))
        .route("/v1beta/models/*action", post(gemini_handler))
        .route("/api/chat", post(ollama_chat))
        .route("/api/generate", post(ollama_generate))
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("gateway listening on {}", addr);

    let (tx, rx) = oneshot::channel::<()>();
    SERVER_HANDLE
        .get_or_init(|| RwLock::new(None))
        .write()
        .replace(tx);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            rx.await.ok();
        })
        .await?;

    Ok(())
}

pub async fn stop_server() -> Result<()> {
    if let Some(lock) = SERVER_HANDLE.get() {
        if let Some(tx) = lock.write().take() {
            let _ = tx.send(());
            tracing::info!("gateway stopped");
        }
    }
    Ok(())
}

pub fn is_server_running() -> bool {
    SERVER_HANDLE
        .get()
        .map(|lock| lock.read().is_some())
        .unwrap_or(false)
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "llmux gateway",
        "endpoints": [
            "POST /v1/chat/completions",
            "POST /v1/completions",
            "GET /v1/models",
            "POST /v1/messages",
            "GET /v1beta/models",
            "POST /v1beta/models/*action",
            "POST /api/chat",
            "POST /api/generate"
        ]
    }))
}

/// Runs one request through the pipeline and renders the outcome in the
/// inbound format, including the error schema on failure.
async fn dispatch(format: &str, body: Vec<u8>, stream_content_type: &str) -> Response {
    match Pipeline::global().handle(format, &body).await {
        Ok(PipelineResponse::Json(payload)) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Ok(PipelineResponse::Stream(stream)) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, stream_content_type)
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(stream))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(err) => error_response(&err, format),
    }
}

fn error_response(err: &ProxyError, format: &str) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(retry) = err.retry_after {
        builder = builder.header(header::RETRY_AFTER, retry.as_secs().to_string());
    }
    builder
        .body(Body::from(err.to_client_body(format).to_string()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn chat_completions(body: axum::body::Bytes) -> Response {
    dispatch("openai", body.to_vec(), "text/event-stream").await
}

/// Legacy completions: a bare prompt becomes a single-turn chat.
async fn completions(body: axum::body::Bytes) -> Response {
    let Ok(mut raw) = serde_json::from_slice::<Value>(&body) else {
        return error_response(&ProxyError::user("invalid JSON body"), "openai");
    };
    if let Some(prompt) = raw.get("prompt").cloned() {
        let content = match prompt {
            Value::String(s) => s,
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(""),
            other => other.to_string(),
        };
        raw["messages"] = json!([{ "role": "user", "content": content }]);
        if let Some(obj) = raw.as_object_mut() {
            obj.remove("prompt");
        }
    }
    dispatch("openai", raw.to_string().into_bytes(), "text/event-stream").await
}

async fn claude_messages(body: axum::body::Bytes) -> Response {
    dispatch("claude", body.to_vec(), "text/event-stream").await
}

async fn ollama_chat(body: axum::body::Bytes) -> Response {
    dispatch("ollama", body.to_vec(), "application/x-ndjson").await
}

async fn ollama_generate(body: axum::body::Bytes) -> Response {
    dispatch("ollama", body.to_vec(), "application/x-ndjson").await
}

/// Gemini native route: `/v1beta/models/{model}:{action}`. The model rides
/// in the path, so it is injected into the body before parsing.
async fn gemini_handler(Path(action): Path<String>, body: axum::body::Bytes) -> Response {
    let Some((model, verb)) = action.rsplit_once(':') else {
        return error_response(
            &ProxyError::user(format!("malformed action: {action}")),
            "gemini",
        );
    };

    let mut raw: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return error_response(
                &ProxyError::user(format!("invalid JSON body: {e}")),
                "gemini",
            )
        }
    };
    raw["model"] = json!(model);

    match verb {
        "countTokens" => count_tokens(&raw),
        "generateContent" => dispatch("gemini", raw.to_string().into_bytes(), "text/event-stream").await,
        "streamGenerateContent" => {
            raw["stream"] = json!(true);
            dispatch("gemini", raw.to_string().into_bytes(), "text/event-stream").await
        }
        other => error_response(
            &ProxyError::user(format!("unsupported action: {other}")),
            "gemini",
        ),
    }
}

/// Local token estimate; OAuth upstreams expose no countTokens surface.
fn count_tokens(raw: &Value) -> Response {
    let mut chars = 0usize;
    if let Some(contents) = raw.get("contents").and_then(Value::as_array) {
        for content in contents {
            for part in content.get("parts").and_then(Value::as_array).into_iter().flatten() {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    chars += text.chars().count();
                }
            }
        }
    }
    let tokens = (chars / 4).max(1);
    Json(json!({ "totalTokens": tokens })).into_response()
}

async fn openai_models() -> Json<Value> {
    let store = FileTokenStore::from_config();
    let mut models = Vec::new();
    for (model, providers) in registry::global().list_enabled() {
        let mut owned_by = None;
        for provider in &providers {
            if let Ok(auths) = store.list(provider).await {
                if auths.iter().any(|a| a.enabled) && !is_excluded(provider, &model) {
                    owned_by = Some(provider.clone());
                    break;
                }
            }
        }
        if let Some(owned_by) = owned_by {
            models.push(json!({
                "id": model,
                "object": "model",
                "created": 0,
                "owned_by": owned_by,
            }));
        }
    }
    Json(json!({ "object": "list", "data": models }))
}

async fn gemini_models() -> Json<Value> {
    let models: Vec<Value> = registry::global()
        .list_enabled()
        .into_iter()
        .filter(|(model, providers)| {
            model.starts_with("gemini") && providers.iter().any(|p| p == "gemini")
        })
        .map(|(model, _)| {
            json!({
                "name": format!("models/{model}"),
                "displayName": model,
                "supportedGenerationMethods": ["generateContent", "streamGenerateContent"],
            })
        })
        .collect();
    Json(json!({ "models": models }))
}

fn is_excluded(provider: &str, model: &str) -> bool {
    let cfg = config::get_config();
    cfg.oauth_excluded_models
        .get(provider)
        .map(|patterns| {
            patterns
                .iter()
                .any(|pattern| config::match_model_pattern(pattern, model))
        })
        .unwrap_or(false)
}
