// Pipeline orchestrator: parse inbound -> IR -> select account -> execute ->
// translate back, with rotation on retryable failures and exactly-once
// request accounting on every exit path.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use once_cell::sync::OnceCell;
use tokio::sync::watch;

use crate::auth::store::{FileTokenStore, TokenStore};
use crate::auth::{Auth, PickOptions, QuotaManager};
use crate::config;
use crate::error::{ErrorCategory, ProxyError};
use crate::executor::{self, ExecRequest, ExecutorRegistry, ProviderExecutor};
use crate::ir::{UnifiedChatRequest, UnifiedEvent, Usage};
use crate::registry;
use crate::resilience::{wait_backoff, BreakerRegistry, RetryPolicy};
use crate::translator::{self, EmitContext};
use crate::usage;

pub enum PipelineResponse {
    /// Complete body in the inbound format.
    Json(Vec<u8>),
    /// Framed bytes ready to write to the client as they arrive.
    Stream(Pin<Box<dyn Stream<Item = Result<Vec<u8>, ProxyError>> + Send>>),
}

pub struct Pipeline {
    manager: &'static QuotaManager,
    store: Arc<dyn TokenStore>,
    breakers: BreakerRegistry,
    retry: RetryPolicy,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            manager: QuotaManager::global(),
            store,
            breakers: BreakerRegistry::default(),
            retry: RetryPolicy::default(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn global() -> &'static Pipeline {
        static INSTANCE: OnceCell<Pipeline> = OnceCell::new();
        INSTANCE.get_or_init(|| Pipeline::new(Arc::new(FileTokenStore::from_config())))
    }

    /// Aborts any retry waits still pending; in-flight requests finish their
    /// current attempt and come back `Cancelled`.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Handles one inbound request end to end. Errors come back with the
    /// format they must be rendered in.
    pub async fn handle(
        &self,
        inbound_format: &str,
        body: &[u8],
    ) -> Result<PipelineResponse, ProxyError> {
        let body = crate::ir::sanitize_undefined_payload(body)
            .unwrap_or_else(|| body.to_vec());
        let request = translator::global()
            .must_to_ir(inbound_format)?
            .parse_request(&body)?;

        let resolved = registry::global().resolve(&request.model).ok_or_else(|| {
            ProxyError::user(format!("unknown model: {}", request.model))
        })?;

        let mut providers = vec![resolved.provider.clone()];
        providers.extend(resolved.fallbacks.iter().cloned());

        let cfg = config::get_config();
        let max_attempts = cfg.request_retry.max(1);
        let max_retry_interval = Duration::from_secs(cfg.max_retry_interval as u64);

        let mut earliest_retry: Option<Duration> = None;
        let mut last_err: Option<ProxyError> = None;

        for provider in &providers {
            let Some(exec) = ExecutorRegistry::global().get(provider) else {
                continue;
            };
            let breaker = self.breakers.get(provider);

            let mut upstream_model =
                registry::global().upstream_name(&resolved.canonical_name, provider);
            let mut tried_preview = false;

            let mut candidates = match self.store.list(provider).await {
                Ok(list) => list,
                Err(err) => {
                    tracing::warn!(provider = %provider, "token store list failed: {err}");
                    continue;
                }
            };
            if candidates.is_empty() {
                continue;
            }
            for candidate in &candidates {
                self.manager.ensure_registered(candidate);
            }

            for attempt in 0..max_attempts {
                if !breaker.allow() {
                    tracing::warn!(provider = %provider, "circuit breaker open, skipping provider");
                    break;
                }

                let auth = match self.manager.pick(
                    provider,
                    &resolved.canonical_name,
                    &PickOptions::default(),
                    &candidates,
                ) {
                    Ok(auth) => auth,
                    Err(err) => {
                        // RetryAfterError: remember the earliest retry time
                        // and fall through to the next provider.
                        if let Some(retry) = err.retry_after {
                            earliest_retry = Some(match earliest_retry {
                                Some(current) => current.min(retry),
                                None => retry,
                            });
                        }
                        last_err = Some(err);
                        break;
                    }
                };

                match self
                    .execute_once(&exec, &auth, &request, &upstream_model, inbound_format)
                    .await
                {
                    Ok(response) => {
                        breaker.record(Ok(()));
                        return Ok(response);
                    }
                    Err(err) => {
                        self.manager.record_request_end(&auth.id, 0);
                        if err.category.counts_as_breaker_failure() {
                            breaker.record(Err(&err));
                        }
                        match err.category {
                            ErrorCategory::User | ErrorCategory::Cancelled => {
                                return Err(err);
                            }
                            ErrorCategory::Quota => {
                                // A different project on the same account may
                                // still have headroom; rotate before cooling.
                                if cfg.quota_exceeded.switch_project {
                                    if let Some(rotated) = rotate_project(&auth) {
                                        tracing::info!(
                                            auth_id = %auth.id,
                                            project = rotated.project_id().unwrap_or(""),
                                            "quota hit, switching project"
                                        );
                                        if let Some(slot) =
                                            candidates.iter_mut().find(|c| c.id == auth.id)
                                        {
                                            *slot = rotated.clone();
                                        }
                                        if let Err(store_err) =
                                            self.store.put(rotated).await
                                        {
                                            tracing::warn!(
                                                "failed to persist rotated project: {store_err}"
                                            );
                                        }
                                        last_err = Some(err);
                                        continue;
                                    }
                                }
                                self.manager.record_quota_hit(&auth.id, err.retry_after);
                                registry::global()
                                    .mark_quota_exceeded(&auth.id, &resolved.canonical_name);
                                usage::publish_request(
                                    provider,
                                    &resolved.canonical_name,
                                    &auth.usage_source(),
                                    &auth.id,
                                    chrono::Utc::now(),
                                    true,
                                    None,
                                );
                                if cfg.quota_exceeded.switch_preview_model
                                    && !tried_preview
                                    && !upstream_model.ends_with("-preview")
                                {
                                    tried_preview = true;
                                    upstream_model = format!("{upstream_model}-preview");
                                    tracing::info!(
                                        model = %upstream_model,
                                        "quota hit, downgrading to preview model"
                                    );
                                }
                                last_err = Some(err);
                            }
                            ErrorCategory::Auth => {
                                // Token refresh is the store's job; a fresh
                                // read may carry a new token. A second 401
                                // on the same auth disables it.
                                self.manager
                                    .disable_auth(&auth.id, Duration::from_secs(600));
                                tracing::warn!(
                                    auth_id = %auth.id,
                                    "auth rejected upstream, disabling and rotating"
                                );
                                last_err = Some(err);
                            }
                            ErrorCategory::Transport | ErrorCategory::Upstream => {
                                if attempt + 1 < max_attempts && self.retry.retryable(&err) {
                                    let delay =
                                        self.retry.backoff(attempt).min(max_retry_interval);
                                    wait_backoff(delay, &self.shutdown_rx).await?;
                                }
                                last_err = Some(err);
                            }
                        }
                    }
                }
            }
        }

        if let Some(retry) = earliest_retry {
            return Err(ProxyError::quota(
                format!("all accounts for {} are cooling down", request.model),
                Some(retry),
            ));
        }
        Err(last_err.unwrap_or_else(|| {
            ProxyError::user(format!("no provider available for model {}", request.model))
        }))
    }

    async fn execute_once(
        &self,
        exec: &Arc<dyn ProviderExecutor>,
        auth: &Auth,
        request: &UnifiedChatRequest,
        upstream_model: &str,
        inbound_format: &str,
    ) -> Result<PipelineResponse, ProxyError> {
        let wire = exec.wire_format();
        let emitter = translator::global().must_from_ir(wire)?;

        // Emit the upstream body with the provider's own model name, then
        // apply configured payload overlays.
        let mut upstream_request = request.clone();
        upstream_request.model = upstream_model.to_string();
        let payload = emitter.request(&upstream_request)?;
        let payload = apply_overlays(&payload, upstream_model, wire);

        let exec_request = ExecRequest {
            model: upstream_model.to_string(),
            payload,
            stream: request.stream,
        };

        if !request.stream {
            let response = executor::execute(exec.as_ref(), auth, &exec_request).await?;
            let parsed = translator::global()
                .must_to_ir(wire)?
                .parse_response(&response.payload)?;

            let message_id = parsed
                .meta
                .response_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
            let out = translator::global()
                .must_from_ir(inbound_format)?
                .response(&parsed.candidates, &parsed.usage, &request.model, &message_id)?;

            self.manager
                .record_request_end(&auth.id, parsed.usage.total_tokens);
            usage::publish_request(
                &auth.provider,
                &request.model,
                &auth.usage_source(),
                &auth.id,
                chrono::Utc::now(),
                false,
                Some(parsed.usage),
            );
            return Ok(PipelineResponse::Json(out));
        }

        let upstream = executor::stream(Arc::clone(exec), auth, &exec_request).await?;
        let stream = translate_stream(
            upstream,
            Arc::clone(exec),
            inbound_format.to_string(),
            request.model.clone(),
            self.manager,
            auth.clone(),
        )?;
        Ok(PipelineResponse::Stream(stream))
    }
}

/// Rotates an account's project id through its `project_ids` list. Returns
/// the updated auth, or None when there is nothing to rotate to.
fn rotate_project(auth: &Auth) -> Option<Auth> {
    let list = auth.meta_str("project_ids")?;
    let projects: Vec<&str> = list
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if projects.len() < 2 {
        return None;
    }
    let current = auth.project_id().unwrap_or(projects[0]);
    let position = projects.iter().position(|p| *p == current).unwrap_or(0);
    let next = projects[(position + 1) % projects.len()];
    if next == current {
        return None;
    }
    let mut rotated = auth.clone();
    rotated
        .metadata
        .insert("project_id".to_string(), serde_json::json!(next));
    Some(rotated)
}

fn apply_overlays(payload: &[u8], model: &str, protocol: &str) -> Vec<u8> {
    let cfg = config::get_config();
    if cfg.payload.default.is_empty() && cfg.payload.override_rules.is_empty() {
        return payload.to_vec();
    }
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(payload) else {
        return payload.to_vec();
    };
    config::apply_payload_config(&cfg, model, protocol, "", &mut value);
    serde_json::to_vec(&value).unwrap_or_else(|_| payload.to_vec())
}

/// Decrements `active_requests` exactly once, whether the stream completes,
/// errors, or is dropped by a disconnecting client.
struct RequestGuard {
    manager: &'static QuotaManager,
    auth_id: String,
    tokens: Arc<AtomicU64>,
    provider: String,
    model: String,
    source: String,
    requested_at: chrono::DateTime<chrono::Utc>,
    usage: Arc<parking_lot::Mutex<Option<Usage>>>,
    failed: Arc<std::sync::atomic::AtomicBool>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.manager
            .record_request_end(&self.auth_id, self.tokens.load(Ordering::Acquire));
        usage::publish_request(
            &self.provider,
            &self.model,
            &self.source,
            &self.auth_id,
            self.requested_at,
            self.failed.load(Ordering::Acquire),
            *self.usage.lock(),
        );
    }
}

fn translate_stream(
    upstream: impl Stream<Item = Result<Vec<u8>, ProxyError>> + Send + 'static,
    exec: Arc<dyn ProviderExecutor>,
    inbound_format: String,
    client_model: String,
    manager: &'static QuotaManager,
    auth: Auth,
) -> Result<Pin<Box<dyn Stream<Item = Result<Vec<u8>, ProxyError>> + Send>>, ProxyError> {
    let parser = translator::global().must_to_ir(exec.wire_format())?;
    let emitter = translator::global().must_from_ir(&inbound_format)?;

    let tokens = Arc::new(AtomicU64::new(0));
    let usage_cell = Arc::new(parking_lot::Mutex::new(None::<Usage>));
    let failed = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let guard = RequestGuard {
        manager,
        auth_id: auth.id.clone(),
        tokens: Arc::clone(&tokens),
        provider: auth.provider.clone(),
        model: client_model.clone(),
        source: auth.usage_source(),
        requested_at: chrono::Utc::now(),
        usage: Arc::clone(&usage_cell),
        failed: Arc::clone(&failed),
    };

    let stream = async_stream::stream! {
        // Owned by the generator: dropped exactly once on any exit.
        let _guard = guard;
        let mut ctx = EmitContext::new(
            uuid::Uuid::new_v4().simple().to_string(),
            client_model.clone(),
        );
        let mut finished = false;
        futures::pin_mut!(upstream);

        while let Some(chunk) = upstream.next().await {
            let payload = match chunk {
                Ok(payload) => payload,
                Err(err) => {
                    failed.store(true, Ordering::Release);
                    yield Err(err);
                    return;
                }
            };
            let events = match parser.parse_chunk(&payload) {
                Ok(events) => events,
                Err(err) => {
                    tracing::debug!("unparseable upstream chunk skipped: {err}");
                    continue;
                }
            };
            for event in events {
                if let UnifiedEvent::Usage { usage } = &event {
                    tokens.store(usage.total_tokens, Ordering::Release);
                    let mut cell = usage_cell.lock();
                    let mut merged = cell.take().unwrap_or_default();
                    merged.merge(usage);
                    *cell = Some(merged);
                }
                if matches!(event, UnifiedEvent::Finish { .. }) {
                    finished = true;
                }
                match emitter.chunk(&event, &mut ctx) {
                    Ok(bytes) if !bytes.is_empty() => yield Ok(bytes),
                    Ok(_) => {}
                    Err(err) => {
                        failed.store(true, Ordering::Release);
                        yield Err(err);
                        return;
                    }
                }
            }
        }

        // Upstreams that close without a finish frame still owe the client
        // a well-formed end of stream.
        if !finished {
            let finish = UnifiedEvent::Finish { reason: crate::ir::FinishReason::Stop };
            if let Ok(bytes) = emitter.chunk(&finish, &mut ctx) {
                if !bytes.is_empty() {
                    yield Ok(bytes);
                }
            }
        }
    };

    Ok(Box::pin(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DeltaKind, FinishReason};

    fn upstream_from(chunks: Vec<Result<Vec<u8>, ProxyError>>) -> impl Stream<Item = Result<Vec<u8>, ProxyError>> + Send + 'static {
        futures::stream::iter(chunks)
    }

    #[tokio::test]
    async fn stream_translates_and_decrements_exactly_once() {
        let _config = crate::config::TEST_MUTEX.lock();
        let manager = QuotaManager::global();
        let auth = Auth::new("pipe-a1", "gemini");
        manager.register_auth(auth.clone());
        manager.record_request_start(&auth.id);

        let exec = ExecutorRegistry::global().get("gemini").unwrap();
        let upstream = upstream_from(vec![
            Ok(br#"{"candidates":[{"content":{"role":"model","parts":[{"text":"hello"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":1,"candidatesTokenCount":1,"totalTokenCount":2}}"#.to_vec()),
        ]);
        let stream = translate_stream(
            upstream,
            exec,
            "openai".to_string(),
            "gemini-2.5-flash".to_string(),
            manager,
            auth.clone(),
        )
        .unwrap();

        let frames: Vec<_> = stream.collect().await;
        let text: String = frames
            .into_iter()
            .map(|f| String::from_utf8(f.unwrap()).unwrap())
            .collect();
        assert!(text.contains("\"content\":\"hello\""));
        assert!(text.contains("\"finish_reason\":\"stop\""));
        assert!(text.ends_with("data: [DONE]\n\n"));

        let state = manager.state(&auth.id);
        assert_eq!(state.active_requests.load(Ordering::Acquire), 0);
        assert_eq!(state.total_tokens_used.load(Ordering::Acquire), 2);
        manager.unregister_auth(&auth.id);
    }

    #[tokio::test]
    async fn dropped_stream_still_decrements() {
        let _config = crate::config::TEST_MUTEX.lock();
        let manager = QuotaManager::global();
        let auth = Auth::new("pipe-a2", "gemini");
        manager.register_auth(auth.clone());
        manager.record_request_start(&auth.id);

        let exec = ExecutorRegistry::global().get("gemini").unwrap();
        let upstream = upstream_from(vec![
            Ok(br#"{"candidates":[{"content":{"role":"model","parts":[{"text":"a"}]}}]}"#.to_vec()),
            Ok(br#"{"candidates":[{"content":{"role":"model","parts":[{"text":"b"}]}}]}"#.to_vec()),
        ]);
        let mut stream = translate_stream(
            upstream,
            exec,
            "openai".to_string(),
            "gemini-2.5-flash".to_string(),
            manager,
            auth.clone(),
        )
        .unwrap();

        // Read one frame, then drop mid-stream (client disconnect).
        let _ = stream.next().await;
        drop(stream);

        let state = manager.state(&auth.id);
        assert_eq!(state.active_requests.load(Ordering::Acquire), 0);
        manager.unregister_auth(&auth.id);
    }

    #[tokio::test]
    async fn missing_finish_is_synthesized() {
        let _config = crate::config::TEST_MUTEX.lock();
        let manager = QuotaManager::global();
        let auth = Auth::new("pipe-a3", "claude");
        manager.register_auth(auth.clone());
        manager.record_request_start(&auth.id);

        let exec = ExecutorRegistry::global().get("claude").unwrap();
        let upstream = upstream_from(vec![Ok(
            br#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#
                .to_vec(),
        )]);
        let stream = translate_stream(
            upstream,
            exec,
            "claude".to_string(),
            "claude-sonnet-4-5".to_string(),
            manager,
            auth.clone(),
        )
        .unwrap();
        let frames: Vec<_> = stream.collect().await;
        let text: String = frames
            .into_iter()
            .map(|f| String::from_utf8(f.unwrap()).unwrap())
            .collect();
        assert!(text.contains("event: message_stop"));
        manager.unregister_auth(&auth.id);
    }

    #[test]
    fn overlay_application_respects_protocol() {
        let _config = crate::config::TEST_MUTEX.lock();
        let mut cfg = config::AppConfig::default();
        let mut rule = config::PayloadRule::default();
        rule.models.push(config::PayloadModelMatch {
            name: "gemini-*".to_string(),
            protocol: Some("gemini".to_string()),
        });
        rule.params
            .insert("generationConfig.topK".to_string(), serde_json::json!(7));
        cfg.payload.override_rules.push(rule);
        config::set_config(cfg);

        let out = apply_overlays(br#"{"contents":[]}"#, "gemini-2.5-pro", "gemini");
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["generationConfig"]["topK"], 7);

        config::set_config(config::AppConfig::default());
    }

    #[test]
    fn project_rotation_cycles_through_list() {
        let mut auth = Auth::new("rot-1", "gemini");
        auth.metadata
            .insert("project_ids".to_string(), serde_json::json!("p-a, p-b, p-c"));
        auth.metadata
            .insert("project_id".to_string(), serde_json::json!("p-a"));

        let rotated = rotate_project(&auth).unwrap();
        assert_eq!(rotated.project_id(), Some("p-b"));
        let rotated = rotate_project(&rotated).unwrap();
        assert_eq!(rotated.project_id(), Some("p-c"));
        let rotated = rotate_project(&rotated).unwrap();
        assert_eq!(rotated.project_id(), Some("p-a"));

        // Single project: nothing to rotate to.
        let mut single = Auth::new("rot-2", "gemini");
        single
            .metadata
            .insert("project_ids".to_string(), serde_json::json!("only"));
        assert!(rotate_project(&single).is_none());
        assert!(rotate_project(&Auth::new("rot-3", "gemini")).is_none());
    }

    #[test]
    fn event_ordering_survives_round_trip() {
        // A canonical upstream order must come out in the same order.
        let events = [
            UnifiedEvent::MessageStart { id: Some("m".into()), model: Some("x".into()) },
            UnifiedEvent::ContentDelta {
                index: 0,
                kind: DeltaKind::Text,
                text: "a".into(),
                thought_signature: None,
            },
            UnifiedEvent::Finish { reason: FinishReason::Stop },
        ];
        let emitter = translator::global().must_from_ir("openai").unwrap();
        let mut ctx = EmitContext::new("m", "x");
        let mut combined = String::new();
        for event in &events {
            let bytes = emitter.chunk(event, &mut ctx).unwrap();
            combined.push_str(&String::from_utf8(bytes).unwrap());
        }
        let role_pos = combined.find("\"role\":\"assistant\"").unwrap();
        let text_pos = combined.find("\"content\":\"a\"").unwrap();
        let fin_pos = combined.find("\"finish_reason\":\"stop\"").unwrap();
        assert!(role_pos < text_pos && text_pos < fin_pos);
    }
}
