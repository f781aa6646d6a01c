//! Relay pipeline: validate → select channel → estimate and preconsume →
//! translate → dispatch → stream/relay → settle. One inbound request flows
//! through this file top to bottom; settlement and refunds run detached.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use http::header::CONTENT_TYPE;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, instrument, warn};

use crate::auth::AuthContext;
use crate::counter;
use crate::error::{ErrorEnvelope, RelayError, Result};
use crate::ledger::SettleTicket;
use crate::model::{Channel, ProviderKind, RelayMode};
use crate::providers::{self, ChannelContext};
use crate::relay::stream::StreamSink;
use crate::schema::{GeneralRequest, Usage};
use crate::AppState;

/// Entry point for every relay route.
#[instrument(skip_all, fields(mode = mode.as_str(), user_id = auth.token.user_id))]
pub async fn handle(
    state: Arc<AppState>,
    mode: RelayMode,
    auth: AuthContext,
    raw_body: Bytes,
    path_model: Option<String>,
) -> Response {
    metrics::counter!("relay_requests_total", "mode" => mode.as_str()).increment(1);
    match relay(state, mode, auth, raw_body, path_model).await {
        Ok(response) => response,
        Err(err) => {
            metrics::counter!("relay_errors_total", "mode" => mode.as_str()).increment(1);
            err.into_response()
        }
    }
}

async fn relay(
    state: Arc<AppState>,
    mode: RelayMode,
    auth: AuthContext,
    raw_body: Bytes,
    path_model: Option<String>,
) -> Result<Response> {
    let req = validate(mode, &raw_body, path_model)?;

    // channel resolution: admin pin wins, otherwise weighted selection
    let channel = match auth.specified_channel {
        Some(id) => state
            .registry
            .channel(id)
            .await?
            .filter(Channel::is_enabled)
            .ok_or_else(|| RelayError::NoChannel {
                group: auth.group.clone(),
                model: req.model.clone(),
            })?,
        None => state.registry.choose(&auth.group, &req.model).await?,
    };

    let outbound_model = channel.map_model(&req.model);
    let remapped = outbound_model != req.model;

    // pricing stays keyed on the caller's model name even after remapping
    let model_ratio = state.pricing.model_ratio(&req.model).await;
    let group_ratio = state.pricing.group_ratio(&auth.group).await;
    let completion_ratio = state.pricing.completion_ratio(&req.model).await;
    let ratio = model_ratio * group_ratio;

    let prompt_tokens = counter::count_prompt(&req, &req.model);
    let estimate = state.ledger.estimate(prompt_tokens, req.max_tokens, ratio);
    let preconsumed = state.ledger.preconsume(&auth.token, estimate).await?;

    let ticket = SettleTicket {
        user_id: auth.token.user_id,
        token_id: auth.token.id,
        token_name: auth.token.name.clone(),
        channel_id: channel.id,
        mode,
        model: req.model.clone(),
        stream: req.stream,
        model_ratio,
        group_ratio,
        completion_ratio,
        preconsumed,
    };

    let ctx = channel_context(&state, &channel, &auth);
    let result = dispatch_and_relay(
        &state,
        mode,
        &req,
        &raw_body,
        remapped,
        &outbound_model,
        &channel,
        ctx,
        &auth,
        prompt_tokens,
        ticket,
    )
    .await;

    match result {
        Ok(response) => Ok(response),
        Err(err) => {
            if err.refundable() {
                state
                    .ledger
                    .refund_detached(auth.token.id, auth.token.user_id, preconsumed);
            }
            Err(err)
        }
    }
}

fn validate(
    mode: RelayMode,
    raw_body: &Bytes,
    path_model: Option<String>,
) -> Result<GeneralRequest> {
    let mut req: GeneralRequest = serde_json::from_slice(raw_body)
        .map_err(|e| RelayError::malformed("bind_request_body_failed", e.to_string()))?;

    if req.model.is_empty() {
        match mode {
            RelayMode::Moderations => req.model = "text-moderation-latest".to_string(),
            RelayMode::Embeddings => req.model = path_model.unwrap_or_default(),
            _ => {}
        }
    }
    if req.model.is_empty() {
        return Err(RelayError::missing_field("model"));
    }
    match mode {
        RelayMode::ChatCompletions if req.messages.is_empty() => {
            Err(RelayError::missing_field("messages"))
        }
        RelayMode::Completions if req.prompt.is_none() => Err(RelayError::missing_field("prompt")),
        RelayMode::Moderations if req.input.is_none() => Err(RelayError::missing_field("input")),
        RelayMode::Edits if req.instruction.as_deref().unwrap_or("").is_empty() => {
            Err(RelayError::missing_field("instruction"))
        }
        _ => Ok(req),
    }
}

fn channel_context(state: &AppState, channel: &Channel, auth: &AuthContext) -> ChannelContext {
    let base_url = auth
        .base_url
        .clone()
        .or_else(|| channel.base_url.clone().filter(|u| !u.is_empty()))
        .unwrap_or_else(|| state.cfg.base_url_for(channel.kind));
    ChannelContext {
        channel_id: channel.id,
        kind: channel.kind,
        key: channel.key.clone(),
        base_url,
        full_url: auth.full_url.clone(),
        library_id: auth.library_id.clone(),
        api_version: channel.api_version.clone(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_and_relay(
    state: &Arc<AppState>,
    mode: RelayMode,
    req: &GeneralRequest,
    raw_body: &Bytes,
    remapped: bool,
    outbound_model: &str,
    channel: &Channel,
    ctx: ChannelContext,
    auth: &AuthContext,
    prompt_tokens: u32,
    ticket: SettleTicket,
) -> Result<Response> {
    // Spark never goes through the HTTP dispatcher
    if channel.kind == ProviderKind::XunfeiSpark {
        return relay_spark(state, req, &ctx, prompt_tokens, ticket).await;
    }

    let adapted = providers::build_request(
        &ctx,
        mode,
        req,
        raw_body,
        remapped,
        outbound_model,
        &auth.bearer,
        state.racing.client(),
    )
    .await?;

    let upstream_request = state
        .racing
        .client()
        .post(&adapted.url)
        .headers(adapted.headers)
        .body(adapted.body)
        .build()
        .map_err(RelayError::Transport)?;

    let fanout = auth.async_num.unwrap_or(channel.async_fanout).max(1);
    let resp = state.racing.dispatch(upstream_request, fanout).await?;

    if !resp.status().is_success() {
        return Err(providers::upstream_error(channel.kind, resp).await);
    }

    // some providers stream whether asked or not
    let is_stream = req.stream
        || resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);

    let model = req.model.clone();
    if is_stream {
        let (sink, rx) = StreamSink::channel(32);
        let state = Arc::clone(state);
        let kind = channel.kind;
        tokio::spawn(async move {
            match providers::relay_stream(kind, resp, sink.clone(), mode, &model, prompt_tokens)
                .await
            {
                Ok(usage) => {
                    sink.send_done().await;
                    settle_detached(state, ticket, usage);
                }
                Err(err) => {
                    warn!(error = %err, "stream relay failed mid-flight");
                    let envelope = ErrorEnvelope { error: err.body() };
                    if let Ok(json) = serde_json::to_string(&envelope) {
                        sink.send_data(json).await;
                    }
                    if err.refundable() {
                        state.ledger.refund_detached(
                            ticket.token_id,
                            ticket.user_id,
                            ticket.preconsumed,
                        );
                    }
                }
            }
        });
        let events = ReceiverStream::new(rx)
            .map(|data| Ok::<_, Infallible>(Event::default().data(data)));
        let sse =
            Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)));
        return Ok(sse.into_response());
    }

    let (body, usage) =
        providers::relay_non_stream(channel.kind, resp, mode, &model, prompt_tokens).await?;
    settle_detached(Arc::clone(state), ticket, usage);
    Ok(([(CONTENT_TYPE, "application/json")], body).into_response())
}

async fn relay_spark(
    state: &Arc<AppState>,
    req: &GeneralRequest,
    ctx: &ChannelContext,
    prompt_tokens: u32,
    ticket: SettleTicket,
) -> Result<Response> {
    let model = req.model.clone();
    if req.stream {
        let (sink, rx) = StreamSink::channel(32);
        let state = Arc::clone(state);
        let ctx = ctx.clone();
        let req = req.clone();
        tokio::spawn(async move {
            match providers::spark::relay(&ctx, &req, &model, Some(&sink), prompt_tokens).await {
                Ok((_, usage)) => {
                    sink.send_done().await;
                    settle_detached(state, ticket, usage);
                }
                Err(err) => {
                    warn!(error = %err, "spark relay failed mid-flight");
                    let envelope = ErrorEnvelope { error: err.body() };
                    if let Ok(json) = serde_json::to_string(&envelope) {
                        sink.send_data(json).await;
                    }
                    state.ledger.refund_detached(
                        ticket.token_id,
                        ticket.user_id,
                        ticket.preconsumed,
                    );
                }
            }
        });
        let events = ReceiverStream::new(rx)
            .map(|data| Ok::<_, Infallible>(Event::default().data(data)));
        let sse =
            Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)));
        return Ok(sse.into_response());
    }

    let (content, usage) =
        providers::spark::relay(ctx, req, &model, None, prompt_tokens).await?;
    let body = providers::spark::canonical_response(&model, content, usage)?;
    settle_detached(Arc::clone(state), ticket, usage);
    Ok(([(CONTENT_TYPE, "application/json")], body).into_response())
}

/// Settlement runs in its own task; the response is already on its way to
/// the caller and never blocks on ledger writes. A settlement panic or
/// error is contained here.
fn settle_detached(state: Arc<AppState>, ticket: SettleTicket, usage: Usage) {
    tokio::spawn(async move {
        if let Err(e) = state
            .ledger
            .settle(&ticket, usage.prompt_tokens, usage.completion_tokens)
            .await
        {
            error!(
                error = %e,
                token_id = ticket.token_id,
                channel_id = ticket.channel_id,
                "settlement failed"
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(json: &str) -> Bytes {
        Bytes::from(json.to_string())
    }

    #[test]
    fn chat_needs_messages() {
        let err = validate(
            RelayMode::ChatCompletions,
            &body(r#"{"model":"gpt-3.5-turbo"}"#),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, RelayError::Malformed { code: "required_field_missing", .. }));
    }

    #[test]
    fn completions_needs_prompt() {
        assert!(validate(
            RelayMode::Completions,
            &body(r#"{"model":"text-davinci-003","prompt":"hi"}"#),
            None,
        )
        .is_ok());
        assert!(validate(
            RelayMode::Completions,
            &body(r#"{"model":"text-davinci-003"}"#),
            None,
        )
        .is_err());
    }

    #[test]
    fn moderations_defaults_model() {
        let req = validate(
            RelayMode::Moderations,
            &body(r#"{"input":"some text"}"#),
            None,
        )
        .unwrap();
        assert_eq!(req.model, "text-moderation-latest");
    }

    #[test]
    fn embeddings_model_from_path() {
        let req = validate(
            RelayMode::Embeddings,
            &body(r#"{"input":"text"}"#),
            Some("text-embedding-ada-002".to_string()),
        )
        .unwrap();
        assert_eq!(req.model, "text-embedding-ada-002");

        let err = validate(RelayMode::Embeddings, &body(r#"{"input":"text"}"#), None).unwrap_err();
        assert!(matches!(err, RelayError::Malformed { .. }));
    }

    #[test]
    fn edits_needs_instruction() {
        assert!(validate(
            RelayMode::Edits,
            &body(r#"{"model":"text-davinci-edit-001","instruction":"fix"}"#),
            None,
        )
        .is_ok());
        assert!(validate(
            RelayMode::Edits,
            &body(r#"{"model":"text-davinci-edit-001","instruction":""}"#),
            None,
        )
        .is_err());
    }

    #[test]
    fn garbage_body_is_bind_failure() {
        let err = validate(RelayMode::ChatCompletions, &body("not json"), None).unwrap_err();
        assert!(matches!(err, RelayError::Malformed { code: "bind_request_body_failed", .. }));
        assert!(!err.refundable());
    }
}

#[cfg(test)]
mod relay_tests {
    use super::*;
    use crate::store::Store;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicBool;

    use axum::routing::post;
    use axum::Router;

    use crate::config::AppConfig;
    use crate::ledger::QuotaLedger;
    use crate::model::{Channel, ChannelStatus, Token, TokenStatus, User};
    use crate::pricing::Pricing;
    use crate::registry::ChannelRegistry;
    use crate::relay::dispatch::RacingClient;
    use crate::store::MemStore;

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    async fn seeded_state(upstream: SocketAddr) -> (Arc<AppState>, MemStore) {
        let store = MemStore::new();
        store
            .put_user(User {
                id: 1,
                username: "u".into(),
                group: "default".into(),
                quota: 100_000,
                used_quota: 0,
                is_admin: false,
            })
            .await;
        store
            .put_token(Token {
                id: 1,
                user_id: 1,
                name: "test".into(),
                key: "sk-abc".into(),
                status: TokenStatus::Enabled,
                remaining_quota: 50_000,
                unlimited_quota: false,
                expired_at: None,
            })
            .await;
        store
            .put_channel(Channel {
                id: 7,
                name: "mock-openai".into(),
                kind: ProviderKind::OpenAi,
                key: "sk-upstream".into(),
                base_url: Some(format!("http://{upstream}")),
                status: ChannelStatus::Enabled,
                weight: 1,
                priority: 0,
                async_fanout: 1,
                model_mapping: HashMap::new(),
                models: vec!["gpt-3.5-turbo".into()],
                groups: vec!["default".into()],
                api_version: None,
                used_quota: 0,
            })
            .await;

        let cfg = AppConfig {
            listen_addr: "127.0.0.1:0".into(),
            relay_timeout_secs: 0,
            relay_response_timeout_secs: 5,
            redis_url: None,
            leader_election_enable: false,
            leader_lease_seconds: 15,
            is_master_node: true,
            pre_consumed_quota: 500,
            batch_update_enabled: false,
            batch_update_interval_secs: 5,
            instance_id: "node-test".into(),
            channel_base_urls: HashMap::new(),
            rps: 20,
            burst: 40,
            max_concurrency: None,
            otlp_endpoint: None,
            service_name: "relay-gateway".into(),
        };
        let dyn_store: Arc<dyn crate::store::Store> = Arc::new(store.clone());
        let state = Arc::new(AppState {
            ledger: Arc::new(QuotaLedger::new(dyn_store.clone(), None, 500, false)),
            registry: Arc::new(ChannelRegistry::new(dyn_store.clone(), None)),
            pricing: Arc::new(Pricing::new()),
            racing: Arc::new(
                RacingClient::new(Duration::from_secs(5), None).expect("client builds"),
            ),
            is_master: Arc::new(AtomicBool::new(true)),
            kv: None,
            store: dyn_store,
            cfg: Arc::new(cfg),
        });
        state.registry.reload().await.unwrap();
        (state, store)
    }

    fn auth_ctx(store_token: Token) -> AuthContext {
        AuthContext {
            group: "default".into(),
            bearer: store_token.key.clone(),
            specified_channel: None,
            base_url: None,
            full_url: None,
            library_id: None,
            async_num: None,
            token: store_token,
        }
    }

    async fn wait_for_log(store: &MemStore) -> crate::model::ConsumeLog {
        for _ in 0..100 {
            let logs = store.consume_logs().await;
            if let Some(log) = logs.first() {
                return log.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("settlement never landed");
    }

    #[tokio::test]
    async fn happy_openai_non_stream_relays_verbatim_and_settles() {
        let upstream_body = serde_json::json!({
            "id": "chatcmpl-xyz",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "gpt-3.5-turbo",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi there"},
                         "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}
        });
        let served = upstream_body.clone();
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move || {
                let body = served.clone();
                async move { axum::Json(body) }
            }),
        );
        let (state, store) = seeded_state(serve(app).await).await;
        let token = store.token(1).await.unwrap().unwrap();

        let response = handle(
            state,
            RelayMode::ChatCompletions,
            auth_ctx(token),
            Bytes::from(r#"{"model":"gpt-3.5-turbo","messages":[{"role":"user","content":"hi"}]}"#),
            None,
        )
        .await;
        assert_eq!(response.status(), http::StatusCode::OK);
        let relayed = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let relayed: serde_json::Value = serde_json::from_slice(&relayed).unwrap();
        assert_eq!(relayed, upstream_body);

        // quota = ceil((10 + 20 * 4/3) * 0.75) = 28 for gpt-3.5-turbo at
        // group ratio 1.0
        let log = wait_for_log(&store).await;
        assert_eq!(log.quota, 28);
        assert_eq!(log.prompt_tokens, 10);
        assert_eq!(log.completion_tokens, 20);
        assert!(log.content.contains("model ratio 0.7500"));
        let user = store.user(1).await.unwrap().unwrap();
        assert_eq!(user.used_quota, 28);
    }

    #[tokio::test]
    async fn streaming_relays_chunks_and_counts_completion() {
        const SSE_BODY: &str = concat!(
            "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"created\":1,",
            "\"model\":\"gpt-3.5-turbo\",\"choices\":[{\"index\":0,",
            "\"delta\":{\"content\":\"hello world\"},\"finish_reason\":null}]}\n\n",
            "data: [DONE]\n\n"
        );
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                ([(CONTENT_TYPE, "text/event-stream")], SSE_BODY)
            }),
        );
        let (state, store) = seeded_state(serve(app).await).await;
        let token = store.token(1).await.unwrap().unwrap();

        let response = handle(
            state,
            RelayMode::ChatCompletions,
            auth_ctx(token),
            Bytes::from(
                r#"{"model":"gpt-3.5-turbo","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
            ),
            None,
        )
        .await;
        assert_eq!(response.status(), http::StatusCode::OK);
        let relayed = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(relayed.to_vec()).unwrap();
        assert!(text.contains("hello world"));
        assert!(text.contains("[DONE]"));

        let log = wait_for_log(&store).await;
        assert!(log.stream);
        assert_eq!(
            log.completion_tokens,
            crate::counter::count_text("hello world", "gpt-3.5-turbo")
        );
    }

    #[tokio::test]
    async fn upstream_error_refunds_preconsumed_quota() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                (
                    http::StatusCode::TOO_MANY_REQUESTS,
                    axum::Json(serde_json::json!({
                        "error": {"message": "slow down", "type": "rate_limit", "code": "rl"}
                    })),
                )
            }),
        );
        let (state, store) = seeded_state(serve(app).await).await;
        // shrink the user's balance so preconsume actually runs
        store
            .put_user(User {
                id: 1,
                username: "u".into(),
                group: "default".into(),
                quota: 1_000,
                used_quota: 0,
                is_admin: false,
            })
            .await;
        let token = store.token(1).await.unwrap().unwrap();

        let response = handle(
            state,
            RelayMode::ChatCompletions,
            auth_ctx(token),
            Bytes::from(r#"{"model":"gpt-3.5-turbo","messages":[{"role":"user","content":"hi"}]}"#),
            None,
        )
        .await;
        // upstream status is preserved in the canonical envelope
        assert_eq!(response.status(), http::StatusCode::TOO_MANY_REQUESTS);

        // the preconsumed amount flows back to the token
        for _ in 0..100 {
            if store.token(1).await.unwrap().unwrap().remaining_quota == 50_000 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("refund never landed");
    }
}
