use std::sync::atomic::AtomicBool;
use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    error_handling::HandleErrorLayer,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    BoxError, Extension, Router,
};
use tokio::net::TcpListener;
use tokio::signal;
use tower::{
    limit::GlobalConcurrencyLimitLayer, load_shed::LoadShedLayer, timeout::TimeoutLayer,
    ServiceBuilder,
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

mod auth;
mod cluster;
mod config;
mod counter;
mod error;
mod kv;
mod ledger;
mod model;
mod pricing;
mod providers;
mod registry;
mod relay;
mod schema;
mod store;
mod telemetry;

use crate::auth::AuthContext;
use crate::config::AppConfig;
use crate::kv::SharedKv;
use crate::ledger::QuotaLedger;
use crate::model::RelayMode;
use crate::pricing::Pricing;
use crate::registry::ChannelRegistry;
use crate::relay::dispatch::RacingClient;
use crate::relay::pipeline;
use crate::store::{MemStore, Store};

pub struct AppState {
    pub cfg: Arc<AppConfig>,
    pub store: Arc<dyn Store>,
    pub kv: Option<SharedKv>,
    pub ledger: Arc<QuotaLedger>,
    pub registry: Arc<ChannelRegistry>,
    pub pricing: Arc<Pricing>,
    pub racing: Arc<RacingClient>,
    /// Written only by the election task; relaxed reads everywhere else.
    pub is_master: Arc<AtomicBool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cfg = AppConfig::from_env()?;
    let metrics_handle = telemetry::init(&cfg)?;

    let kv = SharedKv::maybe_new(cfg.redis_url.as_deref()).await?;
    let store: Arc<dyn Store> = Arc::new(MemStore::new());
    let ledger = Arc::new(QuotaLedger::new(
        store.clone(),
        kv.clone(),
        cfg.pre_consumed_quota,
        cfg.batch_update_enabled,
    ));
    let registry = Arc::new(ChannelRegistry::new(store.clone(), kv.clone()));
    let racing = Arc::new(RacingClient::new(
        cfg.response_header_timeout(),
        cfg.relay_timeout(),
    )?);
    let is_master = Arc::new(AtomicBool::new(cfg.is_master_node));

    let state = Arc::new(AppState {
        store,
        kv: kv.clone(),
        ledger,
        registry,
        pricing: Arc::new(Pricing::new()),
        racing,
        is_master: is_master.clone(),
        cfg: Arc::new(cfg),
    });

    cluster::election::spawn(kv, &state.cfg, is_master);
    cluster::sync::spawn(state.clone());
    spawn_maintenance(state.clone());

    let governor = state.cfg.build_governor()?;
    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(governor)
        .layer(HandleErrorLayer::new(handle_layer_error))
        .layer(LoadShedLayer::new())
        .option_layer(
            state
                .cfg
                .relay_timeout()
                .map(|t| TimeoutLayer::new(t + Duration::from_secs(5))),
        )
        .option_layer(
            state
                .cfg
                .max_concurrency
                .filter(|v| *v > 0)
                .map(GlobalConcurrencyLimitLayer::new),
        )
        .into_inner();

    let relay_routes = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/engines/:model/embeddings", post(engine_embeddings))
        .route("/v1/moderations", post(moderations))
        .route("/v1/edits", post(edits))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::bearer_auth,
        ));

    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(move || async move { metrics_handle.render() }))
        .merge(relay_routes)
        .with_state(state.clone())
        .layer(middleware_stack);

    let addr: SocketAddr = state.cfg.listen_addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, instance_id = %state.cfg.instance_id, "starting relay gateway");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install signal handler");
        term.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("signal received, starting graceful shutdown");
}

/// Background maintenance: the batch accumulator flushes on every node; the
/// periodic channel index refresh runs only on the leader.
fn spawn_maintenance(state: Arc<AppState>) {
    let flusher = state.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(
            flusher.cfg.batch_update_interval_secs,
        ));
        loop {
            tick.tick().await;
            flusher.ledger.flush_batch().await;
        }
    });

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            if state.is_master.load(std::sync::atomic::Ordering::Relaxed) {
                if let Err(e) = state.registry.reload().await {
                    warn!(error = %e, "leader channel refresh failed");
                    continue;
                }
                // followers pick the rebuilt index up over pub/sub; the
                // origin tag keeps this node from reloading twice
                if let Some(kv) = &state.kv {
                    cluster::sync::publish_channel_update(kv, &state.cfg.instance_id).await;
                }
            }
        }
    });
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Response {
    pipeline::handle(state, RelayMode::ChatCompletions, auth, body, None).await
}

async fn completions(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Response {
    pipeline::handle(state, RelayMode::Completions, auth, body, None).await
}

async fn embeddings(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Response {
    pipeline::handle(state, RelayMode::Embeddings, auth, body, None).await
}

async fn engine_embeddings(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(model): Path<String>,
    body: Bytes,
) -> Response {
    pipeline::handle(state, RelayMode::Embeddings, auth, body, Some(model)).await
}

async fn moderations(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Response {
    pipeline::handle(state, RelayMode::Moderations, auth, body, None).await
}

async fn edits(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Response {
    pipeline::handle(state, RelayMode::Edits, auth, body, None).await
}

async fn handle_layer_error(err: BoxError) -> impl IntoResponse {
    if err.is::<tower::timeout::error::Elapsed>() {
        tracing::warn!("request timed out");
        metrics::counter!("middleware_events_total", "event" => "timeout").increment(1);
        return (StatusCode::GATEWAY_TIMEOUT, "upstream timed out");
    }
    if err.is::<tower::load_shed::error::Overloaded>() {
        tracing::warn!("shed request due to overload");
        metrics::counter!("middleware_events_total", "event" => "load_shed").increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "server overloaded");
    }
    tracing::error!(error = %err, "unhandled middleware error");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}
