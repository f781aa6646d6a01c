//! Tracing and metrics bootstrap: JSON logs with an env-driven filter,
//! optional OTLP span export, and the Prometheus recorder backing the
//! `/metrics` route.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{propagation::TraceContextPropagator, trace as sdktrace, Resource};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::AppConfig;

/// Installs the subscriber stack and the metrics recorder. Returns the
/// handle the `/metrics` route renders from.
pub fn init(cfg: &AppConfig) -> anyhow::Result<PrometheusHandle> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=warn,axum::rejection=trace"));
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    if let Some(otel) = build_otel_layer(cfg) {
        let fmt_layer = fmt::layer().with_target(false).json();
        tracing_subscriber::registry()
            .with(otel)
            .with(fmt_layer)
            .with(env_filter)
            .init();
    } else {
        let fmt_layer = fmt::layer().with_target(false).json();
        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(env_filter)
            .init();
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

fn build_otel_layer(
    cfg: &AppConfig,
) -> Option<OpenTelemetryLayer<tracing_subscriber::Registry, sdktrace::Tracer>> {
    let endpoint = cfg.otlp_endpoint.as_deref()?;
    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint.to_string())
        .build()
    {
        Ok(exporter) => exporter,
        Err(err) => {
            eprintln!("failed to build otlp exporter: {err}");
            return None;
        }
    };

    let resource = Resource::builder()
        .with_service_name(cfg.service_name.clone())
        .build();
    let provider = sdktrace::SdkTracerProvider::builder()
        .with_resource(resource)
        .with_batch_exporter(exporter)
        .build();

    let tracer = provider.tracer(cfg.service_name.clone());
    opentelemetry::global::set_tracer_provider(provider);
    Some(tracing_opentelemetry::layer().with_tracer(tracer))
}
