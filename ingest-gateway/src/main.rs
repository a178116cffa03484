use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use envconfig::Envconfig;
use opentelemetry::{KeyValue, Value};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{BatchConfig, RandomIdGenerator, Sampler, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use tokio::signal::unix::{signal, SignalKind};
use tracing::level_filters::LevelFilter;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use ingest_gateway::config::{GatewayConfig, ObservabilityConfig};
use ingest_gateway::server::serve;

/// Resolves on the first SIGTERM or SIGINT.
fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    let mut term = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    Ok(async move {
        tokio::select! {
            _ = term.recv() => {},
            _ = interrupt.recv() => {},
        };
        tracing::info!("shutdown signal received, draining requests");
    })
}

fn init_tracer(
    sink_url: &str,
    sampling_rate: f64,
    service_name: &str,
) -> Result<Tracer, opentelemetry::trace::TraceError> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                    sampling_rate,
                ))))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    Value::from(service_name.to_string()),
                )])),
        )
        .with_batch_config(BatchConfig::default())
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(sink_url)
                .with_timeout(Duration::from_secs(3)),
        )
        .install_batch(runtime::Tokio)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .context("usage: ingest-gateway <config.json>")?;
    let config = GatewayConfig::from_file(&path)?;
    let observability =
        ObservabilityConfig::init_from_env().context("invalid environment configuration")?;

    // Instantiate tracing outputs:
    //   - stdout, INFO by default (DEBUG with `debug: true`), RUST_LOG overrides
    //   - OpenTelemetry if enabled, for levels INFO and higher
    let default_level = if config.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy(),
    );
    let tracer = observability
        .otel_url
        .as_deref()
        .map(|url| {
            init_tracer(
                url,
                observability.otel_sampling_rate,
                &observability.otel_service_name,
            )
        })
        .transpose()
        .context("failed to start OpenTelemetry exporter")?;
    let otel_layer = tracer
        .map(OpenTelemetryLayer::new)
        .with_filter(LevelFilter::INFO);
    tracing_subscriber::registry()
        .with(log_layer)
        .with(otel_layer)
        .init();

    tracing::info!(
        topic = %config.nsq_topic,
        nsq_server = %config.nsq_server,
        "configuration loaded from {}",
        path
    );

    let listener = tokio::net::TcpListener::bind(config.address())
        .await
        .with_context(|| format!("could not bind {}", config.address()))?;
    serve(config, observability, listener, shutdown_signal()?).await
}
