//! Consume telemetry batches from NSQ.
use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{routing::get, Router};
use common_broker::nsq::NsqSubscriber;
use common_metrics::{serve, setup_metrics_routes};
use envconfig::Envconfig;
use health::HealthRegistry;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use ingest_worker::config::{ServiceConfig, WorkerConfig};
use ingest_worker::handler::{Deduplicated, LogHandler, MessageHandler};
use ingest_worker::worker::ConsumerWorker;

fn setup_tracing(debug: bool) {
    let default_level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "ingest worker"
}

/// Cancel `token` on the first SIGTERM or SIGINT.
fn cancel_on_signal(token: CancellationToken) -> std::io::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = term.recv() => {},
            _ = interrupt.recv() => {},
        };
        info!("shutdown signal received");
        token.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .context("usage: ingest-worker <config.json>")?;
    let config = WorkerConfig::from_file(&path)?;
    let service = ServiceConfig::init_from_env().context("invalid environment configuration")?;

    setup_tracing(config.debug);
    info!(
        topic = %config.nsq_topic,
        channel = %config.nsq_channel,
        max_in_flight = config.max_in_flight,
        max_attempts = config.max_attempts,
        "configuration loaded from {}",
        path
    );

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness.register("worker".to_string(), Duration::from_secs(60));

    let health_router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let health_router = if service.export_prometheus {
        setup_metrics_routes(health_router, "ingest-worker")?
    } else {
        health_router
    };
    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone())?;

    let bind = format!("{}:{}", service.bind_host, service.bind_port);
    let server_shutdown = shutdown.clone().cancelled_owned();
    let health_server = tokio::task::spawn(async move {
        if let Err(e) = serve(health_router, &bind, server_shutdown).await {
            error!("health server on {} failed: {}", bind, e);
        }
    });

    let nsq = config.nsq_config();
    let subscriber = match config.nsqd_addresses() {
        Some(addresses) => NsqSubscriber::with_nsqd(addresses.to_vec(), nsq),
        None => NsqSubscriber::with_lookupd(vec![config.nsq_host_port.clone()], nsq)
            .with_poll_interval(config.lookupd_poll_interval()),
    };

    let handler: Arc<dyn MessageHandler> = if config.dedup_capacity > 0 {
        Arc::new(Deduplicated::new(LogHandler {}, config.dedup_capacity))
    } else {
        Arc::new(LogHandler {})
    };

    let worker = ConsumerWorker::new(&config, handler, worker_liveness);
    let result = worker.run(&subscriber, shutdown.clone()).await;

    // Also stops the health server when the worker exits on its own.
    shutdown.cancel();
    if let Err(e) = health_server.await {
        error!("health server task failed: {}", e);
    }
    result?;

    info!("ingest worker shut down");
    Ok(())
}
