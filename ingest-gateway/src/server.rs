use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common_broker::nsq::{NsqConfig, NsqProducer};
use common_broker::Publisher;
use common_metrics::setup_metrics_routes;
use health::{ComponentStatus, HealthRegistry};
use tokio::net::TcpListener;

use crate::config::{GatewayConfig, ObservabilityConfig};
use crate::publisher::PrintPublisher;
use crate::router;

async fn create_publisher(
    config: &GatewayConfig,
    liveness: &HealthRegistry,
) -> anyhow::Result<Arc<dyn Publisher>> {
    if config.print_sink {
        // Print sink is only used for local debug, don't allow a container with it to run on prod
        liveness
            .register("print_sink".to_string(), Duration::from_secs(30))
            .report_status(ComponentStatus::Unhealthy);

        return Ok(Arc::new(PrintPublisher {}));
    }

    let nsq = NsqConfig {
        dial_timeout: config.dial_timeout(),
        ..Default::default()
    };
    // nsqd heartbeats keep the component alive between publishes.
    let publisher_liveness = liveness.register(
        "nsq_producer".to_string(),
        nsq.heartbeat_interval * 2 + Duration::from_secs(5),
    );
    let producer = NsqProducer::connect(
        &config.nsq_server,
        nsq,
        config.publish_timeout(),
        publisher_liveness,
    )
    .await?;

    Ok(Arc::new(producer))
}

pub async fn serve<F>(
    config: GatewayConfig,
    observability: ObservabilityConfig,
    listener: TcpListener,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let liveness = HealthRegistry::new("liveness");
    let publisher = create_publisher(&config, &liveness).await?;

    let app = router::router(crate::time::SystemTime {}, liveness, publisher, &config);
    // Installing a global recorder when the gateway is used as a library does not work well.
    let app = if observability.export_prometheus {
        setup_metrics_routes(app, "ingest-gateway")?
    } else {
        app
    };

    tracing::info!(
        "listening on {:?}, accepting batches on {}",
        listener.local_addr()?,
        config.ingest_path()
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("HTTP server graceful shutdown completed");
    Ok(())
}
