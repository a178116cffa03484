use std::convert::Infallible;
use std::future::ready;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, Method};
use axum::{
    routing::{get, post},
    Router,
};
use common_broker::Publisher;
use health::HealthRegistry;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::trace::TraceLayer;

use crate::config::GatewayConfig;
use crate::ingest;
use crate::time::TimeSource;

#[derive(Clone)]
pub struct State {
    pub publisher: Arc<dyn Publisher>,
    pub topic: Arc<str>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
    pub stamp_server_time: bool,
}

async fn index() -> &'static str {
    "ingest-gateway"
}

pub fn router<TZ: TimeSource + Send + Sync + 'static>(
    timesource: TZ,
    liveness: HealthRegistry,
    publisher: Arc<dyn Publisher>,
    config: &GatewayConfig,
) -> Router {
    let state = State {
        publisher,
        topic: Arc::from(config.nsq_topic.as_str()),
        timesource: Arc::new(timesource),
        stamp_server_time: config.stamp_server_time,
    };

    // Browser SDKs post from any origin.
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS, Method::PUT])
        .allow_headers([header::ORIGIN, header::CONTENT_TYPE])
        .allow_origin(AllowOrigin::any());

    let ingest_route = post(ingest::ingest)
        .options(ingest::options)
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_body_size));
    let ingest_route = match config.concurrency_limit {
        Some(limit) => ingest_route.layer::<_, Infallible>(ConcurrencyLimitLayer::new(limit)),
        None => ingest_route,
    };

    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route(&config.ingest_path(), ingest_route)
        .layer(RequestDecompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
