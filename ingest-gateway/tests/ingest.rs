use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use common_broker::{BrokerError, MemoryBroker, Publisher};
use flate2::write::GzEncoder;
use flate2::Compression;
use health::HealthRegistry;
use http_body_util::BodyExt;
use ingest_gateway::config::GatewayConfig;
use ingest_gateway::router::router;
use ingest_gateway::time::TimeSource;
use tower::ServiceExt; // for `oneshot`

const TOPIC: &str = "telemetry";

#[derive(Clone)]
struct FixedTime {
    millis: i64,
}

impl TimeSource for FixedTime {
    fn current_millis(&self) -> i64 {
        self.millis
    }
}

/// Fails every publish with the same error, counting attempts.
struct FailingPublisher {
    error: fn() -> BrokerError,
    calls: AtomicUsize,
}

impl FailingPublisher {
    fn new(error: fn() -> BrokerError) -> Arc<Self> {
        Arc::new(Self {
            error,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Publisher for FailingPublisher {
    async fn publish(&self, _topic: &str, _body: Bytes) -> Result<(), BrokerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err((self.error)())
    }
}

fn config(extra: serde_json::Value) -> GatewayConfig {
    let mut config = serde_json::json!({
        "app_key": "testkey",
        "app_port": "8080",
        "nsq_server": "127.0.0.1:4150",
        "nsq_topic": TOPIC,
    });
    if let (Some(base), Some(extra)) = (config.as_object_mut(), extra.as_object()) {
        base.extend(extra.clone());
    }
    GatewayConfig::from_slice(&serde_json::to_vec(&config).unwrap()).unwrap()
}

fn app(publisher: Arc<dyn Publisher>, config: &GatewayConfig) -> Router {
    router(
        FixedTime {
            millis: 1_700_000_000_000,
        },
        HealthRegistry::new("liveness"),
        publisher,
        config,
    )
}

fn post(uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

#[tokio::test]
async fn publishes_one_record_batch() {
    let broker = MemoryBroker::new();
    let app = app(Arc::new(broker.clone()), &config(serde_json::json!({})));

    let response = app
        .oneshot(post(
            "/api/testkey",
            r#"[ {"tsclient": 1, "sessid": "s", "value": "v", "label": "l"} ]"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        broker.published(TOPIC),
        vec![Bytes::from_static(
            br#"[{"tsclient":1,"sessid":"s","value":"v","label":"l"}]"#
        )]
    );
}

#[tokio::test]
async fn keeps_record_order_and_drops_unknown_fields() {
    let broker = MemoryBroker::new();
    let app = app(Arc::new(broker.clone()), &config(serde_json::json!({})));

    let response = app
        .oneshot(post(
            "/api/testkey",
            r#"[
                {"tsclient": 3, "tsserver": 9, "sessid": "a", "value": "1", "label": "x", "extra": true},
                {"tsclient": 1, "sessid": "a", "value": "2", "label": "y"},
                {"tsclient": 2, "sessid": "b", "value": "3", "label": "x"}
            ]"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        broker.published(TOPIC),
        vec![Bytes::from_static(
            br#"[{"tsclient":3,"tsserver":9,"sessid":"a","value":"1","label":"x"},{"tsclient":1,"sessid":"a","value":"2","label":"y"},{"tsclient":2,"sessid":"b","value":"3","label":"x"}]"#
        )]
    );
}

#[tokio::test]
async fn publishes_empty_batch() {
    let broker = MemoryBroker::new();
    let app = app(Arc::new(broker.clone()), &config(serde_json::json!({})));

    let response = app.oneshot(post("/api/testkey", "[]")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(broker.published(TOPIC), vec![Bytes::from_static(b"[]")]);
}

#[tokio::test]
async fn stamps_missing_server_time() {
    let broker = MemoryBroker::new();
    let app = app(
        Arc::new(broker.clone()),
        &config(serde_json::json!({"stamp_server_time": true})),
    );

    let response = app
        .oneshot(post(
            "/api/testkey",
            r#"[{"tsclient": 1, "sessid": "s", "value": "v", "label": "l"},
                {"tsclient": 2, "tsserver": 5, "sessid": "s", "value": "v", "label": "l"}]"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        broker.published(TOPIC),
        vec![Bytes::from_static(
            br#"[{"tsclient":1,"tsserver":1700000000000,"sessid":"s","value":"v","label":"l"},{"tsclient":2,"tsserver":5,"sessid":"s","value":"v","label":"l"}]"#
        )]
    );
}

#[tokio::test]
async fn rejects_invalid_json_without_publishing() {
    let broker = MemoryBroker::new();
    let app = app(Arc::new(broker.clone()), &config(serde_json::json!({})));

    for payload in [
        "not-json",
        r#"{"tsclient": 1}"#,
        r#"[{"tsclient": 1, "sessid": "s"}]"#,
        r#"[{"tsclient": "yesterday", "sessid": "s", "value": "v", "label": "l"}]"#,
    ] {
        let response = app
            .clone()
            .oneshot(post("/api/testkey", payload))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{payload}");
        let body = body_bytes(response).await;
        assert!(body.starts_with(b"JSON parsing error"), "{body:?}");
    }

    assert!(broker.published(TOPIC).is_empty());
}

#[tokio::test]
async fn unavailable_broker_is_retryable() {
    let publisher = FailingPublisher::new(|| BrokerError::Timeout);
    let app = app(publisher.clone(), &config(serde_json::json!({})));

    let response = app
        .oneshot(post(
            "/api/testkey",
            r#"[{"tsclient": 1, "sessid": "s", "value": "v", "label": "l"}]"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejected_publish_is_a_server_error() {
    let publisher =
        FailingPublisher::new(|| BrokerError::Rejected("E_PUB_FAILED topic full".to_string()));
    let app = app(publisher.clone(), &config(serde_json::json!({})));

    let response = app.oneshot(post("/api/testkey", "[]")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn accepts_gzip_bodies() {
    let broker = MemoryBroker::new();
    let app = app(Arc::new(broker.clone()), &config(serde_json::json!({})));

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(br#"[{"tsclient": 1, "sessid": "s", "value": "v", "label": "l"}]"#)
        .unwrap();
    let compressed = encoder.finish().unwrap();

    let mut request = post("/api/testkey", compressed);
    request
        .headers_mut()
        .insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        broker.published(TOPIC),
        vec![Bytes::from_static(
            br#"[{"tsclient":1,"sessid":"s","value":"v","label":"l"}]"#
        )]
    );
}

#[tokio::test]
async fn rejects_oversized_body() {
    let broker = MemoryBroker::new();
    let app = app(
        Arc::new(broker.clone()),
        &config(serde_json::json!({"max_body_size": 64})),
    );

    let record = r#"{"tsclient": 1, "sessid": "s", "value": "v", "label": "l"}"#;
    let payload = format!("[{}]", vec![record; 10].join(","));
    let response = app.oneshot(post("/api/testkey", payload)).await.unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(broker.published(TOPIC).is_empty());
}

#[tokio::test]
async fn answers_cors_preflight() {
    let broker = MemoryBroker::new();
    let app = app(Arc::new(broker.clone()), &config(serde_json::json!({})));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/api/testkey")
                .header(header::ORIGIN, "https://app.example.com")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    let methods = headers[header::ACCESS_CONTROL_ALLOW_METHODS]
        .to_str()
        .unwrap()
        .to_string();
    for method in ["GET", "POST", "OPTIONS", "PUT"] {
        assert!(methods.contains(method), "{methods}");
    }
    assert!(body_bytes(response).await.is_empty());

    // Plain OPTIONS is answered empty too.
    let response = app
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/api/testkey")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_bytes(response).await.is_empty());
    assert!(broker.published(TOPIC).is_empty());
}

#[tokio::test]
async fn cors_headers_on_ingest_response() {
    let broker = MemoryBroker::new();
    let app = app(Arc::new(broker), &config(serde_json::json!({})));

    let mut request = post("/api/testkey", "[]");
    request
        .headers_mut()
        .insert(header::ORIGIN, "https://app.example.com".parse().unwrap());
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
}

#[tokio::test]
async fn unknown_key_is_not_found() {
    let broker = MemoryBroker::new();
    let app = app(Arc::new(broker.clone()), &config(serde_json::json!({})));

    let response = app.oneshot(post("/api/otherkey", "[]")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(broker.published(TOPIC).is_empty());
}

#[tokio::test]
async fn liveness_without_components_is_unhealthy() {
    let broker = MemoryBroker::new();
    let app = app(Arc::new(broker), &config(serde_json::json!({})));

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/_liveness").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let response = app
        .oneshot(Request::builder().uri("/_readiness").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body_bytes(response).await[..], b"ingest-gateway");
}
