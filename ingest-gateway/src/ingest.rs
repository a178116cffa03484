use axum::extract::rejection::BytesRejection;
use axum::extract::State;
use axum::http::StatusCode;
use bytes::Bytes;
use common_types::EventBatch;
use metrics::{counter, histogram};
use tracing::{debug, error, instrument, warn, Span};

use crate::api::GatewayError;
use crate::router;

/// Accept one batch and publish it as a single broker message.
#[instrument(skip_all, fields(records))]
pub async fn ingest(
    state: State<router::State>,
    body: Result<Bytes, BytesRejection>,
) -> Result<StatusCode, GatewayError> {
    let result = publish_batch(&state, body).await;

    if let Err(err) = &result {
        counter!("ingest_batches_dropped_total", "cause" => err.cause()).increment(1);
    }
    result.map(|()| StatusCode::OK)
}

async fn publish_batch(
    state: &router::State,
    body: Result<Bytes, BytesRejection>,
) -> Result<(), GatewayError> {
    let body = body.map_err(|rejection| match rejection.status() {
        StatusCode::PAYLOAD_TOO_LARGE => GatewayError::PayloadTooLarge,
        _ => GatewayError::RequestDecoding(rejection.body_text()),
    })?;

    let mut batch = EventBatch::from_slice(&body).map_err(|e| {
        warn!("rejected batch: {}", e);
        GatewayError::RequestParsing(e)
    })?;

    Span::current().record("records", batch.len());
    counter!("ingest_batches_received_total").increment(1);
    counter!("ingest_records_received_total").increment(batch.len() as u64);
    histogram!("ingest_batch_size").record(batch.len() as f64);

    if state.stamp_server_time {
        batch.stamp_server_time(state.timesource.current_millis());
    }
    let payload = batch.to_bytes().map_err(GatewayError::Encoding)?;

    state
        .publisher
        .publish(&state.topic, payload)
        .await
        .map_err(|e| {
            error!("failed to publish batch to {}: {}", state.topic, e);
            GatewayError::from(e)
        })?;

    counter!("ingest_batches_published_total").increment(1);
    debug!("published batch of {} records", batch.len());

    Ok(())
}

/// CORS preflight without the preflight headers, answered empty.
pub async fn options() -> StatusCode {
    StatusCode::OK
}
