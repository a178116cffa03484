use async_trait::async_trait;
use bytes::Bytes;
use common_broker::{BrokerError, Publisher};
use metrics::counter;
use tracing::info;

/// Logs batches instead of publishing them, for local development.
pub struct PrintPublisher {}

#[async_trait]
impl Publisher for PrintPublisher {
    async fn publish(&self, topic: &str, body: Bytes) -> Result<(), BrokerError> {
        info!(topic, "batch: {}", String::from_utf8_lossy(&body));
        counter!("ingest_batches_printed_total").increment(1);

        Ok(())
    }
}
