use async_trait::async_trait;
use common_broker::{Message, MessageId};
use common_types::EventBatch;
use metrics::counter;
use moka::sync::Cache;
use tracing::{debug, info, warn};

use crate::error::HandlerError;

/// Processes the body of one delivered message.
///
/// Messages are delivered at least once, so implementations must tolerate
/// seeing the same message again.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

/// Logs every record of a batch.
pub struct LogHandler {}

#[async_trait]
impl MessageHandler for LogHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        // Retrying cannot repair bytes, malformed messages are acknowledged.
        let batch = match EventBatch::from_slice(message.body()) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(id = %message.id(), "dropping malformed message: {}", e);
                counter!("worker_messages_malformed_total").increment(1);
                return Ok(());
            }
        };

        for record in &batch {
            info!(
                session_id = %record.session_id,
                label = %record.label,
                client_timestamp = record.client_timestamp,
                server_timestamp = ?record.server_timestamp,
                "{}",
                record.value
            );
            counter!("worker_records_processed_total", "label" => record.label.clone())
                .increment(1);
        }

        Ok(())
    }
}

/// Skips messages whose id was recently acknowledged, so that redeliveries
/// of a message whose FIN got lost are not processed twice.
pub struct Deduplicated<H> {
    inner: H,
    acknowledged: Cache<MessageId, ()>,
}

impl<H> Deduplicated<H> {
    pub fn new(inner: H, capacity: u64) -> Self {
        Self {
            inner,
            acknowledged: Cache::new(capacity),
        }
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for Deduplicated<H> {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let id = message.id();
        if self.acknowledged.contains_key(&id) {
            debug!(%id, attempts = message.attempts(), "skipping acknowledged message");
            counter!("worker_messages_duplicate_total").increment(1);
            return Ok(());
        }

        self.inner.handle(message).await?;
        self.acknowledged.insert(id, ());
        Ok(())
    }
}
