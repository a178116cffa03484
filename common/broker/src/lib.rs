//! Publish/subscribe broker access for the ingestion services.
//!
//! Services only see the [`Publisher`] and [`Subscriber`] traits. The NSQ
//! client in [`nsq`] is used in production, [`MemoryBroker`] provides the
//! same topic/channel semantics in process for tests.

use async_trait::async_trait;
use bytes::Bytes;

mod error;
mod memory;
mod message;
pub mod nsq;

pub use error::BrokerError;
pub use memory::{ChannelStats, MemoryBroker};
pub use message::{Delivery, Message, MessageId, Subscription};

/// Publishes message bodies to a topic. Implementations are shared between
/// request tasks and must accept concurrent calls.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, body: Bytes) -> Result<(), BrokerError>;
}

/// Opens a subscription on a topic/channel pair.
///
/// Every message published to the topic is copied to each of its channels,
/// and each channel copy is delivered to one of the channel's subscribers.
/// At most `max_in_flight` deliveries are outstanding per subscription.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        max_in_flight: u32,
    ) -> Result<Subscription, BrokerError>;
}

const MAX_NAME_LEN: usize = 64;
const EPHEMERAL_SUFFIX: &str = "#ephemeral";

/// Topic and channel names are 1 to 64 characters of `[.a-zA-Z0-9_-]`,
/// optionally followed by `#ephemeral`.
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    !base.is_empty()
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

pub fn validate_name(name: &str) -> Result<(), BrokerError> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(BrokerError::InvalidName(name.to_owned()))
    }
}
