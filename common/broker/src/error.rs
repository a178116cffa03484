use thiserror::Error;

use crate::nsq::ProtocolError;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("timed out waiting for the broker")]
    Timeout,
    #[error("broker rejected the command: {0}")]
    Rejected(String),
    #[error("failed to subscribe to {topic}/{channel}: {reason}")]
    Subscribe {
        topic: String,
        channel: String,
        reason: String,
    },
    #[error("invalid topic or channel name: {0:?}")]
    InvalidName(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("lookup request failed: {0}")]
    Lookup(#[from] reqwest::Error),
}

impl BrokerError {
    /// Whether the broker could not be reached at all, as opposed to
    /// refusing what was sent.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            BrokerError::Connect { .. }
                | BrokerError::Unavailable(_)
                | BrokerError::Timeout
                | BrokerError::ConnectionClosed
                | BrokerError::Protocol(ProtocolError::Io(_))
        )
    }
}
