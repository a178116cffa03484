//! Client for nsqd's TCP protocol and nsqlookupd's HTTP discovery.

use std::time::Duration;

mod connection;
mod consumer;
mod lookup;
mod producer;
pub mod protocol;

pub use consumer::NsqSubscriber;
pub use producer::NsqProducer;
pub use protocol::ProtocolError;

/// Connection settings shared by producers and consumers.
#[derive(Debug, Clone)]
pub struct NsqConfig {
    /// Reported to nsqd in IDENTIFY, shows up in nsqadmin.
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub dial_timeout: Duration,
    /// nsqd sends a heartbeat at this interval and closes the connection
    /// after two unanswered ones.
    pub heartbeat_interval: Duration,
    /// Time nsqd waits for FIN or REQ before redelivering a message.
    /// `None` keeps the server default.
    pub msg_timeout: Option<Duration>,
    /// Largest RDY nsqd accepts on one connection, its `--max-rdy-count`.
    pub max_rdy_count: u32,
}

impl Default for NsqConfig {
    fn default() -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self {
            client_id: hostname.clone(),
            hostname,
            user_agent: concat!("telemetry-relay/", env!("CARGO_PKG_VERSION")).to_string(),
            dial_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            msg_timeout: None,
            max_rdy_count: 2500,
        }
    }
}
