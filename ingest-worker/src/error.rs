use std::time::Duration;

use common_broker::BrokerError;
use thiserror::Error;

/// Enumeration of errors that stop the worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to subscribe to {topic}/{channel}: {source}")]
    Subscribe {
        topic: String,
        channel: String,
        #[source]
        source: BrokerError,
    },
    #[error("{in_flight} messages still in flight after the {grace:?} shutdown grace period")]
    ShutdownTimeout { grace: Duration, in_flight: usize },
}

/// A failed handler invocation. The message is requeued until it runs out of attempts.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    requeue_delay: Option<Duration>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            requeue_delay: None,
        }
    }

    /// Ask for a specific delay before the next attempt, instead of the policy's default.
    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = Some(delay);
        self
    }

    pub fn requeue_delay(&self) -> Option<Duration> {
        self.requeue_delay
    }
}
