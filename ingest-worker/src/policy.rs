//! # Requeue policy
//!
//! Decides how long a failed message waits before its next delivery, and
//! when it stops being retried.
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequeuePolicy {
    /// Maximum number of handler invocations per message.
    pub max_attempts: u16,
    /// Delay per past attempt when the handler does not ask for one.
    pub default_requeue_delay: Duration,
    /// Ceiling for any requeue delay, including handler-provided ones.
    pub max_requeue_delay: Duration,
}

impl RequeuePolicy {
    /// The broker delivered the message more often than we allow, after
    /// deliveries that timed out. It is dropped without being handled.
    pub fn is_exhausted(&self, attempts: u16) -> bool {
        attempts > self.max_attempts
    }

    /// A failure on this attempt abandons the message.
    pub fn is_last_attempt(&self, attempts: u16) -> bool {
        attempts >= self.max_attempts
    }

    /// Delay before redelivering a message that failed on attempt `attempts`.
    pub fn requeue_delay(&self, attempts: u16, preferred: Option<Duration>) -> Duration {
        preferred
            .unwrap_or_else(|| {
                self.default_requeue_delay
                    .saturating_mul(u32::from(attempts))
            })
            .min(self.max_requeue_delay)
    }
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            default_requeue_delay: Duration::ZERO,
            max_requeue_delay: Duration::from_secs(900),
        }
    }
}
