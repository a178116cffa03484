use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Broker-assigned message id, 16 ASCII bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; 16]);

impl MessageId {
    pub const LEN: usize = 16;

    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Ids generated from a counter, the way nsqd formats its GUIDs.
    pub(crate) fn from_sequence(sequence: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(format!("{sequence:016x}").as_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for MessageId {
    type Error = std::array::TryFromSliceError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        value.try_into().map(Self)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub(crate) id: MessageId,
    pub(crate) attempts: u16,
    pub(crate) timestamp: i64,
    pub(crate) body: Bytes,
}

impl Message {
    pub fn new(id: MessageId, attempts: u16, timestamp: i64, body: Bytes) -> Self {
        Self {
            id,
            attempts,
            timestamp,
            body,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Number of times the broker delivered this message, 1 on first delivery.
    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    /// Publish time in nanoseconds since epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Resolution of a delivery, sent back to the connection that received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Response {
    Finish(MessageId),
    Requeue(MessageId, Duration),
    /// Reset the broker-side timeout, the delivery stays unresolved.
    Touch(MessageId),
}

impl Response {
    pub(crate) fn id(&self) -> MessageId {
        match self {
            Response::Finish(id) | Response::Requeue(id, _) | Response::Touch(id) => *id,
        }
    }

    pub(crate) fn resolves(&self) -> bool {
        !matches!(self, Response::Touch(_))
    }
}

/// One delivery attempt of a message.
///
/// It must be resolved exactly once with [`Delivery::finish`] or
/// [`Delivery::requeue`], both consume it. Dropping an unresolved delivery
/// requeues the message without delay.
#[derive(Debug)]
pub struct Delivery {
    message: Message,
    responder: Option<mpsc::UnboundedSender<Response>>,
}

impl Delivery {
    pub(crate) fn new(message: Message, responder: mpsc::UnboundedSender<Response>) -> Self {
        Self {
            message,
            responder: Some(responder),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn attempts(&self) -> u16 {
        self.message.attempts
    }

    /// Acknowledge the message, the broker will not deliver it again.
    pub fn finish(mut self) {
        self.respond(Response::Finish(self.message.id));
    }

    /// Hand the message back to the broker, to be redelivered after `delay`.
    pub fn requeue(mut self, delay: Duration) {
        self.respond(Response::Requeue(self.message.id, delay));
    }

    /// Ask for more time before the broker considers this delivery lost.
    pub fn touch(&self) {
        if let Some(responder) = &self.responder {
            if responder.send(Response::Touch(self.message.id)).is_err() {
                debug!(id = %self.message.id, "dropping touch for closed connection");
            }
        }
    }

    fn respond(&mut self, response: Response) {
        let Some(responder) = self.responder.take() else {
            return;
        };
        if responder.send(response).is_err() {
            // The connection is gone, the broker will redeliver after its own timeout.
            debug!(id = %response.id(), "dropping response for closed connection");
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if self.responder.is_some() {
            self.respond(Response::Requeue(self.message.id, Duration::ZERO));
        }
    }
}

/// A stream of deliveries from one topic/channel pair.
pub struct Subscription {
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(
        deliveries: mpsc::UnboundedReceiver<Delivery>,
        stop: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            deliveries,
            stop,
            task,
        }
    }

    /// Next delivery, `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }

    /// Ask the broker to stop sending messages. Deliveries already handed out
    /// can still be resolved.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Stop the subscription and wait up to `grace` for outstanding
    /// deliveries to be resolved. Deliveries never taken from the
    /// subscription are requeued.
    pub async fn close(self, grace: Duration) {
        let Subscription {
            deliveries,
            stop,
            task,
        } = self;
        stop.cancel();
        drop(deliveries);

        let abort = task.abort_handle();
        match tokio::time::timeout(grace, task).await {
            Ok(Ok(())) => debug!("subscription closed"),
            Ok(Err(e)) => warn!("subscription task failed: {}", e),
            Err(_) => {
                warn!("subscription did not drain within {:?}, disconnecting", grace);
                abort.abort();
            }
        }
    }
}
