use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::message::Response;
use crate::{
    validate_name, BrokerError, Delivery, Message, MessageId, Publisher, Subscriber, Subscription,
};

/// In-process broker with nsqd's topic and channel semantics: every channel
/// gets a copy of each message, the subscribers of a channel share its
/// messages, attempts are counted per delivery and requeued messages can be
/// deferred.
///
/// Messages published before a topic has any channel are kept and handed to
/// the first channel created.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    registry: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
    topics: HashMap<String, Topic>,
    sequence: u64,
}

#[derive(Default)]
struct Topic {
    /// Every body ever published, never trimmed. Only for test assertions.
    published: Vec<Bytes>,
    backlog: Vec<Message>,
    channels: HashMap<String, Arc<Channel>>,
}

#[derive(Default)]
struct Channel {
    state: Mutex<ChannelState>,
    notify: Notify,
}

#[derive(Default)]
struct ChannelState {
    queue: VecDeque<Message>,
    in_flight: HashMap<MessageId, Message>,
    deferred: usize,
    finished: u64,
    requeued: u64,
}

/// Point-in-time counters of a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Messages waiting to be delivered.
    pub depth: usize,
    pub in_flight: usize,
    /// Requeued messages waiting for their delay to elapse.
    pub deferred: usize,
    pub finished: u64,
    pub requeued: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bodies published to `topic` so far, in publish order.
    ///
    /// Test helper: the list keeps every body for the broker's lifetime, so
    /// the memory broker is not meant for long-running processes.
    pub fn published(&self, topic: &str) -> Vec<Bytes> {
        lock(&self.registry)
            .topics
            .get(topic)
            .map(|topic| topic.published.clone())
            .unwrap_or_default()
    }

    pub fn channel_stats(&self, topic: &str, channel: &str) -> Option<ChannelStats> {
        let channel = lock(&self.registry)
            .topics
            .get(topic)?
            .channels
            .get(channel)?
            .clone();
        let state = lock(&channel.state);
        Some(ChannelStats {
            depth: state.queue.len(),
            in_flight: state.in_flight.len(),
            deferred: state.deferred,
            finished: state.finished,
            requeued: state.requeued,
        })
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, topic: &str, body: Bytes) -> Result<(), BrokerError> {
        validate_name(topic)?;

        let (message, channels) = {
            let mut registry = lock(&self.registry);
            registry.sequence += 1;
            let id = MessageId::from_sequence(registry.sequence);
            let message = Message::new(id, 0, now_nanos(), body.clone());

            let topic = registry.topics.entry(topic.to_owned()).or_default();
            topic.published.push(body);
            if topic.channels.is_empty() {
                topic.backlog.push(message);
                return Ok(());
            }
            let channels: Vec<Arc<Channel>> = topic.channels.values().cloned().collect();
            (message, channels)
        };

        for channel in channels {
            channel.push(message.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl Subscriber for MemoryBroker {
    async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        max_in_flight: u32,
    ) -> Result<Subscription, BrokerError> {
        validate_name(topic)?;
        validate_name(channel)?;

        let channel = {
            let mut registry = lock(&self.registry);
            let topic = registry.topics.entry(topic.to_owned()).or_default();
            let backlog = std::mem::take(&mut topic.backlog);
            let channel = topic.channels.entry(channel.to_owned()).or_default().clone();
            lock(&channel.state).queue.extend(backlog);
            channel
        };

        let (deliveries, receiver) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let consumer = ChannelConsumer {
            channel,
            max_in_flight: usize::try_from(max_in_flight.max(1)).unwrap_or(usize::MAX),
            deliveries,
            stop: stop.clone(),
        };
        let task = tokio::spawn(consumer.run());

        Ok(Subscription::new(receiver, stop, task))
    }
}

impl Channel {
    fn push(&self, message: Message) {
        lock(&self.state).queue.push_back(message);
        self.notify.notify_waiters();
    }

    /// Pop the next message and mark it in flight, counting the attempt.
    fn take(&self) -> Option<Message> {
        let mut state = lock(&self.state);
        let mut message = state.queue.pop_front()?;
        message.attempts = message.attempts.saturating_add(1);
        state.in_flight.insert(message.id, message.clone());
        Some(message)
    }

    fn resolve(self: &Arc<Self>, response: Response) {
        let mut state = lock(&self.state);
        match response {
            Response::Finish(id) => {
                if state.in_flight.remove(&id).is_some() {
                    state.finished += 1;
                }
            }
            // No delivery timeouts in memory.
            Response::Touch(_) => {}
            Response::Requeue(id, delay) => {
                let Some(message) = state.in_flight.remove(&id) else {
                    return;
                };
                state.requeued += 1;
                if delay.is_zero() {
                    state.queue.push_back(message);
                    drop(state);
                    self.notify.notify_waiters();
                } else {
                    state.deferred += 1;
                    drop(state);
                    tokio::spawn(self.clone().defer(message, delay));
                }
            }
        }
    }

    async fn defer(self: Arc<Self>, message: Message, delay: Duration) {
        tokio::time::sleep(delay).await;
        lock(&self.state).deferred -= 1;
        self.push(message);
    }
}

/// Feeds one subscription from a channel, never holding more than
/// `max_in_flight` unresolved deliveries.
struct ChannelConsumer {
    channel: Arc<Channel>,
    max_in_flight: usize,
    deliveries: mpsc::UnboundedSender<Delivery>,
    stop: CancellationToken,
}

impl ChannelConsumer {
    async fn run(self) {
        let (responder, mut responses) = mpsc::unbounded_channel();
        let mut outstanding: HashSet<MessageId> = HashSet::new();
        let mut closing = false;

        loop {
            if closing && outstanding.is_empty() {
                break;
            }

            // Registered before draining the queue so a push in between is not missed.
            let notified = self.channel.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            while !closing && outstanding.len() < self.max_in_flight {
                let Some(message) = self.channel.take() else {
                    break;
                };
                outstanding.insert(message.id);
                if let Err(rejected) = self.deliveries.send(Delivery::new(message, responder.clone()))
                {
                    // Dropping the delivery requeues it.
                    drop(rejected);
                    closing = true;
                }
            }

            tokio::select! {
                Some(response) = responses.recv() => {
                    if response.resolves() {
                        outstanding.remove(&response.id());
                    }
                    self.channel.resolve(response);
                }
                _ = &mut notified, if !closing => {}
                _ = self.stop.cancelled(), if !closing => {
                    debug!("memory subscription stopping");
                    closing = true;
                }
                _ = self.deliveries.closed(), if !closing => {
                    closing = true;
                }
            }
        }
    }
}
