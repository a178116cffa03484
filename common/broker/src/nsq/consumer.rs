use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use metrics::gauge;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection::{connect, expect_ok, lossy, NsqConnection};
use super::lookup::lookup;
use super::protocol::{Command, Frame, ProtocolError, CLOSE_WAIT};
use super::NsqConfig;
use crate::message::Response;
use crate::{validate_name, BrokerError, Delivery, MessageId, Subscriber, Subscription};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
/// How often RDY moves on when there are more connections than
/// `max_in_flight`.
const REDISTRIBUTE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
enum Discovery {
    Lookupd(Vec<String>),
    Nsqd(Vec<String>),
}

/// Consumes from every nsqd that has the topic.
///
/// nsqd instances are either discovered through nsqlookupd, polled
/// periodically, or given directly. The subscription's `max_in_flight` is
/// split across connections as their RDY count, and the sum of those counts
/// never exceeds it. With more connections than `max_in_flight`, only that
/// many connections hold RDY 1 at a time and the others take turns.
#[derive(Debug, Clone)]
pub struct NsqSubscriber {
    discovery: Discovery,
    config: NsqConfig,
    poll_interval: Duration,
    http: reqwest::Client,
}

impl NsqSubscriber {
    /// Discover nsqd instances through nsqlookupd HTTP addresses.
    pub fn with_lookupd(addresses: Vec<String>, config: NsqConfig) -> Self {
        Self::new(Discovery::Lookupd(addresses), config)
    }

    /// Connect to fixed nsqd TCP addresses.
    pub fn with_nsqd(addresses: Vec<String>, config: NsqConfig) -> Self {
        Self::new(Discovery::Nsqd(addresses), config)
    }

    fn new(discovery: Discovery, config: NsqConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.dial_timeout.max(Duration::from_secs(1)))
            .build()
            .unwrap_or_default();
        Self {
            discovery,
            config,
            poll_interval: DEFAULT_POLL_INTERVAL,
            http,
        }
    }

    /// How often nsqlookupd is polled for new nsqd instances, and lost
    /// connections are retried.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// nsqd addresses to connect to. With lookupd discovery, fails only when
    /// no nsqlookupd could be queried.
    async fn discover(&self, topic: &str) -> Result<Vec<String>, BrokerError> {
        let lookupds = match &self.discovery {
            Discovery::Nsqd(addresses) => return Ok(addresses.clone()),
            Discovery::Lookupd(addresses) => addresses,
        };

        let mut found = BTreeSet::new();
        let mut last_error = None;
        let mut answered = false;
        for lookupd in lookupds {
            match lookup(&self.http, lookupd, topic).await {
                Ok(addresses) => {
                    answered = true;
                    found.extend(addresses);
                }
                Err(e) => {
                    warn!("nsqlookupd {} query failed: {}", lookupd, e);
                    last_error = Some(e);
                }
            }
        }

        match (answered, last_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(found.into_iter().collect()),
        }
    }
}

#[async_trait]
impl Subscriber for NsqSubscriber {
    async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        max_in_flight: u32,
    ) -> Result<Subscription, BrokerError> {
        validate_name(topic)?;
        validate_name(channel)?;
        let subscribe_error = |reason: String| BrokerError::Subscribe {
            topic: topic.to_owned(),
            channel: channel.to_owned(),
            reason,
        };

        let addresses = self
            .discover(topic)
            .await
            .map_err(|e| subscribe_error(e.to_string()))?;
        if addresses.is_empty() {
            info!("no nsqd has topic {} yet, waiting for it to appear", topic);
        }

        let (deliveries, receiver) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let mut supervisor = Supervisor {
            subscriber: self.clone(),
            topic: topic.to_owned(),
            channel: channel.to_owned(),
            max_in_flight: max_in_flight.max(1),
            deliveries,
            stop: stop.clone(),
            connections: BTreeMap::new(),
            tasks: JoinSet::new(),
            rotation: 0,
        };
        supervisor.connect_all(addresses).await;

        if matches!(self.discovery, Discovery::Nsqd(_)) && supervisor.connections.is_empty() {
            return Err(subscribe_error("no nsqd could be reached".to_string()));
        }

        let task = tokio::spawn(supervisor.run());
        Ok(Subscription::new(receiver, stop, task))
    }
}

/// Owns the connections of one subscription: opens new ones as nsqd
/// instances appear and keeps the RDY counts balanced.
struct Supervisor {
    subscriber: NsqSubscriber,
    topic: String,
    channel: String,
    max_in_flight: u32,
    deliveries: mpsc::UnboundedSender<Delivery>,
    stop: CancellationToken,
    connections: BTreeMap<String, Handle>,
    tasks: JoinSet<String>,
    /// Start of the window of connections holding RDY when oversubscribed.
    rotation: usize,
}

/// The supervisor's side of one connection.
struct Handle {
    ready: watch::Sender<u32>,
    in_flight: Arc<AtomicUsize>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut poll = tokio::time::interval(self.subscriber.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await;
        let mut redistribute = tokio::time::interval(REDISTRIBUTE_INTERVAL);
        redistribute.set_missed_tick_behavior(MissedTickBehavior::Delay);
        redistribute.tick().await;

        loop {
            let oversubscribed = self.oversubscribed();
            tokio::select! {
                _ = self.stop.cancelled() => break,
                Some(finished) = self.tasks.join_next() => {
                    match finished {
                        Ok(addr) => warn!("lost connection to nsqd at {}", addr),
                        Err(e) => error!("nsqd connection task failed: {}", e),
                    }
                    self.connections.retain(|_, handle| !handle.ready.is_closed());
                    self.rebalance();
                }
                _ = poll.tick() => {
                    match self.subscriber.discover(&self.topic).await {
                        Ok(addresses) => self.connect_all(addresses).await,
                        Err(e) => warn!("nsqd discovery failed: {}", e),
                    }
                }
                _ = redistribute.tick(), if oversubscribed => self.rotate(),
            }
        }

        // Connections watch the same token, wait for them to drain.
        while let Some(finished) = self.tasks.join_next().await {
            if let Err(e) = finished {
                error!("nsqd connection task failed: {}", e);
            }
        }
    }

    async fn connect_all(&mut self, addresses: Vec<String>) {
        let mut added = false;
        for addr in addresses {
            if self.connections.contains_key(&addr) {
                continue;
            }
            match self.open(&addr).await {
                Ok(conn) => {
                    info!(
                        "subscribed to {}/{} on nsqd at {}",
                        self.topic, self.channel, addr
                    );
                    let (ready, ready_rx) = watch::channel(0);
                    let in_flight = Arc::new(AtomicUsize::new(0));
                    let connection = Connection {
                        addr: addr.clone(),
                        conn,
                        deliveries: self.deliveries.clone(),
                        ready: ready_rx,
                        in_flight: in_flight.clone(),
                        stop: self.stop.clone(),
                    };
                    self.tasks.spawn(connection.run());
                    self.connections.insert(addr, Handle { ready, in_flight });
                    added = true;
                }
                Err(e) => warn!("failed to subscribe on nsqd at {}: {}", addr, e),
            }
        }
        if added {
            self.rebalance();
        }
    }

    async fn open(&self, addr: &str) -> Result<NsqConnection, BrokerError> {
        let config = &self.subscriber.config;
        let mut conn = connect(addr, config).await?;
        conn.send(Command::Sub {
            topic: self.topic.clone(),
            channel: self.channel.clone(),
        })
        .await?;
        expect_ok(&mut conn, config.dial_timeout).await?;
        Ok(conn)
    }

    fn oversubscribed(&self) -> bool {
        u32::try_from(self.connections.len()).map_or(true, |n| n > self.max_in_flight)
    }

    /// Hand the RDY of the first connection in the window to the first one
    /// after it. A connection keeps its RDY while it has messages in flight.
    fn rotate(&mut self) {
        let leaving = self
            .rotation
            .checked_rem(self.connections.len())
            .and_then(|position| self.connections.values().nth(position));
        match leaving {
            Some(handle) if handle.in_flight.load(Ordering::Acquire) == 0 => {
                self.rotation = self.rotation.wrapping_add(1);
                self.rebalance();
            }
            _ => {}
        }
    }

    /// Push the current RDY counts, skipping connections whose count is
    /// unchanged.
    fn rebalance(&self) {
        gauge!("nsq_consumer_connections").set(self.connections.len() as f64);
        let max_rdy_count = self.subscriber.config.max_rdy_count;
        let counts = ready_counts(self.max_in_flight, self.connections.len(), self.rotation);
        for ((addr, handle), count) in self.connections.iter().zip(counts) {
            if handle.ready.is_closed() {
                debug!("connection to {} already gone", addr);
                continue;
            }
            let count = count.min(max_rdy_count);
            handle.ready.send_if_modified(|current| {
                let modified = *current != count;
                *current = count;
                modified
            });
        }
    }
}

/// RDY count per connection. Their sum is at most `max_in_flight`.
///
/// Up to `max_in_flight` connections the budget is split evenly. Past that,
/// `max_in_flight` consecutive connections starting at `rotation` get 1 and
/// the rest get 0.
fn ready_counts(max_in_flight: u32, connections: usize, rotation: usize) -> Vec<u32> {
    match u32::try_from(connections) {
        Ok(0) => Vec::new(),
        Ok(n) if n <= max_in_flight => {
            let base = max_in_flight / n;
            let remainder = max_in_flight % n;
            (0..n).map(|i| base + u32::from(i < remainder)).collect()
        }
        _ => {
            let active = usize::try_from(max_in_flight).unwrap_or(usize::MAX);
            let start = rotation % connections;
            (0..connections)
                .map(|i| u32::from((i + connections - start) % connections < active))
                .collect()
        }
    }
}

enum Event {
    Frame(Option<Result<Frame, ProtocolError>>),
    Response(Response),
    Ready(bool),
    Stop,
}

/// One subscribed nsqd connection: forwards messages as deliveries and
/// writes their responses back.
struct Connection {
    addr: String,
    conn: NsqConnection,
    deliveries: mpsc::UnboundedSender<Delivery>,
    ready: watch::Receiver<u32>,
    /// Messages read from nsqd and not yet finished or requeued.
    in_flight: Arc<AtomicUsize>,
    stop: CancellationToken,
}

impl Connection {
    async fn run(mut self) -> String {
        match self.serve().await {
            Ok(()) => debug!("closed nsqd connection to {}", self.addr),
            Err(e) => error!("nsqd connection to {} failed: {}", self.addr, e),
        }
        self.addr
    }

    async fn serve(&mut self) -> Result<(), BrokerError> {
        let (responder, mut responses) = mpsc::unbounded_channel();
        let mut outstanding: HashSet<MessageId> = HashSet::new();
        let mut closing = false;

        // nsqd starts every subscription at RDY 0.
        let mut sent = 0;
        let count = *self.ready.borrow_and_update();
        if count != sent {
            self.conn.send(Command::Rdy(count)).await?;
            sent = count;
        }

        loop {
            if closing && outstanding.is_empty() {
                return Ok(());
            }

            let event = tokio::select! {
                frame = self.conn.next() => Event::Frame(frame),
                Some(response) = responses.recv() => Event::Response(response),
                changed = self.ready.changed(), if !closing => Event::Ready(changed.is_ok()),
                _ = self.stop.cancelled(), if !closing => Event::Stop,
            };

            match event {
                Event::Frame(Some(Ok(frame))) if frame.is_heartbeat() => {
                    self.conn.send(Command::Nop).await?
                }
                Event::Frame(Some(Ok(Frame::Message(message)))) => {
                    outstanding.insert(message.id());
                    self.in_flight.store(outstanding.len(), Ordering::Release);
                    let delivery = Delivery::new(message, responder.clone());
                    if closing {
                        // Requeued through the responder.
                        drop(delivery);
                    } else if let Err(rejected) = self.deliveries.send(delivery) {
                        drop(rejected);
                    }
                }
                Event::Frame(Some(Ok(Frame::Response(body)))) if body == CLOSE_WAIT => {
                    debug!("nsqd at {} acknowledged close", self.addr)
                }
                Event::Frame(Some(Ok(Frame::Response(body)))) => {
                    debug!("nsqd at {} responded {}", self.addr, lossy(&body))
                }
                Event::Frame(Some(Ok(Frame::Error(body)))) => {
                    warn!("nsqd at {} reported {}", self.addr, lossy(&body))
                }
                Event::Frame(Some(Err(e))) => return Err(e.into()),
                Event::Frame(None) if closing => return Ok(()),
                Event::Frame(None) => return Err(BrokerError::ConnectionClosed),
                Event::Response(response) => {
                    let command = match response {
                        Response::Finish(id) => Command::Fin(id),
                        Response::Requeue(id, delay) => Command::Req(id, delay),
                        Response::Touch(id) => Command::Touch(id),
                    };
                    if response.resolves() {
                        outstanding.remove(&response.id());
                        self.in_flight.store(outstanding.len(), Ordering::Release);
                    }
                    self.conn.send(command).await?;
                }
                Event::Ready(true) => {
                    let count = *self.ready.borrow_and_update();
                    if count != sent {
                        self.conn.send(Command::Rdy(count)).await?;
                        sent = count;
                    }
                }
                Event::Ready(false) | Event::Stop => {
                    closing = true;
                    self.conn.send(Command::Rdy(0)).await?;
                    self.conn.send(Command::Cls).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_counts_split_max_in_flight() {
        assert_eq!(ready_counts(5, 1, 0), vec![5]);
        assert_eq!(ready_counts(5, 2, 0), vec![3, 2]);
        assert_eq!(ready_counts(6, 3, 7), vec![2, 2, 2]);
        assert!(ready_counts(5, 0, 0).is_empty());
    }

    #[test]
    fn ready_counts_rotate_when_connections_outnumber_max_in_flight() {
        assert_eq!(ready_counts(2, 4, 0), vec![1, 1, 0, 0]);
        assert_eq!(ready_counts(2, 4, 1), vec![0, 1, 1, 0]);
        assert_eq!(ready_counts(2, 4, 3), vec![1, 0, 0, 1]);
        assert_eq!(ready_counts(1, 3, 5), vec![0, 0, 1]);
    }

    #[test]
    fn ready_counts_never_exceed_max_in_flight() {
        for max_in_flight in 1..8u32 {
            for connections in 1..12 {
                for rotation in 0..connections {
                    let total: u32 = ready_counts(max_in_flight, connections, rotation)
                        .iter()
                        .sum();
                    let expected = max_in_flight.min(connections as u32);
                    assert_eq!(total, expected, "{max_in_flight} over {connections}");
                }
            }
        }
    }

    fn supervisor(
        max_in_flight: u32,
        connections: usize,
    ) -> (Supervisor, Vec<watch::Receiver<u32>>) {
        let mut supervisor = Supervisor {
            subscriber: NsqSubscriber::with_nsqd(Vec::new(), NsqConfig::default()),
            topic: "events".to_string(),
            channel: "worker".to_string(),
            max_in_flight,
            deliveries: mpsc::unbounded_channel().0,
            stop: CancellationToken::new(),
            connections: BTreeMap::new(),
            tasks: JoinSet::new(),
            rotation: 0,
        };
        let mut receivers = Vec::new();
        for i in 0..connections {
            let (ready, receiver) = watch::channel(0);
            let handle = Handle {
                ready,
                in_flight: Arc::new(AtomicUsize::new(0)),
            };
            supervisor.connections.insert(format!("nsqd-{i}:4150"), handle);
            receivers.push(receiver);
        }
        supervisor.rebalance();
        (supervisor, receivers)
    }

    fn counts(receivers: &[watch::Receiver<u32>]) -> Vec<u32> {
        receivers.iter().map(|ready| *ready.borrow()).collect()
    }

    #[tokio::test]
    async fn rotation_waits_for_the_active_connection_to_go_idle() {
        let (mut supervisor, receivers) = supervisor(1, 3);
        assert!(supervisor.oversubscribed());
        assert_eq!(counts(&receivers), vec![1, 0, 0]);

        let busy = supervisor.connections.values().next().unwrap().in_flight.clone();
        busy.store(1, Ordering::Release);
        supervisor.rotate();
        assert_eq!(counts(&receivers), vec![1, 0, 0]);

        busy.store(0, Ordering::Release);
        supervisor.rotate();
        assert_eq!(counts(&receivers), vec![0, 1, 0]);
        supervisor.rotate();
        supervisor.rotate();
        assert_eq!(counts(&receivers), vec![1, 0, 0]);
    }

    #[tokio::test]
    async fn rebalance_clamps_to_max_rdy_count() {
        let (mut supervisor, mut receivers) = supervisor(5000, 1);
        assert!(!supervisor.oversubscribed());
        assert_eq!(counts(&receivers), vec![2500]);
        assert_eq!(*receivers[0].borrow_and_update(), 2500);

        // Same count again, the connection is not woken up.
        supervisor.rebalance();
        assert!(!receivers[0].has_changed().unwrap());

        supervisor.max_in_flight = 10;
        supervisor.rebalance();
        assert!(receivers[0].has_changed().unwrap());
        assert_eq!(counts(&receivers), vec![10]);
    }

    #[tokio::test]
    async fn unreachable_nsqd_fails_the_subscription() {
        let subscriber = NsqSubscriber::with_nsqd(
            vec!["127.0.0.1:1".to_string()],
            NsqConfig {
                dial_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        );

        let result = subscriber.subscribe("events", "worker", 5).await;

        assert!(matches!(result, Err(BrokerError::Subscribe { .. })));
    }

    #[tokio::test]
    async fn unreachable_lookupd_fails_the_subscription() {
        let subscriber = NsqSubscriber::with_lookupd(
            vec!["127.0.0.1:1".to_string()],
            NsqConfig {
                dial_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        );

        let result = subscriber.subscribe("events", "worker", 5).await;

        assert!(matches!(result, Err(BrokerError::Subscribe { .. })));
    }
}
