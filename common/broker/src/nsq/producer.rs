use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use health::{ComponentStatus, HealthHandle};
use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::connection::{connect, lossy, NsqConnection};
use super::protocol::{Command, Frame, ProtocolError};
use super::NsqConfig;
use crate::{validate_name, BrokerError, Publisher};

const REQUEST_BUFFER: usize = 1024;
const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

struct PublishRequest {
    topic: String,
    body: Bytes,
    responder: oneshot::Sender<Result<(), BrokerError>>,
}

/// Publishes to a single nsqd.
///
/// All commands go through one connection task fed by a channel, so the
/// handle can be cloned and shared between request tasks. nsqd answers
/// commands in order, pending publishes are matched to responses FIFO.
#[derive(Clone)]
pub struct NsqProducer {
    requests: mpsc::Sender<PublishRequest>,
    publish_timeout: Duration,
}

impl NsqProducer {
    /// Connect to nsqd at `addr`. Failing to connect at startup is an error,
    /// later disconnections are retried in the background.
    pub async fn connect(
        addr: &str,
        config: NsqConfig,
        publish_timeout: Duration,
        liveness: HealthHandle,
    ) -> Result<Self, BrokerError> {
        let conn = connect(addr, &config).await?;
        info!("connected to nsqd at {}", addr);
        liveness.report_healthy();

        let (requests, receiver) = mpsc::channel(REQUEST_BUFFER);
        let task = ConnectionTask {
            addr: addr.to_owned(),
            config,
            liveness,
            requests: receiver,
            conn: Some(conn),
            pending: VecDeque::new(),
        };
        tokio::spawn(task.run());

        Ok(Self {
            requests,
            publish_timeout,
        })
    }
}

#[async_trait]
impl Publisher for NsqProducer {
    async fn publish(&self, topic: &str, body: Bytes) -> Result<(), BrokerError> {
        validate_name(topic)?;

        let (responder, response) = oneshot::channel();
        let request = PublishRequest {
            topic: topic.to_owned(),
            body,
            responder,
        };
        let exchange = async {
            self.requests
                .send(request)
                .await
                .map_err(|_| BrokerError::ConnectionClosed)?;
            response.await.map_err(|_| BrokerError::ConnectionClosed)?
        };

        timeout(self.publish_timeout, exchange)
            .await
            .map_err(|_| BrokerError::Timeout)?
    }
}

enum Event {
    Request(Option<PublishRequest>),
    Frame(Option<Result<Frame, ProtocolError>>),
    Reconnect,
}

struct ConnectionTask {
    addr: String,
    config: NsqConfig,
    liveness: HealthHandle,
    requests: mpsc::Receiver<PublishRequest>,
    conn: Option<NsqConnection>,
    pending: VecDeque<oneshot::Sender<Result<(), BrokerError>>>,
}

impl ConnectionTask {
    async fn run(mut self) {
        loop {
            let event = match self.conn.as_mut() {
                Some(conn) => tokio::select! {
                    request = self.requests.recv() => Event::Request(request),
                    frame = conn.next() => Event::Frame(frame),
                },
                None => tokio::select! {
                    request = self.requests.recv() => Event::Request(request),
                    _ = tokio::time::sleep(RECONNECT_INTERVAL) => Event::Reconnect,
                },
            };

            match event {
                Event::Request(Some(request)) => self.publish(request).await,
                Event::Request(None) => break,
                Event::Frame(frame) => self.handle_frame(frame).await,
                Event::Reconnect => {
                    if let Err(e) = self.reconnect().await {
                        warn!("failed to reconnect to nsqd at {}: {}", self.addr, e);
                    }
                }
            }
        }

        self.close().await;
    }

    async fn reconnect(&mut self) -> Result<(), BrokerError> {
        let conn = connect(&self.addr, &self.config).await?;
        info!("reconnected to nsqd at {}", self.addr);
        self.liveness.report_healthy();
        self.conn = Some(conn);
        Ok(())
    }

    async fn publish(&mut self, request: PublishRequest) {
        let PublishRequest {
            topic,
            body,
            responder,
        } = request;

        if self.conn.is_none() {
            if let Err(e) = self.reconnect().await {
                warn!("nsqd at {} is unreachable: {}", self.addr, e);
                respond(responder, Err(e));
                return;
            }
        }
        let Some(conn) = self.conn.as_mut() else {
            respond(responder, Err(BrokerError::ConnectionClosed));
            return;
        };

        match conn.send(Command::Pub { topic, body }).await {
            Ok(()) => self.pending.push_back(responder),
            Err(e) => {
                error!("failed to write to nsqd at {}: {}", self.addr, e);
                respond(responder, Err(BrokerError::Unavailable(e.to_string())));
                self.disconnect("write failed");
            }
        }
    }

    async fn handle_frame(&mut self, frame: Option<Result<Frame, ProtocolError>>) {
        match frame {
            Some(Ok(frame)) if frame.is_heartbeat() => {
                self.liveness.report_healthy();
                if let Some(conn) = self.conn.as_mut() {
                    if let Err(e) = conn.send(Command::Nop).await {
                        error!("failed to answer nsqd heartbeat: {}", e);
                        self.disconnect("heartbeat failed");
                    }
                }
            }
            Some(Ok(Frame::Response(_))) => {
                self.liveness.report_healthy();
                self.resolve(Ok(()));
            }
            Some(Ok(Frame::Error(body))) => {
                let reason = lossy(&body);
                warn!("nsqd rejected a publish: {}", reason);
                self.resolve(Err(BrokerError::Rejected(reason)));
            }
            Some(Ok(Frame::Message(message))) => {
                warn!("ignoring message {} on a producer connection", message.id());
            }
            Some(Err(e)) => {
                error!("failed to read from nsqd at {}: {}", self.addr, e);
                self.disconnect("read failed");
            }
            None => {
                warn!("nsqd at {} closed the connection", self.addr);
                self.disconnect("connection closed by nsqd");
            }
        }
    }

    fn resolve(&mut self, result: Result<(), BrokerError>) {
        match self.pending.pop_front() {
            Some(responder) => {
                if result.is_err() {
                    counter!("nsq_publish_errors_total").increment(1);
                }
                respond(responder, result);
            }
            None => warn!("nsqd response without a pending publish"),
        }
    }

    fn disconnect(&mut self, reason: &str) {
        self.conn = None;
        counter!("nsq_producer_disconnects_total").increment(1);
        self.liveness.report_status(ComponentStatus::Unhealthy);
        for responder in self.pending.drain(..) {
            respond(responder, Err(BrokerError::Unavailable(reason.to_owned())));
        }
    }

    /// Wait for the responses of publishes already written, then hang up.
    async fn close(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        while !self.pending.is_empty() {
            match timeout(self.config.dial_timeout, conn.next()).await {
                Ok(Some(Ok(frame))) if frame.is_heartbeat() => {}
                Ok(Some(Ok(Frame::Response(_)))) => self.resolve(Ok(())),
                Ok(Some(Ok(Frame::Error(body)))) => {
                    self.resolve(Err(BrokerError::Rejected(lossy(&body))))
                }
                Ok(Some(Ok(Frame::Message(_)))) => {}
                _ => break,
            }
        }
        for responder in self.pending.drain(..) {
            respond(responder, Err(BrokerError::ConnectionClosed));
        }
        debug!("closed nsqd connection to {}", self.addr);
    }
}

fn respond(responder: oneshot::Sender<Result<(), BrokerError>>, result: Result<(), BrokerError>) {
    if responder.send(result).is_err() {
        debug!("publish caller went away before the response");
    }
}
