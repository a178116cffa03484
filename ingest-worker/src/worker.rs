use std::sync::Arc;
use std::time::{Duration, Instant};

use common_broker::{Delivery, Subscriber};
use health::HealthHandle;
use metrics::{counter, gauge, histogram};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::handler::MessageHandler;
use crate::policy::RequeuePolicy;

/// How often the dispatch loop reports liveness while waiting.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(10);

/// A worker to consume a topic/channel and spawn tasks to handle messages as they are delivered.
pub struct ConsumerWorker {
    topic: String,
    channel: String,
    /// Maximum number of messages delivered and not yet resolved.
    max_in_flight: u32,
    /// Decides between requeue and abandon when the handler fails.
    policy: RequeuePolicy,
    /// How long in-flight messages may take to complete on shutdown.
    shutdown_grace: Duration,
    handler: Arc<dyn MessageHandler>,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
}

impl ConsumerWorker {
    pub fn new(
        config: &WorkerConfig,
        handler: Arc<dyn MessageHandler>,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            topic: config.nsq_topic.clone(),
            channel: config.nsq_channel.clone(),
            max_in_flight: config.max_in_flight,
            policy: config.requeue_policy(),
            shutdown_grace: config.shutdown_grace(),
            handler,
            liveness,
        }
    }

    /// Subscribe and handle deliveries until `shutdown` is cancelled, then
    /// drain in-flight messages and disconnect.
    pub async fn run(
        &self,
        subscriber: &dyn Subscriber,
        shutdown: CancellationToken,
    ) -> Result<(), WorkerError> {
        let mut subscription = subscriber
            .subscribe(&self.topic, &self.channel, self.max_in_flight)
            .await
            .map_err(|source| WorkerError::Subscribe {
                topic: self.topic.clone(),
                channel: self.channel.clone(),
                source,
            })?;
        info!(
            topic = %self.topic,
            channel = %self.channel,
            max_in_flight = self.max_in_flight,
            "subscribed"
        );

        let permits = usize::try_from(self.max_in_flight).unwrap_or(usize::MAX);
        let semaphore = Arc::new(Semaphore::new(permits));
        let report_semaphore_utilization = || {
            gauge!("worker_saturation_percent")
                .set(1f64 - semaphore.available_permits() as f64 / permits as f64);
        };
        let mut liveness_ticker = tokio::time::interval(LIVENESS_INTERVAL);

        'dispatch: loop {
            report_semaphore_utilization();

            // Admission first: never take a delivery without a free slot.
            let permit = loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break 'dispatch,
                    _ = liveness_ticker.tick() => self.liveness.report_healthy(),
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => break permit,
                        Err(_) => break 'dispatch,
                    },
                }
            };

            let delivery = loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break 'dispatch,
                    _ = liveness_ticker.tick() => self.liveness.report_healthy(),
                    delivery = subscription.next() => break delivery,
                }
            };
            let Some(delivery) = delivery else {
                error!("subscription ended unexpectedly");
                break;
            };
            self.liveness.report_healthy();
            counter!("worker_messages_total").increment(1);

            let handler = self.handler.clone();
            let policy = self.policy.clone();
            tokio::spawn(async move {
                process_delivery(handler.as_ref(), &policy, delivery).await;
                drop(permit);
            });
        }

        info!("stopping subscription, waiting for in-flight messages");
        subscription.stop();
        let deadline = tokio::time::Instant::now() + self.shutdown_grace;

        // Every task holds a permit until its delivery is resolved.
        let in_flight = match tokio::time::timeout_at(
            deadline,
            semaphore.acquire_many(self.max_in_flight),
        )
        .await
        {
            Ok(Ok(_drained)) => 0,
            _ => permits.saturating_sub(semaphore.available_permits()),
        };
        // Both waits share one grace period.
        subscription
            .close(deadline.saturating_duration_since(tokio::time::Instant::now()))
            .await;

        if in_flight > 0 {
            return Err(WorkerError::ShutdownTimeout {
                grace: self.shutdown_grace,
                in_flight,
            });
        }
        info!("worker stopped");
        Ok(())
    }
}

/// Handle one delivery and resolve it according to the requeue policy.
#[instrument(skip_all, fields(id = %delivery.message().id(), attempts = delivery.attempts()))]
async fn process_delivery(handler: &dyn MessageHandler, policy: &RequeuePolicy, delivery: Delivery) {
    let attempts = delivery.attempts();
    if policy.is_exhausted(attempts) {
        warn!("abandoning message delivered {} times", attempts);
        counter!("worker_messages_abandoned_total").increment(1);
        delivery.finish();
        return;
    }

    let start = Instant::now();
    let result = handler.handle(delivery.message()).await;
    histogram!("worker_message_processing_seconds").record(start.elapsed().as_secs_f64());

    match result {
        Ok(()) => {
            debug!("message handled");
            counter!("worker_messages_completed_total").increment(1);
            delivery.finish();
        }
        Err(e) if policy.is_last_attempt(attempts) => {
            warn!("abandoning message after {} failed attempts: {}", attempts, e);
            counter!("worker_messages_abandoned_total").increment(1);
            delivery.finish();
        }
        Err(e) => {
            let delay = policy.requeue_delay(attempts, e.requeue_delay());
            warn!("requeueing message in {:?}: {}", delay, e);
            counter!("worker_messages_requeued_total").increment(1);
            delivery.requeue(delay);
        }
    }
}
