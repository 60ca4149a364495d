//! Consumes requests, evaluates them, and appends one reply per request.
//!
//! Evaluation errors become error replies. The only way a consumed request
//! goes unanswered is a reply append that keeps failing after every retry;
//! that is logged, counted and announced as a delivery loss, and the
//! request is not consumed again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::RngExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::pause;
use crate::consts::{DEFAULT_PARTITIONS, DEFAULT_WORKER_GROUP, REPLY_TOPIC, REQUEST_TOPIC};
use crate::evaluator;
use crate::events::{Event, EventBus};
use crate::transport::{LogTransport, OffsetReset, Record, RecordMetadata, TransportError};
use crate::wire::{Reply, Request};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub request_topic: String,
    /// Reply stream for requests that do not name one.
    pub reply_topic: String,
    pub group: String,
    pub partitions: u32,
    pub poll_interval: Duration,
    /// Total attempts per reply, the first one included.
    pub max_send_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub resubscribe_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            request_topic: REQUEST_TOPIC.to_string(),
            reply_topic: REPLY_TOPIC.to_string(),
            group: DEFAULT_WORKER_GROUP.to_string(),
            partitions: DEFAULT_PARTITIONS,
            poll_interval: Duration::from_millis(500),
            max_send_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            resubscribe_backoff: Duration::from_millis(500),
        }
    }
}

/// Running totals, shared between the worker task and its handle.
#[derive(Debug, Default)]
pub struct WorkerStats {
    consumed: AtomicU64,
    replied: AtomicU64,
    evaluation_errors: AtomicU64,
    delivery_losses: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub consumed: u64,
    pub replied: u64,
    pub evaluation_errors: u64,
    pub delivery_losses: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            consumed: self.consumed.load(Ordering::Relaxed),
            replied: self.replied.load(Ordering::Relaxed),
            evaluation_errors: self.evaluation_errors.load(Ordering::Relaxed),
            delivery_losses: self.delivery_losses.load(Ordering::Relaxed),
        }
    }
}

/// What became of one consumed request.
#[derive(Debug)]
pub enum Delivery {
    Replied {
        reply: Reply,
        metadata: RecordMetadata,
    },
    Lost {
        correlation_id: String,
        error: TransportError,
    },
}

/// Run one worker per group: members of a group do not split partitions,
/// so a second worker would answer every request again.
#[derive(Clone)]
pub struct ReplyWorker {
    transport: Arc<dyn LogTransport>,
    config: WorkerConfig,
    events: Arc<EventBus>,
    stats: Arc<WorkerStats>,
}

impl ReplyWorker {
    pub fn new(
        transport: Arc<dyn LogTransport>,
        config: WorkerConfig,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            transport,
            config,
            events,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    /// Start consuming in the background.
    pub fn spawn(&self) -> WorkerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = self.clone();
        let task = tokio::spawn(async move { worker.run(stop_rx).await });
        WorkerHandle {
            stop: stop_tx,
            task,
            stats: Arc::clone(&self.stats),
        }
    }

    /// Evaluate one request record and append its reply.
    pub async fn handle(&self, record: &Record) -> Delivery {
        self.stats.consumed.fetch_add(1, Ordering::Relaxed);
        let request = Request::from_record(record, &self.config.reply_topic);

        let reply = match evaluator::calculate(&request.payload) {
            Ok(result) => {
                debug!(
                    correlation_id = %request.correlation_id,
                    expression = %request.payload,
                    result = %result,
                    "evaluated"
                );
                Reply::success(&request.correlation_id, &request.payload, result)
            }
            Err(err) => {
                self.stats.evaluation_errors.fetch_add(1, Ordering::Relaxed);
                debug!(
                    correlation_id = %request.correlation_id,
                    expression = %request.payload,
                    error = %err,
                    "evaluation failed"
                );
                Reply::failure(&request.correlation_id, err.to_string())
            }
        };

        match self.deliver(&reply, &request.reply_to).await {
            Ok(metadata) => {
                self.stats.replied.fetch_add(1, Ordering::Relaxed);
                Delivery::Replied { reply, metadata }
            }
            Err(error) => {
                self.stats.delivery_losses.fetch_add(1, Ordering::Relaxed);
                warn!(
                    correlation_id = %request.correlation_id,
                    topic = %request.reply_to,
                    attempts = self.config.max_send_attempts,
                    error = %error,
                    "reply dropped after retries"
                );
                self.events.emit(Event::DeliveryLost {
                    correlation_id: request.correlation_id.clone(),
                    topic: request.reply_to.clone(),
                    error: error.to_string(),
                });
                Delivery::Lost {
                    correlation_id: request.correlation_id,
                    error,
                }
            }
        }
    }

    async fn deliver(&self, reply: &Reply, topic: &str) -> Result<RecordMetadata, TransportError> {
        let attempts = self.config.max_send_attempts.max(1);
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 1;
        loop {
            match self.transport.append(reply.to_record(topic)).await {
                Ok(metadata) => return Ok(metadata),
                Err(err) if attempt >= attempts => return Err(err),
                Err(err) => {
                    debug!(
                        correlation_id = %reply.correlation_id,
                        attempt,
                        error = %err,
                        "reply append failed, retrying"
                    );
                    tokio::time::sleep(with_jitter(backoff)).await;
                    backoff = (backoff * 2).min(self.config.max_backoff);
                    attempt += 1;
                }
            }
        }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        let topic = self.config.request_topic.as_str();
        let group = self.config.group.as_str();
        if let Err(err) = self
            .transport
            .create_topic(topic, self.config.partitions)
            .await
        {
            warn!(topic, error = %err, "could not create request topic");
        }

        while !*stop.borrow() {
            let mut subscription = match self
                .transport
                .subscribe(topic, Some(group), OffsetReset::Earliest)
                .await
            {
                Ok(subscription) => subscription,
                Err(err) => {
                    warn!(topic, group, error = %err, "request subscription failed");
                    if pause(&mut stop, self.config.resubscribe_backoff).await {
                        break;
                    }
                    continue;
                }
            };

            info!(topic, group, "worker consuming");
            self.events.emit(Event::WorkerStarted {
                topic: topic.to_string(),
                group: group.to_string(),
            });

            let failed = loop {
                tokio::select! {
                    _ = stop.changed() => break false,
                    polled = subscription.poll(self.config.poll_interval) => match polled {
                        Ok(records) => {
                            for record in &records {
                                self.handle(record).await;
                            }
                        }
                        Err(err) => {
                            warn!(topic, group, error = %err, "request subscription lost");
                            break true;
                        }
                    }
                }
            };
            drop(subscription);

            if !failed || pause(&mut stop, self.config.resubscribe_backoff).await {
                break;
            }
        }
        debug!(topic, group, "worker stopped");
    }
}

/// Up to half the base again, so retrying workers spread out.
fn with_jitter(base: Duration) -> Duration {
    let millis = base.as_millis() as u64;
    if millis == 0 {
        return base;
    }
    base + Duration::from_millis(rand::rng().random_range(0..=millis / 2))
}

/// Owns a running worker task.
pub struct WorkerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
    stats: Arc<WorkerStats>,
}

impl WorkerHandle {
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop consuming and wait for the task to exit.
    pub async fn stop(self) {
        self.stop.send_replace(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "worker ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_half_again() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let d = with_jitter(base);
            assert!(d >= base && d <= Duration::from_millis(150), "{d:?}");
        }
    }

    #[test]
    fn zero_backoff_has_no_jitter() {
        assert_eq!(with_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn default_config_matches_topics() {
        let config = WorkerConfig::default();
        assert_eq!(config.request_topic, "math-requests");
        assert_eq!(config.group, "math-consumer-group");
        assert_eq!(config.max_send_attempts, 3);
    }
}
