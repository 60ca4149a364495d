//! Synchronous calls over the request and reply streams.
//!
//! One [`CorrelationBroker`] owns one [`WaiterRegistry`] and one background
//! listener. The listener holds the only subscription to the reply stream
//! and routes each reply to the waiter registered under the reply's key.
//! Callers never touch the subscription; they register, append, and wait
//! on their own oneshot receiver.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::consts::{DEFAULT_PARTITIONS, DEFAULT_REPLY_GROUP, REPLY_TOPIC, REQUEST_TOPIC};
use crate::events::{Event, EventBus};
use crate::registry::{RegistryError, WaiterRegistry};
use crate::transport::{LogTransport, OffsetReset, Record, TransportError};
use crate::wire::{Reply, Request};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("no reply for '{correlation_id}' within {timeout:?}")]
    Timeout {
        correlation_id: String,
        timeout: Duration,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("reply listener lost: {0}")]
    ListenerLost(String),
    #[error("correlation id '{0}' is already in flight")]
    DuplicateCorrelationId(String),
    #[error("broker is shut down")]
    ShutDown,
}

impl From<RegistryError> for BrokerError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Duplicate(id) => BrokerError::DuplicateCorrelationId(id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub request_topic: String,
    pub reply_topic: String,
    /// Consumer group for the reply listener. With a group, a resubscribe
    /// resumes where the lost subscription stopped.
    pub reply_group: Option<String>,
    /// Partition count used when the broker creates its topics.
    pub partitions: u32,
    /// Longest single wait on the reply subscription.
    pub poll_interval: Duration,
    /// Pause before resubscribing after the listener fails.
    pub resubscribe_backoff: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            request_topic: REQUEST_TOPIC.to_string(),
            reply_topic: REPLY_TOPIC.to_string(),
            reply_group: Some(DEFAULT_REPLY_GROUP.to_string()),
            partitions: DEFAULT_PARTITIONS,
            poll_interval: Duration::from_millis(100),
            resubscribe_backoff: Duration::from_millis(200),
        }
    }
}

/// Removes the waiter on every exit path of a call, including the caller
/// dropping the future.
struct WaiterGuard<'a> {
    registry: &'a WaiterRegistry,
    correlation_id: &'a str,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.registry.cancel(self.correlation_id);
    }
}

pub struct CorrelationBroker {
    transport: Arc<dyn LogTransport>,
    config: BrokerConfig,
    registry: Arc<WaiterRegistry>,
    ready: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
    /// Appends started by `fire_and_forget` that may still be running.
    sends: Mutex<Vec<JoinHandle<()>>>,
    events: Arc<EventBus>,
}

impl CorrelationBroker {
    /// Make sure both topics exist and spawn the reply listener.
    ///
    /// Returns before the listener is subscribed; calls wait for it.
    pub async fn start(
        transport: Arc<dyn LogTransport>,
        config: BrokerConfig,
        events: Arc<EventBus>,
    ) -> Result<Self, BrokerError> {
        for topic in [&config.request_topic, &config.reply_topic] {
            if transport.create_topic(topic, config.partitions).await? {
                info!(topic = %topic, partitions = config.partitions, "created topic");
            }
        }

        let registry = Arc::new(WaiterRegistry::new());
        let (ready_tx, ready_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let listener = tokio::spawn(listen(
            Arc::clone(&transport),
            config.clone(),
            Arc::clone(&registry),
            ready_tx,
            shutdown_rx,
            Arc::clone(&events),
        ));

        Ok(Self {
            transport,
            config,
            registry,
            ready: ready_rx,
            shutdown: shutdown_tx,
            listener: Mutex::new(Some(listener)),
            sends: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn new_correlation_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Number of calls currently waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the listener is subscribed. `false` if that did not
    /// happen within `within` or the broker shut down.
    pub async fn wait_ready(&self, within: Duration) -> bool {
        let mut ready = self.ready.clone();
        matches!(
            tokio::time::timeout(within, ready.wait_for(|r| *r))
                .await
                .map(|r| r.is_ok()),
            Ok(true)
        )
    }

    /// Send `payload` and wait up to `timeout` for its reply.
    pub async fn call(&self, payload: &str, timeout: Duration) -> Result<Reply, BrokerError> {
        let correlation_id = Self::new_correlation_id();
        self.call_with_id(&correlation_id, payload, timeout).await
    }

    /// Like [`call`](Self::call) with a caller-chosen id. A live id is
    /// refused, never overwritten.
    pub async fn call_with_id(
        &self,
        correlation_id: &str,
        payload: &str,
        timeout: Duration,
    ) -> Result<Reply, BrokerError> {
        if *self.shutdown.borrow() {
            return Err(BrokerError::ShutDown);
        }
        let deadline = Instant::now() + timeout;
        let timed_out = || BrokerError::Timeout {
            correlation_id: correlation_id.to_string(),
            timeout,
        };

        // Replies appended before the listener subscribes would be missed.
        let mut ready = self.ready.clone();
        match tokio::time::timeout_at(deadline, ready.wait_for(|r| *r))
            .await
            .map(|r| r.is_ok())
        {
            Ok(true) => {}
            Ok(false) => return Err(BrokerError::ShutDown),
            Err(_) => return Err(timed_out()),
        }

        let mut rx = self.registry.register(correlation_id, deadline, timeout)?;
        let _guard = WaiterGuard {
            registry: &self.registry,
            correlation_id,
        };

        let request = Request::new(correlation_id, payload, &self.config.reply_topic);
        let metadata = self
            .transport
            .append(request.to_record(&self.config.request_topic))
            .await?;
        debug!(
            correlation_id,
            topic = %metadata.topic,
            partition = metadata.partition,
            offset = metadata.offset,
            "request sent"
        );

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BrokerError::ShutDown),
            Err(_) => {
                if self.registry.cancel(correlation_id) {
                    debug!(correlation_id, "call timed out");
                    return Err(timed_out());
                }
                // The listener removed the waiter first; its send is already
                // done or about to happen.
                match rx.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(timed_out()),
                }
            }
        }
    }

    /// Append a request without waiting for anything. The reply can be
    /// found later on the reply stream under the returned id.
    pub fn fire_and_forget(&self, payload: &str) -> String {
        let correlation_id = Self::new_correlation_id();
        let request = Request::new(&correlation_id, payload, &self.config.reply_topic);
        let record = request.to_record(&self.config.request_topic);
        let transport = Arc::clone(&self.transport);
        let id = correlation_id.clone();

        let send = tokio::spawn(async move {
            match transport.append(record).await {
                Ok(metadata) => debug!(
                    correlation_id = %id,
                    partition = metadata.partition,
                    offset = metadata.offset,
                    "async request sent"
                ),
                Err(err) => error!(correlation_id = %id, error = %err, "async request failed"),
            }
        });
        if let Ok(mut sends) = self.sends.lock() {
            sends.retain(|h| !h.is_finished());
            sends.push(send);
        }

        correlation_id
    }

    /// Wait for every append started by `fire_and_forget` to finish.
    pub async fn flush(&self) {
        let sends = self
            .sends
            .lock()
            .map(|mut sends| std::mem::take(&mut *sends))
            .unwrap_or_default();
        for send in sends {
            if let Err(err) = send.await {
                warn!(error = %err, "async request task ended abnormally");
            }
        }
    }

    /// Stop the listener and fail every outstanding call with `ShutDown`.
    pub async fn shutdown(&self) {
        self.flush().await;
        self.shutdown.send_replace(true);
        let handle = self.listener.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "reply listener ended abnormally");
            }
        }
        let failed = self.registry.fail_all(|| BrokerError::ShutDown);
        if failed > 0 {
            info!(failed, "broker shut down with calls in flight");
        }
    }
}

impl Drop for CorrelationBroker {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn listen(
    transport: Arc<dyn LogTransport>,
    config: BrokerConfig,
    registry: Arc<WaiterRegistry>,
    ready: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
    events: Arc<EventBus>,
) {
    let topic = config.reply_topic.as_str();
    while !*shutdown.borrow() {
        let mut subscription = match transport
            .subscribe(topic, config.reply_group.as_deref(), OffsetReset::Latest)
            .await
        {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(topic, error = %err, "reply subscription failed");
                if pause(&mut shutdown, config.resubscribe_backoff).await {
                    break;
                }
                continue;
            }
        };

        ready.send_replace(true);
        info!(topic, "reply listener ready");
        events.emit(Event::ListenerReady {
            topic: topic.to_string(),
        });

        let lost = loop {
            tokio::select! {
                _ = shutdown.changed() => break None,
                polled = subscription.poll(config.poll_interval) => match polled {
                    Ok(records) => {
                        for record in &records {
                            dispatch(&registry, record);
                        }
                        let reaped = registry.reap_expired(Instant::now());
                        if reaped > 0 {
                            debug!(reaped, "expired waiters reaped");
                        }
                    }
                    Err(err) => break Some(err.to_string()),
                }
            }
        };

        ready.send_replace(false);
        drop(subscription);

        let Some(reason) = lost else { break };
        let failed_waiters = registry.fail_all(|| BrokerError::ListenerLost(reason.clone()));
        warn!(topic, reason = %reason, failed_waiters, "reply listener lost, resubscribing");
        events.emit(Event::ListenerLost {
            reason,
            failed_waiters,
        });
        if pause(&mut shutdown, config.resubscribe_backoff).await {
            break;
        }
    }
    ready.send_replace(false);
    debug!(topic, "reply listener stopped");
}

fn dispatch(registry: &WaiterRegistry, record: &Record) {
    let Some(reply) = Reply::from_record(record) else {
        debug!(partition = record.partition, offset = record.offset, "keyless reply dropped");
        return;
    };
    let correlation_id = reply.correlation_id.clone();
    if registry.resolve(&correlation_id, Ok(reply)) {
        debug!(correlation_id = %correlation_id, "reply delivered");
    } else {
        debug!(correlation_id = %correlation_id, "reply has no waiter, dropped");
    }
}

/// Sleep for `period`. `true` if shutdown was requested meanwhile.
pub(crate) async fn pause(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(period) => *shutdown.borrow(),
    }
}
