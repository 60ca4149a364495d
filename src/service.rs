//! The caller-facing surface: calculate, fire off, produce, and inspect.
//!
//! Every operation here is transport-agnostic; the CLI and REPL are thin
//! wrappers that print what these return.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::broker::{BrokerConfig, BrokerError, CorrelationBroker};
use crate::consts::{JSON_TOPIC, STRING_TOPIC};
use crate::events::EventBus;
use crate::introspect::{self, PartitionRange};
use crate::scanner::{self, ScanOptions, ScannedMessage};
use crate::transport::{LogTransport, OutgoingRecord, RecordMetadata, TransportError};
use crate::wire::{Message, Reply, ReplyBody};

pub const STATUS_SUCCESS: &str = "SUCCESS";
pub const STATUS_SENT: &str = "Request sent";

/// Outcome of a synchronous calculation. Never an error: failures are
/// carried in `status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MathResponse {
    pub expression: String,
    pub result: Option<String>,
    pub status: String,
    pub correlation_id: Option<String>,
}

impl MathResponse {
    fn from_reply(expression: &str, reply: Reply) -> Self {
        let (result, status) = match reply.body {
            ReplyBody::Success { result, .. } => (Some(result), STATUS_SUCCESS.to_string()),
            ReplyBody::Failure { error } => (None, format!("ERROR: {error}")),
            ReplyBody::Raw(text) => (Some(text), STATUS_SUCCESS.to_string()),
        };
        Self {
            expression: expression.to_string(),
            result,
            status,
            correlation_id: Some(reply.correlation_id),
        }
    }

    fn from_error(expression: &str, correlation_id: &str, error: &BrokerError) -> Self {
        Self {
            expression: expression.to_string(),
            result: None,
            status: format!("ERROR: {error}"),
            correlation_id: Some(correlation_id.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

/// Handed back by a fire-and-forget calculation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncReceipt {
    pub status: String,
    pub expression: String,
    pub correlation_id: String,
    pub message: String,
}

/// Default destinations of [`Calculator::send_message`] and
/// [`Calculator::send_json`].
#[derive(Debug, Clone, PartialEq)]
pub struct MessageTopics {
    pub string: String,
    pub json: String,
}

impl Default for MessageTopics {
    fn default() -> Self {
        Self {
            string: STRING_TOPIC.to_string(),
            json: JSON_TOPIC.to_string(),
        }
    }
}

pub struct Calculator {
    broker: CorrelationBroker,
    transport: Arc<dyn LogTransport>,
    reply_timeout: Duration,
    scan_options: ScanOptions,
    topics: MessageTopics,
}

impl Calculator {
    /// Start a broker on `transport` and wrap it.
    pub async fn start(
        transport: Arc<dyn LogTransport>,
        config: BrokerConfig,
        reply_timeout: Duration,
        events: Arc<EventBus>,
    ) -> Result<Self, BrokerError> {
        let broker = CorrelationBroker::start(Arc::clone(&transport), config, events).await?;
        Ok(Self {
            broker,
            transport,
            reply_timeout,
            scan_options: ScanOptions::default(),
            topics: MessageTopics::default(),
        })
    }

    pub fn with_scan_options(mut self, options: ScanOptions) -> Self {
        self.scan_options = options;
        self
    }

    pub fn with_message_topics(mut self, topics: MessageTopics) -> Self {
        self.topics = topics;
        self
    }

    pub fn broker(&self) -> &CorrelationBroker {
        &self.broker
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    /// Send `expression` and wait for its result, up to `timeout` or the
    /// configured reply timeout.
    pub async fn calculate(&self, expression: &str, timeout: Option<Duration>) -> MathResponse {
        let correlation_id = CorrelationBroker::new_correlation_id();
        info!(correlation_id = %correlation_id, expression, "calculating");
        match self
            .broker
            .call_with_id(
                &correlation_id,
                expression,
                timeout.unwrap_or(self.reply_timeout),
            )
            .await
        {
            Ok(reply) => MathResponse::from_reply(expression, reply),
            Err(err) => {
                info!(correlation_id = %correlation_id, error = %err, "calculation failed");
                MathResponse::from_error(expression, &correlation_id, &err)
            }
        }
    }

    /// Send `expression` without waiting. Look the result up later with
    /// [`find_reply`](Self::find_reply).
    pub fn calculate_async(&self, expression: &str) -> AsyncReceipt {
        let correlation_id = self.broker.fire_and_forget(expression);
        AsyncReceipt {
            status: STATUS_SENT.to_string(),
            expression: expression.to_string(),
            correlation_id,
            message: format!(
                "Check the {} topic for results",
                self.broker.config().reply_topic
            ),
        }
    }

    /// Append a plain message to any topic.
    pub async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        message: &str,
    ) -> Result<RecordMetadata, TransportError> {
        let mut record = OutgoingRecord::new(topic, message);
        if let Some(key) = key {
            record = record.with_key(key);
        }
        let metadata = self.transport.append(record).await?;
        info!(
            topic,
            partition = metadata.partition,
            offset = metadata.offset,
            "message sent"
        );
        Ok(metadata)
    }

    /// Send plain text to the string topic. Returns once the record is
    /// appended.
    pub async fn send_message(
        &self,
        key: Option<&str>,
        message: &str,
    ) -> Result<RecordMetadata, TransportError> {
        self.send(&self.topics.string, key, message).await
    }

    /// Wrap `content` in a new [`Message`] and append it to the JSON topic,
    /// keyed by the message id.
    pub async fn send_json(
        &self,
        content: &str,
        sender: &str,
    ) -> Result<(Message, RecordMetadata), TransportError> {
        let message = Message::new(content, sender);
        let record = message
            .to_record(&self.topics.json)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        let metadata = self.transport.append(record).await?;
        info!(
            topic = %self.topics.json,
            id = %message.id,
            offset = metadata.offset,
            "JSON message sent"
        );
        Ok((message, metadata))
    }

    /// Look up the reply keyed `correlation_id` among the replies already
    /// on the reply stream.
    pub async fn find_reply(&self, correlation_id: &str) -> Result<Option<Reply>, TransportError> {
        let reply_topic = &self.broker.config().reply_topic;
        let found = scanner::find_key(
            self.transport.as_ref(),
            reply_topic,
            correlation_id,
            &self.scan_options,
        )
        .await?;
        Ok(found.map(|m| Reply {
            correlation_id: correlation_id.to_string(),
            body: ReplyBody::parse(&m.value),
        }))
    }

    pub async fn list_topics(&self) -> Result<BTreeSet<String>, TransportError> {
        introspect::list_topics(self.transport.as_ref()).await
    }

    pub async fn topic_info(&self, topic: &str) -> Result<Vec<PartitionRange>, TransportError> {
        introspect::topic_info(self.transport.as_ref(), topic).await
    }

    pub async fn read_messages(
        &self,
        topic: &str,
        max: usize,
        from_beginning: bool,
    ) -> Result<Vec<ScannedMessage>, TransportError> {
        scanner::scan(
            self.transport.as_ref(),
            topic,
            max,
            from_beginning,
            &self.scan_options,
        )
        .await
    }

    /// Wait until every `calculate_async` request has been appended.
    pub async fn flush(&self) {
        self.broker.flush().await;
    }

    pub async fn shutdown(&self) {
        self.broker.shutdown().await;
    }
}
