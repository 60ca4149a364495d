//! What travels on the request and reply streams.
//!
//! The correlation id is the record key, never part of the JSON body.
//! Requests carry the stream their reply belongs on in a header.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::transport::{OutgoingRecord, Record};

/// Header naming the stream a reply should be appended to.
pub const REPLY_TOPIC_HEADER: &str = "reply_topic";

/// Envelope fields accepted as the request text, in order of preference.
const PAYLOAD_FIELDS: &[&str] = &["expression", "payload"];

/// A calculation request. Immutable once appended.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub correlation_id: String,
    pub payload: String,
    pub reply_to: String,
    pub created_at: DateTime<Utc>,
}

impl Request {
    pub fn new(
        correlation_id: impl Into<String>,
        payload: impl Into<String>,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            payload: payload.into(),
            reply_to: reply_to.into(),
            created_at: Utc::now(),
        }
    }

    pub fn to_record(&self, topic: &str) -> OutgoingRecord {
        OutgoingRecord::new(topic, json!({ "expression": self.payload }).to_string())
            .with_key(&self.correlation_id)
            .with_header(REPLY_TOPIC_HEADER, &self.reply_to)
    }

    /// Decode a consumed request record.
    ///
    /// Keyless records get an id derived from their log position so the
    /// reply is still tagged with something unique.
    pub fn from_record(record: &Record, default_reply_to: &str) -> Self {
        let correlation_id = record.key.clone().unwrap_or_else(|| {
            format!("{}-{}-{}", record.topic, record.partition, record.offset)
        });
        Self {
            correlation_id,
            payload: extract_expression(&record.value),
            reply_to: record
                .header(REPLY_TOPIC_HEADER)
                .unwrap_or(default_reply_to)
                .to_string(),
            created_at: DateTime::from_timestamp_millis(record.timestamp)
                .unwrap_or_else(Utc::now),
        }
    }
}

/// Pull the request text out of a record value.
///
/// Accepts `{"expression": ..}` or `{"payload": ..}`; anything else,
/// including JSON without those fields, is taken literally.
pub fn extract_expression(value: &str) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(value) {
        for field in PAYLOAD_FIELDS {
            match map.get(*field) {
                Some(Value::String(s)) => return s.clone(),
                Some(Value::Number(n)) => return n.to_string(),
                _ => {}
            }
        }
    }
    value.to_string()
}

/// Body of a reply record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyBody {
    Success { expression: String, result: String },
    Failure { error: String },
    /// Anything that is not one of the envelopes above.
    Raw(String),
}

impl ReplyBody {
    /// Only JSON objects are envelopes; any other value, JSON strings
    /// included, is kept byte for byte.
    pub fn parse(value: &str) -> Self {
        match serde_json::from_str::<Value>(value) {
            Ok(object @ Value::Object(_)) => serde_json::from_value(object)
                .unwrap_or_else(|_| ReplyBody::Raw(value.to_string())),
            _ => ReplyBody::Raw(value.to_string()),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            ReplyBody::Success { expression, result } => {
                json!({ "expression": expression, "result": result }).to_string()
            }
            ReplyBody::Failure { error } => json!({ "error": error }).to_string(),
            ReplyBody::Raw(text) => text.clone(),
        }
    }
}

/// A reply as seen by the broker. Produced once per consumed request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub correlation_id: String,
    pub body: ReplyBody,
}

impl Reply {
    pub fn success(
        correlation_id: impl Into<String>,
        expression: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            body: ReplyBody::Success {
                expression: expression.into(),
                result: result.into(),
            },
        }
    }

    pub fn failure(correlation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            body: ReplyBody::Failure {
                error: error.into(),
            },
        }
    }

    pub fn to_record(&self, topic: &str) -> OutgoingRecord {
        OutgoingRecord::new(topic, self.body.encode()).with_key(&self.correlation_id)
    }

    /// `None` for keyless records, which cannot be correlated.
    pub fn from_record(record: &Record) -> Option<Self> {
        let correlation_id = record.key.clone()?;
        Some(Self {
            correlation_id,
            body: ReplyBody::parse(&record.value),
        })
    }

    /// The computed result, or the error text.
    pub fn outcome(&self) -> Result<&str, &str> {
        match &self.body {
            ReplyBody::Success { result, .. } => Ok(result.as_str()),
            ReplyBody::Failure { error } => Err(error.as_str()),
            ReplyBody::Raw(text) => Ok(text.as_str()),
        }
    }
}

/// A free-form message for the JSON topic, keyed by its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub content: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(content: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            sender: sender.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_record(&self, topic: &str) -> Result<OutgoingRecord, serde_json::Error> {
        Ok(OutgoingRecord::new(topic, serde_json::to_string(self)?).with_key(self.id.to_string()))
    }
}
