//! The log transport seam.
//!
//! Everything above this module talks to a partitioned, append-only log
//! through [`LogTransport`] and [`Subscription`]. Two implementations ship
//! with the crate: [`memory::MemoryLog`] for a single process (and tests) and
//! [`sqlite::SqliteLog`] for a log shared between processes through one file.

pub mod memory;
pub mod sqlite;

use std::collections::BTreeSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on records returned by a single poll.
pub const MAX_POLL_RECORDS: usize = 500;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("topic '{0}' not found")]
    TopicNotFound(String),
    #[error("partition {1} not found for topic '{0}'")]
    PartitionNotFound(String, u32),
    #[error("subscription closed")]
    SubscriptionClosed,
    #[error("append to '{topic}' failed: {reason}")]
    AppendFailed { topic: String, reason: String },
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// A record as stored in (and read back from) a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub topic: String,
    pub partition: u32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: String,
    pub headers: Vec<(String, String)>,
    /// Append time, epoch millis.
    pub timestamp: i64,
}

impl Record {
    /// First header with the given name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A record on its way into the log. The transport picks partition,
/// offset and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingRecord {
    pub topic: String,
    pub key: Option<String>,
    pub value: String,
    pub headers: Vec<(String, String)>,
}

impl OutgoingRecord {
    pub fn new(topic: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value: value.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Where an appended record landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: u32,
    pub offset: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub topic: String,
    pub partition: u32,
}

/// Starting position for a subscription with no committed group offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    Earliest,
    Latest,
}

/// Client side of an external partitioned log.
#[async_trait]
pub trait LogTransport: Send + Sync {
    /// Append one record. Unknown topics are created on first append.
    async fn append(&self, record: OutgoingRecord) -> Result<RecordMetadata, TransportError>;

    /// Create a topic. Returns `false` if it already existed.
    async fn create_topic(&self, name: &str, partitions: u32) -> Result<bool, TransportError>;

    /// Subscribe to every partition of `topic`. With a group, the start
    /// position is the group's committed offset and polling commits.
    ///
    /// One live subscription per group is assumed. Partitions are not
    /// balanced across members: two subscriptions in the same group each
    /// keep their own positions, both receive every record, and each
    /// overwrites the other's commits.
    async fn subscribe(
        &self,
        topic: &str,
        group: Option<&str>,
        reset: OffsetReset,
    ) -> Result<Box<dyn Subscription>, TransportError>;

    /// Manually assign partitions of an existing topic, positioned at the
    /// earliest offset. No group, no commits.
    async fn assign(
        &self,
        topic: &str,
        partitions: &[u32],
    ) -> Result<Box<dyn Subscription>, TransportError>;

    /// Partitions of `topic` in ascending order. Empty for unknown topics.
    async fn partitions_of(&self, topic: &str) -> Result<Vec<PartitionInfo>, TransportError>;

    /// Every topic, internal ones included.
    async fn list_topics(&self) -> Result<BTreeSet<String>, TransportError>;
}

/// A consumer position over a set of partitions. Released on drop.
#[async_trait]
pub trait Subscription: Send {
    fn topic(&self) -> &str;

    fn assignment(&self) -> Vec<u32>;

    /// Return available records, waiting up to `max_wait` for some to arrive.
    async fn poll(&mut self, max_wait: Duration) -> Result<Vec<Record>, TransportError>;

    async fn seek_to_beginning(&mut self, partitions: &[u32]) -> Result<(), TransportError>;

    async fn seek_to_end(&mut self, partitions: &[u32]) -> Result<(), TransportError>;

    /// Offsets outside the partition's range are clamped on the next read.
    async fn seek(&mut self, partition: u32, offset: i64) -> Result<(), TransportError>;

    async fn position(&mut self, partition: u32) -> Result<i64, TransportError>;
}

/// Key-hash partitioning, falling back to the caller's round-robin counter.
pub(crate) fn choose_partition(key: Option<&str>, partitions: u32, round_robin: u64) -> u32 {
    if partitions == 0 {
        return 0;
    }
    match key {
        Some(key) => {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            (hasher.finish() % partitions as u64) as u32
        }
        None => (round_robin % partitions as u64) as u32,
    }
}
