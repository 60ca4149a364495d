//! Bounded reads of a topic, from the beginning or the last N per partition.
//!
//! "Last N" is a per-partition budget: every partition is positioned at
//! `end - N`, so a topic with P partitions can yield up to P * N records
//! before the result is cut to N. Records come back in the order the
//! transport delivers them, not merged by timestamp.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::transport::{LogTransport, Record, TransportError};

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Wait per poll.
    pub poll_timeout: Duration,
    /// Consecutive empty polls that end the scan.
    pub max_empty_polls: u32,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(1000),
            max_empty_polls: 3,
        }
    }
}

/// Read-only view of one record returned by a scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScannedMessage {
    pub topic: String,
    pub partition: u32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: String,
    pub timestamp: DateTime<Utc>,
}

impl From<Record> for ScannedMessage {
    fn from(record: Record) -> Self {
        Self {
            timestamp: DateTime::from_timestamp_millis(record.timestamp).unwrap_or_default(),
            topic: record.topic,
            partition: record.partition,
            offset: record.offset,
            key: record.key,
            value: record.value,
        }
    }
}

/// Read up to `max` records from `topic`.
///
/// Ends when `max` records are in hand or after `max_empty_polls` empty
/// polls in a row. A topic without partitions, or `max == 0`, yields an
/// empty result without touching the log. The subscription is released
/// on every return path.
pub async fn scan(
    transport: &dyn LogTransport,
    topic: &str,
    max: usize,
    from_beginning: bool,
    options: &ScanOptions,
) -> Result<Vec<ScannedMessage>, TransportError> {
    if max == 0 {
        return Ok(Vec::new());
    }
    let partitions: Vec<u32> = transport
        .partitions_of(topic)
        .await?
        .into_iter()
        .map(|p| p.partition)
        .collect();
    if partitions.is_empty() {
        debug!(topic, "no partitions, nothing to scan");
        return Ok(Vec::new());
    }

    let mut subscription = transport.assign(topic, &partitions).await?;
    if from_beginning {
        subscription.seek_to_beginning(&partitions).await?;
    } else {
        subscription.seek_to_end(&partitions).await?;
        let back = i64::try_from(max).unwrap_or(i64::MAX);
        for &partition in &partitions {
            let end = subscription.position(partition).await?;
            subscription
                .seek(partition, end.saturating_sub(back).max(0))
                .await?;
        }
    }

    let mut messages = Vec::new();
    let mut empty_polls = 0;
    while messages.len() < max && empty_polls < options.max_empty_polls {
        let records = subscription.poll(options.poll_timeout).await?;
        if records.is_empty() {
            empty_polls += 1;
            continue;
        }
        empty_polls = 0;
        messages.extend(records.into_iter().map(ScannedMessage::from));
    }
    messages.truncate(max);

    info!(
        topic,
        count = messages.len(),
        from_beginning,
        "read messages"
    );
    Ok(messages)
}

/// First record keyed `key`, reading every partition from its earliest
/// offset up to the end offset it had when the lookup began.
///
/// Records appended after that snapshot are never examined, so a topic that
/// keeps growing cannot hold the lookup open. `max_empty_polls` still bounds
/// a transport that stops delivering before the snapshot is reached.
pub async fn find_key(
    transport: &dyn LogTransport,
    topic: &str,
    key: &str,
    options: &ScanOptions,
) -> Result<Option<ScannedMessage>, TransportError> {
    let partitions: Vec<u32> = transport
        .partitions_of(topic)
        .await?
        .into_iter()
        .map(|p| p.partition)
        .collect();
    if partitions.is_empty() {
        return Ok(None);
    }

    let mut subscription = transport.assign(topic, &partitions).await?;
    subscription.seek_to_end(&partitions).await?;
    let mut ends = BTreeMap::new();
    for &partition in &partitions {
        ends.insert(partition, subscription.position(partition).await?);
    }
    subscription.seek_to_beginning(&partitions).await?;

    let mut empty_polls = 0;
    loop {
        let mut pending = false;
        for (&partition, &end) in &ends {
            if subscription.position(partition).await? < end {
                pending = true;
                break;
            }
        }
        if !pending || empty_polls >= options.max_empty_polls {
            debug!(topic, key, "key not found");
            return Ok(None);
        }

        let records = subscription.poll(options.poll_timeout).await?;
        if records.is_empty() {
            empty_polls += 1;
            continue;
        }
        empty_polls = 0;
        let found = records.into_iter().find(|r| {
            r.key.as_deref() == Some(key)
                && ends.get(&r.partition).is_some_and(|&end| r.offset < end)
        });
        if let Some(record) = found {
            debug!(
                topic,
                key,
                partition = record.partition,
                offset = record.offset,
                "key found"
            );
            return Ok(Some(record.into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::OutgoingRecord;
    use crate::transport::memory::MemoryLog;

    fn quick() -> ScanOptions {
        ScanOptions {
            poll_timeout: Duration::from_millis(20),
            max_empty_polls: 2,
        }
    }

    #[tokio::test]
    async fn zero_max_is_empty() {
        let log = MemoryLog::new(1);
        log.append(OutgoingRecord::new("t", "a")).await.unwrap();
        assert!(scan(&log, "t", 0, true, &quick()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_topic_is_empty() {
        let log = MemoryLog::new(1);
        assert!(
            scan(&log, "missing", 5, true, &quick())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn last_n_on_single_partition() {
        let log = MemoryLog::new(1);
        for i in 0..10 {
            log.append(OutgoingRecord::new("t", i.to_string()))
                .await
                .unwrap();
        }
        let messages = scan(&log, "t", 3, false, &quick()).await.unwrap();
        let offsets: Vec<i64> = messages.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![7, 8, 9]);
        assert_eq!(messages[0].value, "7");
    }

    #[tokio::test]
    async fn find_key_on_empty_topic_returns_at_once() {
        let log = MemoryLog::new(1);
        log.create_topic("t", 2).await.unwrap();
        let options = ScanOptions {
            poll_timeout: Duration::from_secs(5),
            max_empty_polls: 3,
        };
        let lookup = tokio::time::timeout(
            Duration::from_millis(500),
            find_key(&log, "t", "k", &options),
        );
        assert_eq!(lookup.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn find_key_ignores_records_past_the_snapshot() {
        let log = MemoryLog::new(1);
        log.append(OutgoingRecord::new("t", "old").with_key("a"))
            .await
            .unwrap();
        assert_eq!(find_key(&log, "t", "b", &quick()).await.unwrap(), None);

        log.append(OutgoingRecord::new("t", "new").with_key("b"))
            .await
            .unwrap();
        let found = find_key(&log, "t", "b", &quick()).await.unwrap().unwrap();
        assert_eq!((found.offset, found.value.as_str()), (1, "new"));
    }

    #[test]
    fn scanned_message_keeps_record_fields() {
        let message = ScannedMessage::from(Record {
            topic: "t".into(),
            partition: 2,
            offset: 5,
            key: Some("k".into()),
            value: "v".into(),
            headers: vec![],
            timestamp: 1_700_000_000_000,
        });
        assert_eq!(message.partition, 2);
        assert_eq!(message.key.as_deref(), Some("k"));
        assert_eq!(message.timestamp.timestamp_millis(), 1_700_000_000_000);
    }
}
