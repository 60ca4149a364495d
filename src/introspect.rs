//! Topic listing and per-partition offset ranges.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::transport::{LogTransport, TransportError};

/// Topics whose names start with this belong to the transport itself.
pub const INTERNAL_TOPIC_PREFIX: &str = "__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionRange {
    pub partition: u32,
    pub begin_offset: i64,
    pub end_offset: i64,
    pub message_count: i64,
}

impl PartitionRange {
    pub fn new(partition: u32, begin_offset: i64, end_offset: i64) -> Self {
        Self {
            partition,
            begin_offset,
            end_offset,
            message_count: end_offset - begin_offset,
        }
    }
}

pub fn is_internal(topic: &str) -> bool {
    topic.starts_with(INTERNAL_TOPIC_PREFIX)
}

/// Every non-internal topic.
pub async fn list_topics(transport: &dyn LogTransport) -> Result<BTreeSet<String>, TransportError> {
    let mut topics = transport.list_topics().await?;
    topics.retain(|t| !is_internal(t));
    Ok(topics)
}

/// Offset range of each partition, ascending by partition. Unknown topics
/// have no partitions and give an empty list.
pub async fn topic_info(
    transport: &dyn LogTransport,
    topic: &str,
) -> Result<Vec<PartitionRange>, TransportError> {
    let partitions: Vec<u32> = transport
        .partitions_of(topic)
        .await?
        .into_iter()
        .map(|p| p.partition)
        .collect();
    if partitions.is_empty() {
        return Ok(Vec::new());
    }

    let mut subscription = transport.assign(topic, &partitions).await?;
    subscription.seek_to_end(&partitions).await?;
    let mut ranges = Vec::with_capacity(partitions.len());
    for &partition in &partitions {
        let end = subscription.position(partition).await?;
        subscription.seek_to_beginning(&[partition]).await?;
        let begin = subscription.position(partition).await?;
        ranges.push(PartitionRange::new(partition, begin, end));
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::OutgoingRecord;
    use crate::transport::memory::MemoryLog;

    #[test]
    fn internal_prefix() {
        assert!(is_internal("__consumer_offsets"));
        assert!(!is_internal("_single"));
        assert!(!is_internal("math-requests"));
    }

    #[tokio::test]
    async fn internal_topics_are_hidden() {
        let log = MemoryLog::new(1);
        log.create_topic("__consumer_offsets", 1).await.unwrap();
        log.create_topic("math-requests", 1).await.unwrap();
        let topics = list_topics(&log).await.unwrap();
        assert_eq!(topics.into_iter().collect::<Vec<_>>(), vec!["math-requests"]);
    }

    #[tokio::test]
    async fn empty_topic_has_zero_counts() {
        let log = MemoryLog::new(1);
        log.create_topic("empty", 2).await.unwrap();
        assert_eq!(
            topic_info(&log, "empty").await.unwrap(),
            vec![PartitionRange::new(0, 0, 0), PartitionRange::new(1, 0, 0)]
        );
    }

    #[tokio::test]
    async fn counts_follow_appends() {
        let log = MemoryLog::new(1);
        for _ in 0..4 {
            log.append(OutgoingRecord::new("t", "x")).await.unwrap();
        }
        let info = topic_info(&log, "t").await.unwrap();
        assert_eq!(info, vec![PartitionRange::new(0, 0, 4)]);
        assert_eq!(info[0].message_count, 4);
    }
}
