//! In-process partitioned log.
//!
//! Partitions are plain vectors behind a [`DashMap`]; pollers park on a
//! [`Notify`] that every append wakes. Also carries the fault injection
//! hooks the broker and worker tests lean on.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{
    LogTransport, MAX_POLL_RECORDS, OffsetReset, OutgoingRecord, PartitionInfo, Record,
    RecordMetadata, Subscription, TransportError, choose_partition,
};

/// An append-only log for a single partition.
#[derive(Debug, Default)]
struct PartitionLog {
    records: Vec<Record>,
    /// Earliest available offset (advances on truncation).
    start_offset: i64,
    /// Offset the next append gets.
    next_offset: i64,
}

impl PartitionLog {
    fn append(&mut self, mut record: Record) -> i64 {
        let offset = self.next_offset;
        record.offset = offset;
        self.records.push(record);
        self.next_offset += 1;
        offset
    }

    /// Read from `from`, clamped into `[start_offset, next_offset]`.
    fn read(&self, from: i64, max: usize) -> Vec<Record> {
        let from = from.clamp(self.start_offset, self.next_offset);
        let skip = (from - self.start_offset) as usize;
        self.records.iter().skip(skip).take(max).cloned().collect()
    }

    fn truncate_before(&mut self, offset: i64) {
        if offset <= self.start_offset {
            return;
        }
        let offset = offset.min(self.next_offset);
        let remove = (offset - self.start_offset) as usize;
        self.records.drain(..remove);
        self.start_offset = offset;
    }
}

struct Shared {
    topics: DashMap<String, Vec<PartitionLog>>,
    /// (group, topic, partition) -> next offset to consume
    group_offsets: DashMap<(String, String, u32), i64>,
    default_partitions: u32,
    appended: Notify,
    generation: AtomicU64,
    fail_appends: AtomicBool,
    round_robin: AtomicU64,
}

impl Shared {
    fn ensure_topic(&self, name: &str) {
        if !self.topics.contains_key(name) {
            self.topics
                .entry(name.to_string())
                .or_insert_with(|| new_partitions(self.default_partitions));
        }
    }

    fn partition_ids(&self, topic: &str) -> Option<Vec<u32>> {
        self.topics
            .get(topic)
            .map(|parts| (0..parts.len() as u32).collect())
    }

    /// `(start_offset, next_offset)` of one partition.
    fn bounds(&self, topic: &str, partition: u32) -> Result<(i64, i64), TransportError> {
        let parts = self
            .topics
            .get(topic)
            .ok_or_else(|| TransportError::TopicNotFound(topic.to_string()))?;
        let log = parts
            .get(partition as usize)
            .ok_or_else(|| TransportError::PartitionNotFound(topic.to_string(), partition))?;
        Ok((log.start_offset, log.next_offset))
    }
}

fn new_partitions(count: u32) -> Vec<PartitionLog> {
    (0..count).map(|_| PartitionLog::default()).collect()
}

/// A partitioned log living entirely in this process. Cheap to clone;
/// clones share the same topics.
#[derive(Clone)]
pub struct MemoryLog {
    shared: Arc<Shared>,
}

impl MemoryLog {
    /// Create an empty log. Auto-created topics get `default_partitions`.
    pub fn new(default_partitions: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                topics: DashMap::new(),
                group_offsets: DashMap::new(),
                default_partitions,
                appended: Notify::new(),
                generation: AtomicU64::new(0),
                fail_appends: AtomicBool::new(false),
                round_robin: AtomicU64::new(0),
            }),
        }
    }

    /// Make every append fail until switched off again.
    pub fn fail_appends(&self, fail: bool) {
        self.shared.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Break every live subscription: its next poll returns
    /// [`TransportError::SubscriptionClosed`]. New subscriptions are unaffected.
    pub fn sever_subscriptions(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.appended.notify_waiters();
    }

    /// Drop records before `offset` (retention).
    pub fn truncate_before(
        &self,
        topic: &str,
        partition: u32,
        offset: i64,
    ) -> Result<(), TransportError> {
        let mut parts = self
            .shared
            .topics
            .get_mut(topic)
            .ok_or_else(|| TransportError::TopicNotFound(topic.to_string()))?;
        let log = parts
            .get_mut(partition as usize)
            .ok_or_else(|| TransportError::PartitionNotFound(topic.to_string(), partition))?;
        log.truncate_before(offset);
        Ok(())
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl LogTransport for MemoryLog {
    async fn append(&self, record: OutgoingRecord) -> Result<RecordMetadata, TransportError> {
        if self.shared.fail_appends.load(Ordering::SeqCst) {
            return Err(TransportError::AppendFailed {
                topic: record.topic,
                reason: "append rejected by broker".to_string(),
            });
        }
        self.shared.ensure_topic(&record.topic);

        let metadata = {
            let mut parts = self
                .shared
                .topics
                .get_mut(&record.topic)
                .ok_or_else(|| TransportError::TopicNotFound(record.topic.clone()))?;
            let partition = choose_partition(
                record.key.as_deref(),
                parts.len() as u32,
                self.shared.round_robin.fetch_add(1, Ordering::Relaxed),
            );
            let log = parts.get_mut(partition as usize).ok_or_else(|| {
                TransportError::PartitionNotFound(record.topic.clone(), partition)
            })?;
            let timestamp = Utc::now().timestamp_millis();
            let offset = log.append(Record {
                topic: record.topic.clone(),
                partition,
                offset: 0,
                key: record.key,
                value: record.value,
                headers: record.headers,
                timestamp,
            });
            RecordMetadata {
                topic: record.topic,
                partition,
                offset,
                timestamp,
            }
        };

        self.shared.appended.notify_waiters();
        Ok(metadata)
    }

    async fn create_topic(&self, name: &str, partitions: u32) -> Result<bool, TransportError> {
        match self.shared.topics.entry(name.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(new_partitions(partitions));
                Ok(true)
            }
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: Option<&str>,
        reset: OffsetReset,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        self.shared.ensure_topic(topic);
        let ids = self.shared.partition_ids(topic).unwrap_or_default();

        let mut positions = BTreeMap::new();
        for partition in ids {
            let committed = group.and_then(|g| {
                self.shared
                    .group_offsets
                    .get(&(g.to_string(), topic.to_string(), partition))
                    .map(|offset| *offset)
            });
            let position = match committed {
                Some(offset) => offset,
                None => {
                    let (begin, end) = self.shared.bounds(topic, partition)?;
                    match reset {
                        OffsetReset::Earliest => begin,
                        OffsetReset::Latest => end,
                    }
                }
            };
            positions.insert(partition, position);
        }

        Ok(Box::new(MemorySubscription {
            shared: Arc::clone(&self.shared),
            topic: topic.to_string(),
            group: group.map(str::to_string),
            positions,
            generation: self.shared.generation.load(Ordering::SeqCst),
        }))
    }

    async fn assign(
        &self,
        topic: &str,
        partitions: &[u32],
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let mut positions = BTreeMap::new();
        for &partition in partitions {
            let (begin, _) = self.shared.bounds(topic, partition)?;
            positions.insert(partition, begin);
        }
        Ok(Box::new(MemorySubscription {
            shared: Arc::clone(&self.shared),
            topic: topic.to_string(),
            group: None,
            positions,
            generation: self.shared.generation.load(Ordering::SeqCst),
        }))
    }

    async fn partitions_of(&self, topic: &str) -> Result<Vec<PartitionInfo>, TransportError> {
        Ok(self
            .shared
            .partition_ids(topic)
            .unwrap_or_default()
            .into_iter()
            .map(|partition| PartitionInfo {
                topic: topic.to_string(),
                partition,
            })
            .collect())
    }

    async fn list_topics(&self) -> Result<BTreeSet<String>, TransportError> {
        Ok(self.shared.topics.iter().map(|e| e.key().clone()).collect())
    }
}

struct MemorySubscription {
    shared: Arc<Shared>,
    topic: String,
    group: Option<String>,
    positions: BTreeMap<u32, i64>,
    generation: u64,
}

impl MemorySubscription {
    fn ensure_live(&self) -> Result<(), TransportError> {
        if self.shared.generation.load(Ordering::SeqCst) != self.generation {
            return Err(TransportError::SubscriptionClosed);
        }
        Ok(())
    }

    fn ensure_assigned(&self, partition: u32) -> Result<(), TransportError> {
        if !self.positions.contains_key(&partition) {
            return Err(TransportError::PartitionNotFound(
                self.topic.clone(),
                partition,
            ));
        }
        Ok(())
    }

    fn fetch(&mut self) -> Vec<Record> {
        let Some(parts) = self.shared.topics.get(&self.topic) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (&partition, position) in self.positions.iter_mut() {
            let remaining = MAX_POLL_RECORDS - out.len();
            if remaining == 0 {
                break;
            }
            let Some(log) = parts.get(partition as usize) else {
                continue;
            };
            let batch = log.read(*position, remaining);
            if let Some(last) = batch.last() {
                *position = last.offset + 1;
            }
            out.extend(batch);
        }
        out
    }

    fn commit(&self) {
        if let Some(group) = &self.group {
            for (&partition, &offset) in &self.positions {
                self.shared
                    .group_offsets
                    .insert((group.clone(), self.topic.clone(), partition), offset);
            }
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn assignment(&self) -> Vec<u32> {
        self.positions.keys().copied().collect()
    }

    async fn poll(&mut self, max_wait: Duration) -> Result<Vec<Record>, TransportError> {
        let deadline = Instant::now() + max_wait;
        let shared = Arc::clone(&self.shared);
        loop {
            // Register interest before looking, so an append between the
            // fetch and the wait still wakes us.
            let notified = shared.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_live()?;
            let records = self.fetch();
            if !records.is_empty() {
                self.commit();
                return Ok(records);
            }

            if tokio::time::timeout_at(deadline, notified.as_mut())
                .await
                .is_err()
            {
                self.ensure_live()?;
                return Ok(Vec::new());
            }
        }
    }

    async fn seek_to_beginning(&mut self, partitions: &[u32]) -> Result<(), TransportError> {
        for &partition in partitions {
            self.ensure_assigned(partition)?;
            let (begin, _) = self.shared.bounds(&self.topic, partition)?;
            self.positions.insert(partition, begin);
        }
        Ok(())
    }

    async fn seek_to_end(&mut self, partitions: &[u32]) -> Result<(), TransportError> {
        for &partition in partitions {
            self.ensure_assigned(partition)?;
            let (_, end) = self.shared.bounds(&self.topic, partition)?;
            self.positions.insert(partition, end);
        }
        Ok(())
    }

    async fn seek(&mut self, partition: u32, offset: i64) -> Result<(), TransportError> {
        self.ensure_assigned(partition)?;
        self.positions.insert(partition, offset);
        Ok(())
    }

    async fn position(&mut self, partition: u32) -> Result<i64, TransportError> {
        self.positions
            .get(&partition)
            .copied()
            .ok_or_else(|| TransportError::PartitionNotFound(self.topic.clone(), partition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    fn keyed(topic: &str, key: &str, value: &str) -> OutgoingRecord {
        OutgoingRecord::new(topic, value).with_key(key)
    }

    #[tokio::test]
    async fn append_assigns_sequential_offsets() {
        let log = MemoryLog::new(1);
        let a = log.append(keyed("t", "k", "a")).await.unwrap();
        let b = log.append(keyed("t", "k", "b")).await.unwrap();
        assert_eq!((a.partition, a.offset), (0, 0));
        assert_eq!((b.partition, b.offset), (0, 1));
    }

    #[tokio::test]
    async fn append_auto_creates_topic() {
        let log = MemoryLog::new(4);
        log.append(OutgoingRecord::new("fresh", "x")).await.unwrap();
        assert!(log.list_topics().await.unwrap().contains("fresh"));
        assert_eq!(log.partitions_of("fresh").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn create_topic_is_idempotent() {
        let log = MemoryLog::default();
        assert!(log.create_topic("t", 2).await.unwrap());
        assert!(!log.create_topic("t", 5).await.unwrap());
        assert_eq!(log.partitions_of("t").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_topic_has_no_partitions() {
        let log = MemoryLog::default();
        assert!(log.partitions_of("nope").await.unwrap().is_empty());
        assert!(matches!(
            log.assign("nope", &[0]).await,
            Err(TransportError::TopicNotFound(_))
        ));
    }

    #[tokio::test]
    async fn latest_subscription_only_sees_new_records() {
        let log = MemoryLog::new(1);
        log.append(keyed("t", "k", "old")).await.unwrap();

        let mut sub = log.subscribe("t", None, OffsetReset::Latest).await.unwrap();
        assert!(sub.poll(WAIT).await.unwrap().is_empty());

        log.append(keyed("t", "k", "new")).await.unwrap();
        let records = sub.poll(WAIT).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, "new");
    }

    #[tokio::test]
    async fn poll_wakes_on_append() {
        let log = MemoryLog::new(1);
        let mut sub = log.subscribe("t", None, OffsetReset::Latest).await.unwrap();

        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(keyed("t", "k", "late")).await.unwrap();
        });

        let records = sub.poll(Duration::from_secs(5)).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn group_resumes_from_committed_offset() {
        let log = MemoryLog::new(1);
        log.append(keyed("t", "k", "one")).await.unwrap();
        {
            let mut sub = log
                .subscribe("t", Some("g"), OffsetReset::Earliest)
                .await
                .unwrap();
            assert_eq!(sub.poll(WAIT).await.unwrap().len(), 1);
        }
        log.append(keyed("t", "k", "two")).await.unwrap();

        let mut sub = log
            .subscribe("t", Some("g"), OffsetReset::Earliest)
            .await
            .unwrap();
        let records = sub.poll(WAIT).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, "two");
    }

    #[tokio::test]
    async fn subscriptions_in_one_group_do_not_share_work() {
        let log = MemoryLog::new(1);
        let mut first = log
            .subscribe("t", Some("g"), OffsetReset::Earliest)
            .await
            .unwrap();
        let mut second = log
            .subscribe("t", Some("g"), OffsetReset::Earliest)
            .await
            .unwrap();
        log.append(keyed("t", "k", "one")).await.unwrap();

        assert_eq!(first.poll(WAIT).await.unwrap()[0].value, "one");
        assert_eq!(second.poll(WAIT).await.unwrap()[0].value, "one");
    }

    #[tokio::test]
    async fn severed_subscription_fails_and_new_one_works() {
        let log = MemoryLog::new(1);
        let mut old = log.subscribe("t", None, OffsetReset::Latest).await.unwrap();
        log.sever_subscriptions();
        assert!(matches!(
            old.poll(WAIT).await,
            Err(TransportError::SubscriptionClosed)
        ));

        let mut fresh = log.subscribe("t", None, OffsetReset::Latest).await.unwrap();
        assert!(fresh.poll(WAIT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_append_failure() {
        let log = MemoryLog::default();
        log.fail_appends(true);
        assert!(matches!(
            log.append(OutgoingRecord::new("t", "x")).await,
            Err(TransportError::AppendFailed { .. })
        ));
        log.fail_appends(false);
        assert!(log.append(OutgoingRecord::new("t", "x")).await.is_ok());
    }

    #[tokio::test]
    async fn truncation_moves_begin_offset_and_clamps_reads() {
        let log = MemoryLog::new(1);
        for i in 0..5 {
            log.append(keyed("t", "k", &i.to_string())).await.unwrap();
        }
        log.truncate_before("t", 0, 3).unwrap();

        let mut sub = log.assign("t", &[0]).await.unwrap();
        assert_eq!(sub.position(0).await.unwrap(), 3);

        sub.seek(0, 0).await.unwrap();
        let records = sub.poll(WAIT).await.unwrap();
        assert_eq!(records.first().map(|r| r.offset), Some(3));
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn seek_on_unassigned_partition_fails() {
        let log = MemoryLog::new(2);
        log.create_topic("t", 2).await.unwrap();
        let mut sub = log.assign("t", &[0]).await.unwrap();
        assert!(matches!(
            sub.seek(1, 0).await,
            Err(TransportError::PartitionNotFound(_, 1))
        ));
    }
}
