//! Partitioned log persisted in a single SQLite file.
//!
//! Several processes can open the same file: a worker in one, callers in
//! others. Appends run in an immediate transaction so offsets stay dense
//! per partition; subscriptions poll the table at a short interval.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tokio::time::Instant;

use super::{
    LogTransport, MAX_POLL_RECORDS, OffsetReset, OutgoingRecord, PartitionInfo, Record,
    RecordMetadata, Subscription, TransportError, choose_partition,
};

/// How often an idle subscription re-checks the table.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS topics (
        name       TEXT PRIMARY KEY,
        partitions INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS partitions (
        topic        TEXT NOT NULL,
        partition_id INTEGER NOT NULL,
        start_offset INTEGER NOT NULL DEFAULT 0,
        next_offset  INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (topic, partition_id)
    );
    CREATE TABLE IF NOT EXISTS records (
        topic         TEXT NOT NULL,
        partition_id  INTEGER NOT NULL,
        record_offset INTEGER NOT NULL,
        key           TEXT,
        value         TEXT NOT NULL,
        headers       TEXT NOT NULL,
        timestamp     INTEGER NOT NULL,
        PRIMARY KEY (topic, partition_id, record_offset)
    );
    CREATE TABLE IF NOT EXISTS group_offsets (
        group_id      TEXT NOT NULL,
        topic         TEXT NOT NULL,
        partition_id  INTEGER NOT NULL,
        next_offset   INTEGER NOT NULL,
        PRIMARY KEY (group_id, topic, partition_id)
    );";

/// SQLite-backed partitioned log.
#[derive(Clone)]
pub struct SqliteLog {
    conn: Arc<Mutex<Connection>>,
    default_partitions: u32,
    poll_interval: Duration,
    round_robin: Arc<AtomicU64>,
}

impl SqliteLog {
    /// Open or create the log tables in the given database.
    /// Use `":memory:"` for tests.
    pub fn open(path: &str) -> Result<Self, TransportError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            default_partitions: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            round_robin: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn in_memory() -> Result<Self, TransportError> {
        Self::open(":memory:")
    }

    /// Partition count for topics created implicitly.
    pub fn with_default_partitions(mut self, partitions: u32) -> Self {
        self.default_partitions = partitions;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Drop records before `offset` (retention).
    pub fn truncate_before(
        &self,
        topic: &str,
        partition: u32,
        offset: i64,
    ) -> Result<(), TransportError> {
        let mut conn = lock(&self.conn)?;
        let (begin, end) = bounds(&conn, topic, partition)?;
        let offset = offset.min(end);
        if offset <= begin {
            return Ok(());
        }
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM records
             WHERE topic = ?1 AND partition_id = ?2 AND record_offset < ?3",
            params![topic, partition, offset],
        )?;
        tx.execute(
            "UPDATE partitions SET start_offset = ?3 WHERE topic = ?1 AND partition_id = ?2",
            params![topic, partition, offset],
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, TransportError> {
    conn.lock()
        .map_err(|_| TransportError::Unavailable("sqlite connection lock poisoned".to_string()))
}

/// Insert the topic and its partition rows unless it exists.
fn ensure_topic(conn: &Connection, name: &str, partitions: u32) -> Result<bool, TransportError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO topics (name, partitions) VALUES (?1, ?2)",
        params![name, partitions],
    )?;
    if inserted == 0 {
        return Ok(false);
    }
    for partition in 0..partitions {
        conn.execute(
            "INSERT OR IGNORE INTO partitions (topic, partition_id) VALUES (?1, ?2)",
            params![name, partition],
        )?;
    }
    Ok(true)
}

fn partition_count(conn: &Connection, topic: &str) -> Result<Option<u32>, TransportError> {
    Ok(conn
        .query_row(
            "SELECT partitions FROM topics WHERE name = ?1",
            [topic],
            |row| row.get::<_, u32>(0),
        )
        .optional()?)
}

fn bounds(conn: &Connection, topic: &str, partition: u32) -> Result<(i64, i64), TransportError> {
    let found = conn
        .query_row(
            "SELECT start_offset, next_offset FROM partitions
             WHERE topic = ?1 AND partition_id = ?2",
            params![topic, partition],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;
    match found {
        Some(range) => Ok(range),
        None if partition_count(conn, topic)?.is_none() => {
            Err(TransportError::TopicNotFound(topic.to_string()))
        }
        None => Err(TransportError::PartitionNotFound(
            topic.to_string(),
            partition,
        )),
    }
}

fn read(
    conn: &Connection,
    topic: &str,
    partition: u32,
    from: i64,
    max: usize,
) -> Result<Vec<Record>, TransportError> {
    let (begin, end) = bounds(conn, topic, partition)?;
    let from = from.clamp(begin, end);
    let mut stmt = conn.prepare_cached(
        "SELECT record_offset, key, value, headers, timestamp FROM records
         WHERE topic = ?1 AND partition_id = ?2 AND record_offset >= ?3
         ORDER BY record_offset ASC LIMIT ?4",
    )?;
    let rows = stmt
        .query_map(params![topic, partition, from, max as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(offset, key, value, headers, timestamp)| -> Result<Record, TransportError> {
            let headers = serde_json::from_str(&headers)
                .map_err(|e| TransportError::Malformed(format!("{topic}/{partition}@{offset}: {e}")))?;
            Ok(Record {
                topic: topic.to_string(),
                partition,
                offset,
                key,
                value,
                headers,
                timestamp,
            })
        })
        .collect()
}

fn committed_offset(
    conn: &Connection,
    group: &str,
    topic: &str,
    partition: u32,
) -> Result<Option<i64>, TransportError> {
    Ok(conn
        .query_row(
            "SELECT next_offset FROM group_offsets
             WHERE group_id = ?1 AND topic = ?2 AND partition_id = ?3",
            params![group, topic, partition],
            |row| row.get::<_, i64>(0),
        )
        .optional()?)
}

#[async_trait]
impl LogTransport for SqliteLog {
    async fn append(&self, record: OutgoingRecord) -> Result<RecordMetadata, TransportError> {
        let headers = serde_json::to_string(&record.headers)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        ensure_topic(&tx, &record.topic, self.default_partitions)?;
        let count = partition_count(&tx, &record.topic)?.unwrap_or(0);
        let partition = choose_partition(
            record.key.as_deref(),
            count,
            self.round_robin.fetch_add(1, Ordering::Relaxed),
        );
        let (_, offset) = bounds(&tx, &record.topic, partition)?;
        let timestamp = Utc::now().timestamp_millis();

        tx.execute(
            "INSERT INTO records (topic, partition_id, record_offset, key, value, headers, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.topic,
                partition,
                offset,
                record.key,
                record.value,
                headers,
                timestamp
            ],
        )?;
        tx.execute(
            "UPDATE partitions SET next_offset = ?3 WHERE topic = ?1 AND partition_id = ?2",
            params![record.topic, partition, offset + 1],
        )?;
        tx.commit()?;

        Ok(RecordMetadata {
            topic: record.topic,
            partition,
            offset,
            timestamp,
        })
    }

    async fn create_topic(&self, name: &str, partitions: u32) -> Result<bool, TransportError> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction()?;
        let created = ensure_topic(&tx, name, partitions)?;
        tx.commit()?;
        Ok(created)
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: Option<&str>,
        reset: OffsetReset,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let positions = {
            let conn = lock(&self.conn)?;
            ensure_topic(&conn, topic, self.default_partitions)?;
            let count = partition_count(&conn, topic)?.unwrap_or(0);
            let mut positions = BTreeMap::new();
            for partition in 0..count {
                let committed = match group {
                    Some(g) => committed_offset(&conn, g, topic, partition)?,
                    None => None,
                };
                let position = match committed {
                    Some(offset) => offset,
                    None => {
                        let (begin, end) = bounds(&conn, topic, partition)?;
                        match reset {
                            OffsetReset::Earliest => begin,
                            OffsetReset::Latest => end,
                        }
                    }
                };
                positions.insert(partition, position);
            }
            positions
        };

        Ok(Box::new(SqliteSubscription {
            conn: Arc::clone(&self.conn),
            topic: topic.to_string(),
            group: group.map(str::to_string),
            positions,
            poll_interval: self.poll_interval,
        }))
    }

    async fn assign(
        &self,
        topic: &str,
        partitions: &[u32],
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let positions = {
            let conn = lock(&self.conn)?;
            let mut positions = BTreeMap::new();
            for &partition in partitions {
                let (begin, _) = bounds(&conn, topic, partition)?;
                positions.insert(partition, begin);
            }
            positions
        };
        Ok(Box::new(SqliteSubscription {
            conn: Arc::clone(&self.conn),
            topic: topic.to_string(),
            group: None,
            positions,
            poll_interval: self.poll_interval,
        }))
    }

    async fn partitions_of(&self, topic: &str) -> Result<Vec<PartitionInfo>, TransportError> {
        let conn = lock(&self.conn)?;
        let count = partition_count(&conn, topic)?.unwrap_or(0);
        Ok((0..count)
            .map(|partition| PartitionInfo {
                topic: topic.to_string(),
                partition,
            })
            .collect())
    }

    async fn list_topics(&self) -> Result<BTreeSet<String>, TransportError> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare("SELECT name FROM topics")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(names)
    }
}

struct SqliteSubscription {
    conn: Arc<Mutex<Connection>>,
    topic: String,
    group: Option<String>,
    positions: BTreeMap<u32, i64>,
    poll_interval: Duration,
}

impl SqliteSubscription {
    fn ensure_assigned(&self, partition: u32) -> Result<(), TransportError> {
        if !self.positions.contains_key(&partition) {
            return Err(TransportError::PartitionNotFound(
                self.topic.clone(),
                partition,
            ));
        }
        Ok(())
    }

    /// One pass over the assigned partitions; commits when a group is set.
    fn fetch(&mut self) -> Result<Vec<Record>, TransportError> {
        let conn = lock(&self.conn)?;
        let mut out = Vec::new();
        for (&partition, position) in self.positions.iter_mut() {
            let remaining = MAX_POLL_RECORDS - out.len();
            if remaining == 0 {
                break;
            }
            let batch = read(&conn, &self.topic, partition, *position, remaining)?;
            if let Some(last) = batch.last() {
                *position = last.offset + 1;
            }
            out.extend(batch);
        }

        if let (Some(group), false) = (&self.group, out.is_empty()) {
            for (&partition, &offset) in &self.positions {
                conn.execute(
                    "INSERT INTO group_offsets (group_id, topic, partition_id, next_offset)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(group_id, topic, partition_id)
                     DO UPDATE SET next_offset = excluded.next_offset",
                    params![group, self.topic, partition, offset],
                )?;
            }
        }
        Ok(out)
    }

    fn bounds(&self, partition: u32) -> Result<(i64, i64), TransportError> {
        let conn = lock(&self.conn)?;
        bounds(&conn, &self.topic, partition)
    }
}

#[async_trait]
impl Subscription for SqliteSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn assignment(&self) -> Vec<u32> {
        self.positions.keys().copied().collect()
    }

    async fn poll(&mut self, max_wait: Duration) -> Result<Vec<Record>, TransportError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let records = self.fetch()?;
            if !records.is_empty() {
                return Ok(records);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn seek_to_beginning(&mut self, partitions: &[u32]) -> Result<(), TransportError> {
        for &partition in partitions {
            self.ensure_assigned(partition)?;
            let (begin, _) = self.bounds(partition)?;
            self.positions.insert(partition, begin);
        }
        Ok(())
    }

    async fn seek_to_end(&mut self, partitions: &[u32]) -> Result<(), TransportError> {
        for &partition in partitions {
            self.ensure_assigned(partition)?;
            let (_, end) = self.bounds(partition)?;
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
