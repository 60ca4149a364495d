//! Key-value settings storage backed by SQLite, and the settings resolved
//! from it.
//!
//! The `config` table lives in the same database file as the sqlite log,
//! so `--db` selects both.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use rusqlite::Connection;

use crate::broker::BrokerConfig;
use crate::consts::{
    DEFAULT_PARTITIONS, DEFAULT_REPLY_GROUP, DEFAULT_REPLY_TIMEOUT, DEFAULT_WORKER_GROUP,
    JSON_TOPIC, REPLY_TOPIC, REQUEST_TOPIC, STRING_TOPIC,
};
use crate::service::MessageTopics;
use crate::worker::WorkerConfig;

/// Recognised keys and what they control.
pub const KEYS: &[(&str, &str)] = &[
    ("request_topic", "topic requests are appended to"),
    ("reply_topic", "topic replies are appended to"),
    ("string_topic", "topic plain messages are sent to"),
    ("json_topic", "topic JSON messages are sent to"),
    ("worker_group", "consumer group of the reply worker"),
    ("reply_group", "consumer group of the reply listener"),
    ("reply_timeout", "seconds a calculation waits for its reply"),
    ("partitions", "partitions for topics created by courier"),
];

/// Persistent key-value configuration store.
pub struct Config {
    conn: Mutex<Connection>,
}

impl Config {
    /// Open or create the config table in the given database.
    /// Use `":memory:"` for tests.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open config database")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS config (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )
        .context("failed to create config table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("config database lock poisoned"))
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT value FROM config WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Set a config value (upsert). The value is validated first.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        Settings::default().apply(key, value)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM config WHERE key = ?1", [key])?;
        Ok(())
    }

    /// Every stored override, sorted by key.
    pub fn entries(&self) -> Result<Vec<(String, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key, value FROM config ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

/// Settings after applying stored overrides to the defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub request_topic: String,
    pub reply_topic: String,
    pub string_topic: String,
    pub json_topic: String,
    pub worker_group: String,
    pub reply_group: String,
    pub reply_timeout: Duration,
    pub partitions: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            request_topic: REQUEST_TOPIC.to_string(),
            reply_topic: REPLY_TOPIC.to_string(),
            string_topic: STRING_TOPIC.to_string(),
            json_topic: JSON_TOPIC.to_string(),
            worker_group: DEFAULT_WORKER_GROUP.to_string(),
            reply_group: DEFAULT_REPLY_GROUP.to_string(),
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            partitions: DEFAULT_PARTITIONS,
        }
    }
}

impl Settings {
    pub fn load(config: &Config) -> Result<Self> {
        let mut settings = Self::default();
        for (key, value) in config.entries()? {
            settings
                .apply(&key, &value)
                .with_context(|| format!("bad stored setting '{key}'"))?;
        }
        Ok(settings)
    }

    /// Set one key from its textual form.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            "request_topic" => self.request_topic = topic_name(value)?,
            "reply_topic" => self.reply_topic = topic_name(value)?,
            "string_topic" => self.string_topic = topic_name(value)?,
            "json_topic" => self.json_topic = topic_name(value)?,
            "worker_group" => self.worker_group = non_empty(key, value)?,
            "reply_group" => self.reply_group = non_empty(key, value)?,
            "reply_timeout" => {
                let secs: u64 = value
                    .parse()
                    .with_context(|| format!("reply_timeout must be whole seconds, got '{value}'"))?;
                if secs == 0 {
                    bail!("reply_timeout must be at least 1 second");
                }
                self.reply_timeout = Duration::from_secs(secs);
            }
            "partitions" => {
                let n: u32 = value
                    .parse()
                    .with_context(|| format!("partitions must be a positive integer, got '{value}'"))?;
                if n == 0 {
                    bail!("partitions must be at least 1");
                }
                self.partitions = n;
            }
            other => bail!("unknown config key '{other}'"),
        }
        Ok(())
    }

    /// Current value of `key`, in the form `apply` accepts.
    pub fn get(&self, key: &str) -> Result<String> {
        Ok(match key {
            "request_topic" => self.request_topic.clone(),
            "reply_topic" => self.reply_topic.clone(),
            "string_topic" => self.string_topic.clone(),
            "json_topic" => self.json_topic.clone(),
            "worker_group" => self.worker_group.clone(),
            "reply_group" => self.reply_group.clone(),
            "reply_timeout" => self.reply_timeout.as_secs().to_string(),
            "partitions" => self.partitions.to_string(),
            other => bail!("unknown config key '{other}'"),
        })
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            request_topic: self.request_topic.clone(),
            reply_topic: self.reply_topic.clone(),
            reply_group: Some(self.reply_group.clone()),
            partitions: self.partitions,
            ..BrokerConfig::default()
        }
    }

    pub fn message_topics(&self) -> MessageTopics {
        MessageTopics {
            string: self.string_topic.clone(),
            json: self.json_topic.clone(),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            request_topic: self.request_topic.clone(),
            reply_topic: self.reply_topic.clone(),
            group: self.worker_group.clone(),
            partitions: self.partitions,
            ..WorkerConfig::default()
        }
    }
}

fn non_empty(key: &str, value: &str) -> Result<String> {
    if value.is_empty() {
        bail!("{key} cannot be empty");
    }
    Ok(value.to_string())
}

fn topic_name(value: &str) -> Result<String> {
    if value.is_empty() {
        bail!("topic name cannot be empty");
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        bail!("topic name '{value}' contains '{bad}'; use letters, digits, '.', '_' or '-'");
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_config() -> Config {
        Config::open(":memory:").unwrap()
    }

    #[test]
    fn get_returns_none_for_missing_key() {
        assert!(mem_config().get("reply_topic").unwrap().is_none());
    }

    #[test]
    fn set_overwrites_and_remove_deletes() {
        let config = mem_config();
        config.set("reply_topic", "old").unwrap();
        config.set("reply_topic", "new").unwrap();
        assert_eq!(config.get("reply_topic").unwrap().unwrap(), "new");
        config.remove("reply_topic").unwrap();
        assert!(config.get("reply_topic").unwrap().is_none());
        config.remove("reply_topic").unwrap();
    }

    #[test]
    fn set_rejects_unknown_key_and_bad_values() {
        let config = mem_config();
        assert!(config.set("colour", "blue").is_err());
        assert!(config.set("reply_timeout", "soon").is_err());
        assert!(config.set("partitions", "0").is_err());
        assert!(config.set("request_topic", "has space").is_err());
        assert!(config.entries().unwrap().is_empty());
    }

    #[test]
    fn defaults_match_math_topics() {
        let settings = Settings::default();
        assert_eq!(settings.request_topic, "math-requests");
        assert_eq!(settings.reply_topic, "math-replies");
        assert_eq!(settings.string_topic, "string-messages");
        assert_eq!(settings.json_topic, "json-messages");
        assert_eq!(settings.worker_group, "math-consumer-group");
        assert_eq!(settings.reply_group, "math-reply-consumer");
        assert_eq!(settings.reply_timeout, Duration::from_secs(30));
        assert_eq!(settings.partitions, 3);
    }

    #[test]
    fn load_applies_overrides() {
        let config = mem_config();
        config.set("reply_timeout", "5").unwrap();
        config.set("partitions", "6").unwrap();
        let settings = Settings::load(&config).unwrap();
        assert_eq!(settings.reply_timeout, Duration::from_secs(5));
        assert_eq!(settings.broker_config().partitions, 6);
        assert_eq!(settings.worker_config().partitions, 6);
    }

    #[test]
    fn message_topics_follow_overrides() {
        let config = mem_config();
        config.set("json_topic", "audit.events").unwrap();
        assert!(config.set("string_topic", "").is_err());
        let topics = Settings::load(&config).unwrap().message_topics();
        assert_eq!(topics.string, "string-messages");
        assert_eq!(topics.json, "audit.events");
    }

    #[test]
    fn get_reports_every_known_key() {
        let settings = Settings::default();
        for (key, _) in KEYS {
            assert!(settings.get(key).is_ok(), "missing {key}");
        }
        assert!(settings.get("nope").is_err());
    }

    #[test]
    fn persists_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config-test.db");
        let path_str = path.to_str().unwrap();

        {
            let config = Config::open(path_str).unwrap();
            config.set("reply_group", "persisted").unwrap();
        }

        let config = Config::open(path_str).unwrap();
        assert_eq!(
            Settings::load(&config).unwrap().reply_group,
            "persisted"
        );
    }
}
