use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::{watch, RwLock};

use crate::model::{ChatMessage, MessageId, MessageSource};
use crate::UnixTimeMs;

pub const DEFAULT_DB_NAME: &str = "ChatAppDB";
pub const DEFAULT_DB_VERSION: u32 = 1;
pub const DEFAULT_STORE_NAME: &str = "messages";

pub const ENV_DB_NAME: &str = "CHAT_DB_NAME";
pub const ENV_DB_VERSION: &str = "CHAT_DB_VERSION";
pub const ENV_STORE_NAME: &str = "CHAT_STORE_NAME";

const MAX_NAME_LENGTH: usize = 64;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open store: {0}")]
    Open(String),

    #[error("transaction failed: {0}")]
    Transaction(String),

    #[error("store schema version {found} is newer than supported {max}")]
    VersionTooNew { found: u32, max: u32 },

    #[error("corrupted record {id}: {reason}")]
    Corrupted { id: u64, reason: String },

    #[error("id {0} does not fit the store key space")]
    IdOutOfRange(u64),

    #[error("lock acquisition failed")]
    LockFailed,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

#[cfg(not(target_arch = "wasm32"))]
impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Transaction(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("invalid schema version '{0}'")]
    InvalidVersion(String),

    #[error("invalid marker format '{0}'")]
    InvalidMarkerFormat(String),

    #[error("{field} must be > 0")]
    Zero { field: &'static str },
}

// ============================================================================
// Configuration
// ============================================================================

/// Names the database, its schema version and the record store inside it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub db_name: String,
    pub db_version: u32,
    pub store_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_name: DEFAULT_DB_NAME.to_string(),
            db_version: DEFAULT_DB_VERSION,
            store_name: DEFAULT_STORE_NAME.to_string(),
        }
    }
}

impl StoreConfig {
    /// Reads the optional `CHAT_DB_NAME`, `CHAT_DB_VERSION` and
    /// `CHAT_STORE_NAME` variables, falling back to the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let db_version = match non_empty(ENV_DB_VERSION) {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .map_err(|_| ConfigError::InvalidVersion(raw.clone()))?,
            None => defaults.db_version,
        };

        let config = Self {
            db_name: non_empty(ENV_DB_NAME).unwrap_or(defaults.db_name),
            db_version,
            store_name: non_empty(ENV_STORE_NAME).unwrap_or(defaults.store_name),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_name(&self.db_name)?;
        validate_name(&self.store_name)?;
        if self.db_version == 0 {
            return Err(ConfigError::Zero {
                field: "db_version",
            });
        }
        Ok(())
    }
}

// Names end up in file paths and SQL identifiers, so keep them boring.
fn validate_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::InvalidName {
            name: name.to_string(),
            reason: "name cannot be empty",
        });
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(ConfigError::InvalidName {
            name: name.chars().take(20).collect::<String>() + "...",
            reason: "name is too long",
        });
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ConfigError::InvalidName {
            name: name.to_string(),
            reason: "allowed: a-z, A-Z, 0-9, _",
        });
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(ConfigError::InvalidName {
            name: name.to_string(),
            reason: "name cannot start with a digit",
        });
    }
    Ok(())
}

// ============================================================================
// Persisted Record
// ============================================================================

/// Compressed on-disk form of a [`ChatMessage`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: u64,
    pub text: String,
    pub source: u8,
    pub time_stamp: u64,
    pub inappropriate: Option<u8>,
}

impl From<&ChatMessage> for StoredRecord {
    fn from(message: &ChatMessage) -> Self {
        Self {
            id: message.id().get(),
            text: message.text().to_string(),
            source: message.source().to_flag(),
            time_stamp: message.time_stamp().as_millis(),
            inappropriate: message.is_inappropriate().map(u8::from),
        }
    }
}

impl TryFrom<StoredRecord> for ChatMessage {
    type Error = StoreError;

    fn try_from(record: StoredRecord) -> Result<Self, Self::Error> {
        let source = MessageSource::from_flag(record.source).ok_or_else(|| StoreError::Corrupted {
            id: record.id,
            reason: format!("unknown source flag {}", record.source),
        })?;
        let inappropriate = match record.inappropriate {
            None => None,
            Some(0) => Some(false),
            Some(1) => Some(true),
            Some(other) => {
                return Err(StoreError::Corrupted {
                    id: record.id,
                    reason: format!("unknown inappropriate flag {other}"),
                })
            }
        };
        Ok(ChatMessage::new(
            MessageId(record.id),
            record.text,
            source,
            UnixTimeMs(record.time_stamp),
            inappropriate,
        ))
    }
}

// ============================================================================
// Storage Trait
// ============================================================================

/// Transactional record store keyed by message id with a secondary index on
/// the timestamp. Every method is one transaction.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    /// Upserts every record, all or nothing.
    async fn put_batch(&self, records: &[StoredRecord]) -> Result<(), StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;
    /// Full scan through the timestamp index (ties broken by id).
    async fn get_all_by_time(&self) -> Result<Vec<StoredRecord>, StoreError>;
}

// ============================================================================
// In-memory engine
// ============================================================================

/// Store used by the web build (no SQLite) and by tests. Faults and a write
/// gate can be switched on to exercise the coordinator's failure paths.
#[derive(Debug)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<u64, StoredRecord>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    write_gate: watch::Sender<bool>,
    committed_batches: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (write_gate, _) = watch::channel(false);
        Self {
            records: RwLock::new(BTreeMap::new()),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            write_gate,
            committed_batches: AtomicUsize::new(0),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Holds every write transaction open until [`Self::resume_writes`].
    pub fn pause_writes(&self) {
        self.write_gate.send_replace(true);
    }

    pub fn resume_writes(&self) {
        self.write_gate.send_replace(false);
    }

    /// Number of successful `put_batch` transactions.
    pub fn committed_batches(&self) -> usize {
        self.committed_batches.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn wait_for_gate(&self) {
        let mut gate = self.write_gate.subscribe();
        // The sender lives as long as `self`, so this only ends when the gate opens.
        let _ = gate.wait_for(|paused| !*paused).await;
    }
}

#[async_trait::async_trait]
impl MessageStore for MemoryStore {
    async fn put_batch(&self, records: &[StoredRecord]) -> Result<(), StoreError> {
        self.wait_for_gate().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Transaction("write transaction aborted".into()));
        }
        let mut map = self.records.write().await;
        for record in records {
            map.insert(record.id, record.clone());
        }
        self.committed_batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Transaction("clear aborted".into()));
        }
        self.records.write().await.clear();
        Ok(())
    }

    async fn get_all_by_time(&self) -> Result<Vec<StoredRecord>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Transaction("read transaction aborted".into()));
        }
        let mut all: Vec<StoredRecord> = self.records.read().await.values().cloned().collect();
        all.sort_by_key(|r| (r.time_stamp, r.id));
        Ok(all)
    }
}

// ============================================================================
// SQLite engine
// ============================================================================

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteStore;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use rusqlite::{params, Connection};
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tracing::info;

    use super::{MessageStore, StoreConfig, StoreError, StoredRecord};

    /// SQLite-backed store. The record table is named by
    /// [`StoreConfig::store_name`]; the schema version lives in `user_version`.
    pub struct SqliteStore {
        conn: Arc<Mutex<Connection>>,
        table: String,
    }

    impl SqliteStore {
        /// Opens (or creates) `<dir>/<db_name>.sqlite3`.
        pub fn open(dir: &Path, config: &StoreConfig) -> Result<Self, StoreError> {
            config.validate()?;
            let path = dir.join(format!("{}.sqlite3", config.db_name));
            let conn = Connection::open(&path).map_err(|e| StoreError::Open(e.to_string()))?;
            Self::init(conn, config)
        }

        pub fn open_in_memory(config: &StoreConfig) -> Result<Self, StoreError> {
            config.validate()?;
            let conn = Connection::open_in_memory().map_err(|e| StoreError::Open(e.to_string()))?;
            Self::init(conn, config)
        }

        fn init(conn: Connection, config: &StoreConfig) -> Result<Self, StoreError> {
            let found: u32 = conn
                .pragma_query_value(None, "user_version", |row| row.get(0))
                .map_err(|e| StoreError::Open(e.to_string()))?;

            if found > config.db_version {
                return Err(StoreError::VersionTooNew {
                    found,
                    max: config.db_version,
                });
            }

            // Each store name gets its own table, so a database opened
            // before under another name still needs this one created.
            let table = &config.store_name;
            conn.execute_batch(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY,
                    text TEXT NOT NULL,
                    source INTEGER NOT NULL,
                    time_stamp INTEGER NOT NULL,
                    inappropriate INTEGER
                );

                CREATE INDEX IF NOT EXISTS idx_{table}_time_stamp ON {table}(time_stamp);
                "#
            ))
            .map_err(|e| StoreError::Open(e.to_string()))?;

            if found < config.db_version {
                conn.pragma_update(None, "user_version", config.db_version)
                    .map_err(|e| StoreError::Open(e.to_string()))?;
                info!(
                    db = %config.db_name,
                    from = found,
                    to = config.db_version,
                    "upgraded message store schema"
                );
            }

            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
                table: config.store_name.clone(),
            })
        }

        async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
        where
            T: Send + 'static,
            F: FnOnce(&mut Connection, &str) -> Result<T, StoreError> + Send + 'static,
        {
            let conn = Arc::clone(&self.conn);
            let table = self.table.clone();
            tokio::task::spawn_blocking(move || {
                let mut guard = conn.lock().map_err(|_| StoreError::LockFailed)?;
                f(&mut guard, &table)
            })
            .await
            .map_err(|e| StoreError::Transaction(e.to_string()))?
        }
    }

    fn to_sql_int(value: u64) -> Result<i64, StoreError> {
        i64::try_from(value).map_err(|_| StoreError::IdOutOfRange(value))
    }

    #[async_trait::async_trait]
    impl MessageStore for SqliteStore {
        async fn put_batch(&self, records: &[StoredRecord]) -> Result<(), StoreError> {
            let records = records.to_vec();
            self.with_conn(move |conn, table| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(&format!(
                        r#"
                        INSERT INTO {table} (id, text, source, time_stamp, inappropriate)
                        VALUES (?1, ?2, ?3, ?4, ?5)
                        ON CONFLICT(id) DO UPDATE SET
                            text = excluded.text,
                            source = excluded.source,
                            time_stamp = excluded.time_stamp,
                            inappropriate = excluded.inappropriate
                        "#
                    ))?;
                    for record in &records {
                        stmt.execute(params![
                            to_sql_int(record.id)?,
                            record.text,
                            record.source,
                            to_sql_int(record.time_stamp)?,
                            record.inappropriate,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
        }

        async fn clear(&self) -> Result<(), StoreError> {
            self.with_conn(|conn, table| {
                conn.execute(&format!("DELETE FROM {table}"), [])?;
                Ok(())
            })
            .await
        }

        async fn get_all_by_time(&self) -> Result<Vec<StoredRecord>, StoreError> {
            self.with_conn(|conn, table| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT id, text, source, time_stamp, inappropriate FROM {table} \
                     ORDER BY time_stamp ASC, id ASC"
                ))?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                    ))
                })?;

                let mut records = Vec::new();
                for row in rows {
                    let (id, text, source, time_stamp, inappropriate) = row?;
                    let id = u64::try_from(id).map_err(|_| StoreError::Corrupted {
                        id: 0,
                        reason: format!("negative id {id}"),
                    })?;
                    let corrupted = |reason: String| StoreError::Corrupted { id, reason };
                    records.push(StoredRecord {
                        id,
                        text,
                        source: u8::try_from(source)
                            .map_err(|_| corrupted(format!("source flag {source}")))?,
                        time_stamp: u64::try_from(time_stamp)
                            .map_err(|_| corrupted(format!("time stamp {time_stamp}")))?,
                        inappropriate: inappropriate
                            .map(u8::try_from)
                            .transpose()
                            .map_err(|_| corrupted("inappropriate flag".into()))?,
                    });
                }
                Ok(records)
            })
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn record(id: u64, time_stamp: u64) -> StoredRecord {
        StoredRecord {
            id,
            text: format!("record {id}"),
            source: 1,
            time_stamp,
            inappropriate: None,
        }
    }

    #[test]
    fn config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.db_name, "ChatAppDB");
        assert_eq!(config.db_version, 1);
        assert_eq!(config.store_name, "messages");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_from_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_DB_NAME, "OtherDB"),
            (ENV_DB_VERSION, " 3 "),
            (ENV_STORE_NAME, "chat_log"),
        ]
        .into_iter()
        .collect();
        let config = StoreConfig::from_lookup(|k| vars.get(k).map(|v| (*v).to_string())).unwrap();
        assert_eq!(config.db_name, "OtherDB");
        assert_eq!(config.db_version, 3);
        assert_eq!(config.store_name, "chat_log");
    }

    #[test]
    fn config_blank_values_fall_back() {
        let config = StoreConfig::from_lookup(|_| Some("  ".to_string())).unwrap();
        assert_eq!(config, StoreConfig::default());
    }

    #[test]
    fn config_rejects_bad_values() {
        let bad_version = StoreConfig::from_lookup(|k| (k == ENV_DB_VERSION).then(|| "two".into()));
        assert!(matches!(bad_version, Err(ConfigError::InvalidVersion(_))));

        let injected = StoreConfig::from_lookup(|k| {
            (k == ENV_STORE_NAME).then(|| "messages; DROP TABLE x".into())
        });
        assert!(matches!(injected, Err(ConfigError::InvalidName { .. })));

        let zero = StoreConfig {
            db_version: 0,
            ..StoreConfig::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn record_compression_round_trip() {
        let message = ChatMessage::new(
            MessageId(9),
            "hey",
            MessageSource::You,
            UnixTimeMs(42),
            Some(true),
        );
        let stored = StoredRecord::from(&message);
        assert_eq!(stored.source, 0);
        assert_eq!(stored.inappropriate, Some(1));
        assert_eq!(ChatMessage::try_from(stored).unwrap(), message);
    }

    #[test]
    fn corrupt_record_is_rejected() {
        let mut bad = record(5, 1);
        bad.source = 7;
        assert!(matches!(
            ChatMessage::try_from(bad),
            Err(StoreError::Corrupted { id: 5, .. })
        ));

        let mut bad_flag = record(6, 1);
        bad_flag.inappropriate = Some(3);
        assert!(ChatMessage::try_from(bad_flag).is_err());
    }

    #[tokio::test]
    async fn memory_store_orders_by_time_then_id() {
        let store = MemoryStore::new();
        store
            .put_batch(&[record(3, 300), record(1, 200), record(2, 200)])
            .await
            .unwrap();
        let ids: Vec<u64> = store.get_all_by_time().await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn memory_store_upserts_and_clears() {
        let store = MemoryStore::new();
        store.put_batch(&[record(1, 10)]).await.unwrap();
        let mut updated = record(1, 10);
        updated.text = "edited".into();
        store.put_batch(&[updated]).await.unwrap();

        let all = store.get_all_by_time().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].text, "edited");
        assert_eq!(store.committed_batches(), 2);

        store.clear().await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn memory_store_failures() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.put_batch(&[record(1, 1)]).await.is_err());
        assert_eq!(store.len().await, 0);

        store.set_fail_reads(true);
        assert!(store.get_all_by_time().await.is_err());
    }

    #[cfg(not(target_arch = "wasm32"))]
    mod sqlite_tests {
        use super::*;
        use tempfile::tempdir;

        #[tokio::test]
        async fn sqlite_round_trip_in_time_order() {
            let store = SqliteStore::open_in_memory(&StoreConfig::default()).unwrap();
            store
                .put_batch(&[record(2, 500), record(1, 900), record(3, 100)])
                .await
                .unwrap();
            let ids: Vec<u64> = store.get_all_by_time().await.unwrap().iter().map(|r| r.id).collect();
            assert_eq!(ids, vec![3, 2, 1]);
        }

        #[tokio::test]
        async fn sqlite_upsert_replaces_by_id() {
            let store = SqliteStore::open_in_memory(&StoreConfig::default()).unwrap();
            store.put_batch(&[record(1, 10)]).await.unwrap();
            let mut again = record(1, 20);
            again.inappropriate = Some(1);
            store.put_batch(&[again.clone()]).await.unwrap();
            assert_eq!(store.get_all_by_time().await.unwrap(), vec![again]);
        }

        #[tokio::test]
        async fn sqlite_persists_across_reopen() {
            let dir = tempdir().unwrap();
            let config = StoreConfig::default();
            {
                let store = SqliteStore::open(dir.path(), &config).unwrap();
                store.put_batch(&[record(7, 70)]).await.unwrap();
            }
            let reopened = SqliteStore::open(dir.path(), &config).unwrap();
            assert_eq!(reopened.get_all_by_time().await.unwrap().len(), 1);

            reopened.clear().await.unwrap();
            assert!(reopened.get_all_by_time().await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn sqlite_second_store_name_in_same_database() {
            let dir = tempdir().unwrap();
            {
                let messages = SqliteStore::open(dir.path(), &StoreConfig::default()).unwrap();
                messages.put_batch(&[record(1, 10)]).await.unwrap();
            }

            let archive_config = StoreConfig {
                store_name: "archive".into(),
                ..StoreConfig::default()
            };
            let archive = SqliteStore::open(dir.path(), &archive_config).unwrap();
            assert!(archive.get_all_by_time().await.unwrap().is_empty());
            archive.put_batch(&[record(2, 20)]).await.unwrap();
            assert_eq!(archive.get_all_by_time().await.unwrap(), vec![record(2, 20)]);

            let messages = SqliteStore::open(dir.path(), &StoreConfig::default()).unwrap();
            assert_eq!(messages.get_all_by_time().await.unwrap(), vec![record(1, 10)]);
        }

        #[tokio::test]
        async fn sqlite_refuses_newer_schema() {
            let dir = tempdir().unwrap();
            let v2 = StoreConfig {
                db_version: 2,
                ..StoreConfig::default()
            };
            drop(SqliteStore::open(dir.path(), &v2).unwrap());

            let result = SqliteStore::open(dir.path(), &StoreConfig::default());
            assert!(matches!(
                result,
                Err(StoreError::VersionTooNew { found: 2, max: 1 })
            ));
        }

        #[tokio::test]
        async fn sqlite_rejects_ids_outside_key_space() {
            let store = SqliteStore::open_in_memory(&StoreConfig::default()).unwrap();
            let result = store.put_batch(&[record(u64::MAX, 1)]).await;
            assert!(matches!(result, Err(StoreError::IdOutOfRange(_))));
            assert!(store.get_all_by_time().await.unwrap().is_empty());
        }
    }
}
