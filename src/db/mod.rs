pub mod persistence;
pub mod schema;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use serde::Serialize;
use thiserror::Error;

use crate::core::Block;
use crate::errors::Transient;
use crate::signals::{Signal, SignalType};
use crate::tags::{Entity, EntityLoader, EntityType};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("{0} does not fit an SQLite integer")]
    OutOfRange(&'static str),
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlite(e) => matches!(
                e.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            ),
            StoreError::Unavailable(_) => true,
            StoreError::Serde(_) | StoreError::Io(_) | StoreError::OutOfRange(_) => false,
        }
    }
}

/// Rows removed by a cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub blocks: usize,
    pub transactions: usize,
    pub signals: usize,
}

/// Timestamps are stored as RFC 3339 UTC with millisecond precision, so
/// string order is time order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

/// Unsigned value as an SQLite integer, rejecting anything above `i64::MAX`.
fn sql_int<T>(value: T, field: &'static str) -> Result<i64, StoreError>
where
    i64: TryFrom<T>,
{
    i64::try_from(value).map_err(|_| StoreError::OutOfRange(field))
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

pub struct Database {
    conn: Connection,
}

/// Thread-safe wrapper around Database.
#[derive(Clone)]
pub struct SharedDatabase {
    inner: Arc<Mutex<Database>>,
}

impl SharedDatabase {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(db)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Database> {
        // a panic mid-statement leaves SQLite itself consistent
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a blocking store call off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db.lock()))
            .await
            .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
    }

    pub fn store_block(&self, block: &Block) -> Result<(), StoreError> {
        self.lock().store_block(block)
    }

    pub async fn store_block_async(&self, block: Arc<Block>) -> Result<(), StoreError> {
        self.blocking(move |db| db.store_block(&block)).await
    }

    pub fn insert_signals(&self, signals: &[Signal]) -> Result<usize, StoreError> {
        self.lock().insert_signals(signals)
    }

    pub fn upsert_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        self.lock().upsert_entity(entity)
    }

    pub fn all_entities(&self) -> Result<Vec<Entity>, StoreError> {
        self.lock().all_entities()
    }

    /// Upsert entities from a JSON array file.
    pub fn seed_entities_from_file(&self, path: &Path) -> Result<usize, StoreError> {
        let content = std::fs::read_to_string(path)?;
        let entities: Vec<Entity> = serde_json::from_str(&content)?;
        let db = self.lock();
        for entity in &entities {
            db.upsert_entity(entity)?;
        }
        Ok(entities.len())
    }

    pub async fn cleanup_older_than(&self, hours: u32) -> Result<CleanupReport, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::hours(i64::from(hours));
        self.blocking(move |db| db.cleanup_before(cutoff)).await
    }

    pub fn recent_signals(&self, limit: usize) -> Result<Vec<Signal>, StoreError> {
        self.lock().recent_signals(limit)
    }

    pub fn signal_count(&self) -> Result<usize, StoreError> {
        self.lock().signal_count()
    }

    pub fn latest_block_height(&self) -> Result<Option<u64>, StoreError> {
        self.lock().latest_block_height()
    }
}

#[async_trait]
impl EntityLoader for SharedDatabase {
    async fn load_entities(&self) -> Result<Vec<Entity>, StoreError> {
        self.blocking(|db| db.all_entities()).await
    }
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    /// Upsert a block and its transaction summaries in one transaction.
    pub fn store_block(&self, block: &Block) -> Result<(), StoreError> {
        let now = format_ts(Utc::now());
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO blocks
                (hash, height, prev_hash, timestamp, size, weight, tx_count, fees_total, limited_detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                block.hash,
                sql_int(block.height, "height")?,
                block.prev_hash,
                format_ts(block.timestamp),
                sql_int(block.size, "size")?,
                sql_int(block.weight, "weight")?,
                sql_int(block.tx_count, "tx_count")?,
                sql_int(block.fees_total, "fees_total")?,
                block.limited_detail as i32,
                now,
            ],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO transactions
                    (txid, block_hash, block_height, position, input_count, output_count,
                     input_value, output_value, fee, vsize, is_coinbase, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for t in &block.transactions {
                stmt.execute(params![
                    t.txid,
                    block.hash,
                    sql_int(t.block_height, "block_height")?,
                    sql_int(t.position, "position")?,
                    sql_int(t.input_count, "input_count")?,
                    sql_int(t.output_count, "output_count")?,
                    sql_int(t.input_value, "input_value")?,
                    sql_int(t.output_value, "output_value")?,
                    sql_int(t.fee, "fee")?,
                    sql_int(t.vsize, "vsize")?,
                    t.is_coinbase as i32,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Insert signals in a single transaction. Re-inserting an id replaces it.
    pub fn insert_signals(&self, signals: &[Signal]) -> Result<usize, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO signals
                    (signal_id, signal_type, block_height, confidence, metadata,
                     created_at, processed, processed_at, is_predictive)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for s in signals {
                stmt.execute(params![
                    s.signal_id,
                    s.signal_type.as_str(),
                    sql_int(s.block_height, "block_height")?,
                    s.confidence,
                    serde_json::to_string(&s.metadata)?,
                    format_ts(s.created_at),
                    s.processed as i32,
                    s.processed_at.map(format_ts),
                    s.is_predictive as i32,
                ])?;
            }
        }
        tx.commit()?;
        Ok(signals.len())
    }

    fn row_to_signal(row: &rusqlite::Row) -> rusqlite::Result<Signal> {
        let signal_type: String = row.get(1)?;
        let metadata: String = row.get(4)?;
        let created_at: String = row.get(5)?;
        let processed_at: Option<String> = row.get(7)?;
        Ok(Signal {
            signal_id: row.get(0)?,
            signal_type: SignalType::parse(&signal_type).ok_or_else(|| {
                conversion_error(1, std::io::Error::other(format!("unknown signal type {signal_type}")))
            })?,
            block_height: u64::try_from(row.get::<_, i64>(2)?).map_err(|e| conversion_error(2, e))?,
            confidence: row.get(3)?,
            metadata: serde_json::from_str(&metadata).map_err(|e| conversion_error(4, e))?,
            created_at: parse_ts(5, &created_at)?,
            processed: row.get::<_, i32>(6)? != 0,
            processed_at: processed_at.as_deref().map(|s| parse_ts(7, s)).transpose()?,
            is_predictive: row.get::<_, i32>(8)? != 0,
        })
    }

    /// Get recent signals ordered by time.
    pub fn recent_signals(&self, limit: usize) -> Result<Vec<Signal>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT signal_id, signal_type, block_height, confidence, metadata,
                    created_at, processed, processed_at, is_predictive
             FROM signals ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![sql_int(limit, "limit")?], Self::row_to_signal)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn signal_count(&self) -> Result<usize, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM signals", [], |row| {
                row.get::<_, i64>(0)
                    .and_then(|c| usize::try_from(c).map_err(|e| conversion_error(0, e)))
            })?)
    }

    pub fn latest_block_height(&self) -> Result<Option<u64>, StoreError> {
        let height: Option<i64> = self
            .conn
            .query_row("SELECT MAX(height) FROM blocks", [], |row| row.get(0))
            .optional()?
            .flatten();
        height
            .map(u64::try_from)
            .transpose()
            .map_err(|_| StoreError::OutOfRange("height"))
    }

    pub fn upsert_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO entities (entity_id, name, entity_type, addresses, metadata, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entity.entity_id,
                entity.name,
                entity.entity_type.as_str(),
                serde_json::to_string(&entity.addresses)?,
                serde_json::to_string(&entity.metadata)?,
                format_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn all_entities(&self) -> Result<Vec<Entity>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_id, name, entity_type, addresses, metadata FROM entities ORDER BY entity_id",
        )?;
        let rows = stmt.query_map([], |row| {
            let entity_type: String = row.get(2)?;
            let addresses: String = row.get(3)?;
            let metadata: String = row.get(4)?;
            Ok(Entity {
                entity_id: row.get(0)?,
                name: row.get(1)?,
                entity_type: EntityType::parse(&entity_type).ok_or_else(|| {
                    conversion_error(2, std::io::Error::other(format!("unknown entity type {entity_type}")))
                })?,
                addresses: serde_json::from_str(&addresses).map_err(|e| conversion_error(3, e))?,
                metadata: serde_json::from_str(&metadata).map_err(|e| conversion_error(4, e))?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Delete hot-store rows ingested before `cutoff`.
    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<CleanupReport, StoreError> {
        let cutoff = format_ts(cutoff);
        let tx = self.conn.unchecked_transaction()?;
        let transactions = tx.execute("DELETE FROM transactions WHERE created_at < ?1", params![cutoff])?;
        let blocks = tx.execute("DELETE FROM blocks WHERE created_at < ?1", params![cutoff])?;
        let signals = tx.execute("DELETE FROM signals WHERE created_at < ?1", params![cutoff])?;
        tx.commit()?;
        Ok(CleanupReport {
            blocks,
            transactions,
            signals,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::signals::tests::sample_block;
    use crate::tags::tests::sample_entities;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    pub(crate) fn temp_db() -> SharedDatabase {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "chainsignal_test_{}_{}.db",
            std::process::id(),
            id
        ));
        // Remove if leftover from previous run
        let _ = std::fs::remove_file(&path);
        SharedDatabase::open(&path).unwrap()
    }

    #[test]
    fn block_and_transactions_stored() {
        let db = temp_db();
        let block = sample_block();
        db.store_block(&block).unwrap();
        // replay is idempotent
        db.store_block(&block).unwrap();
        assert_eq!(db.latest_block_height().unwrap(), Some(850_000));
        let count: i64 = db
            .lock()
            .conn
            .query_row("SELECT COUNT(*) FROM transactions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn oversized_values_are_rejected_not_wrapped() {
        let db = temp_db();
        let mut block = sample_block();
        block.transactions[1].output_value = u64::MAX;
        let err = db.store_block(&block).unwrap_err();
        assert!(matches!(err, StoreError::OutOfRange("output_value")));
        assert!(!err.is_transient());
        // the failed write left nothing behind
        assert_eq!(db.latest_block_height().unwrap(), None);

        let s = Signal::new(SignalType::WhaleTransfer, u64::MAX, 0.7, json!({}));
        assert!(matches!(
            db.insert_signals(&[s]),
            Err(StoreError::OutOfRange("block_height"))
        ));
        assert_eq!(db.signal_count().unwrap(), 0);
    }

    #[test]
    fn signals_roundtrip_fields() {
        let db = temp_db();
        let mut s = Signal::new(SignalType::FeeForecast, 850_000, 0.72, json!({"forecast_fee_rate": 12.5}));
        s.processed = true;
        s.processed_at = Some(Utc::now());
        assert_eq!(db.insert_signals(std::slice::from_ref(&s)).unwrap(), 1);

        let stored = db.recent_signals(10).unwrap();
        assert_eq!(stored.len(), 1);
        let r = &stored[0];
        assert_eq!(r.signal_id, s.signal_id);
        assert_eq!(r.signal_type, SignalType::FeeForecast);
        assert_eq!(r.metadata["forecast_fee_rate"], 12.5);
        assert!(r.is_predictive);
        assert!(r.processed);
        assert_eq!(format_ts(r.created_at), format_ts(s.created_at));
    }

    #[test]
    fn entities_seed_and_load() {
        let db = temp_db();
        let path = std::env::temp_dir().join(format!(
            "chainsignal_entities_{}_{}.json",
            std::process::id(),
            TEST_COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        std::fs::write(&path, serde_json::to_string(&sample_entities()).unwrap()).unwrap();
        assert_eq!(db.seed_entities_from_file(&path).unwrap(), 3);
        // reseeding upserts
        assert_eq!(db.seed_entities_from_file(&path).unwrap(), 3);

        let entities = db.all_entities().unwrap();
        assert_eq!(entities.len(), 3);
        let pool = entities.iter().find(|e| e.entity_id == "foundry").unwrap();
        assert_eq!(pool.entity_type, EntityType::MiningPool);
        assert_eq!(pool.coinbase_tags(), vec!["Foundry USA".to_string()]);
    }

    #[tokio::test]
    async fn entity_loader_reads_store() {
        let db = temp_db();
        for e in sample_entities() {
            db.upsert_entity(&e).unwrap();
        }
        let loaded = db.load_entities().await.unwrap();
        assert_eq!(loaded.len(), 3);
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_rows() {
        let db = temp_db();
        db.store_block(&sample_block()).unwrap();
        let mut old = Signal::new(SignalType::MinerBlock, 1, 0.9, json!({}));
        old.created_at = Utc::now() - chrono::Duration::hours(30);
        let fresh = Signal::new(SignalType::MinerBlock, 2, 0.9, json!({}));
        db.insert_signals(&[old, fresh.clone()]).unwrap();

        let report = db.cleanup_older_than(24).await.unwrap();
        assert_eq!(report.signals, 1);
        assert_eq!(report.blocks, 0);
        let left = db.recent_signals(10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].signal_id, fresh.signal_id);

        // everything ingested before "now + 1h" goes
        let report = db
            .lock()
            .cleanup_before(Utc::now() + chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(report.blocks, 1);
        assert_eq!(report.transactions, 3);
    }

    #[test]
    fn busy_is_transient() {
        let busy = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_transient());
        let constraint = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        ));
        assert!(!constraint.is_transient());
        assert!(StoreError::Unavailable("x".into()).is_transient());
    }
}
