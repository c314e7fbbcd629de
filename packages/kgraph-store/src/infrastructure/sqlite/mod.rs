//! SQLite Item Store
//!
//! File-based persistent storage using SQLite. Structured columns hold the
//! fields queries filter on; nested values (item state, facts, warnings) are
//! stored as JSON text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{
    Batch, BatchStatus, EmbeddingJobRef, EmbeddingJobStatus, InsertOutcome, Item, ItemStage,
    ItemState, ItemStore, ItemTransition, LogEntry, LogLevel, RightsRecord, Stage,
};
use crate::error::{Result, StorageError};

/// SQLite-based ItemStore implementation
#[derive(Clone)]
pub struct SqliteItemStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteItemStore {
    /// Open (or create) a store at the given path
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS batches (
                batch_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                paused INTEGER NOT NULL DEFAULT 0,
                stats TEXT NOT NULL,
                literacy_score REAL,
                quality_warnings TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS items (
                item_id TEXT PRIMARY KEY,
                batch_id TEXT NOT NULL,
                content_hash TEXT NOT NULL UNIQUE,
                content_pointer TEXT NOT NULL,
                content TEXT NOT NULL,
                rights_id TEXT,
                state TEXT NOT NULL,
                facts TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (batch_id) REFERENCES batches(batch_id)
            );

            CREATE INDEX IF NOT EXISTS idx_items_batch ON items(batch_id);

            CREATE TABLE IF NOT EXISTS item_transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id TEXT NOT NULL,
                body TEXT NOT NULL,
                FOREIGN KEY (item_id) REFERENCES items(item_id)
            );

            CREATE INDEX IF NOT EXISTS idx_transitions_item ON item_transitions(item_id);

            CREATE TABLE IF NOT EXISTS rights_records (
                rights_id TEXT PRIMARY KEY,
                batch_id TEXT NOT NULL,
                contributor TEXT NOT NULL,
                license TEXT NOT NULL,
                confidence REAL NOT NULL,
                source_item TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_rights_batch ON rights_records(batch_id);

            CREATE TABLE IF NOT EXISTS embeddings (
                content_hash TEXT PRIMARY KEY,
                vector TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS embedding_jobs (
                job_id TEXT PRIMARY KEY,
                batch_id TEXT NOT NULL,
                provider_job_id TEXT NOT NULL,
                item_ids TEXT NOT NULL,
                status TEXT NOT NULL,
                consecutive_errors INTEGER NOT NULL DEFAULT 0,
                fallback_used INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_batch ON embedding_jobs(batch_id);

            CREATE TABLE IF NOT EXISTS batch_logs (
                batch_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                level TEXT NOT NULL,
                stage TEXT,
                message TEXT NOT NULL,
                at INTEGER NOT NULL,
                PRIMARY KEY (batch_id, seq)
            );",
        )?;

        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Row mapping
// ═══════════════════════════════════════════════════════════════════════════

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Ok(Uuid::parse_str(s)?)
}

/// Raw batch row; decoded outside the rusqlite closure so JSON errors surface
/// as `StorageError`.
struct BatchRow {
    id: String,
    name: String,
    status: String,
    paused: bool,
    stats: String,
    literacy_score: Option<f64>,
    quality_warnings: String,
    created_at: i64,
    updated_at: i64,
}

const BATCH_COLUMNS: &str = "batch_id, name, status, paused, stats, literacy_score, \
                             quality_warnings, created_at, updated_at";

impl BatchRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            status: row.get(2)?,
            paused: row.get(3)?,
            stats: row.get(4)?,
            literacy_score: row.get(5)?,
            quality_warnings: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn decode(self) -> Result<Batch> {
        Ok(Batch {
            id: parse_uuid(&self.id)?,
            name: self.name,
            status: serde_json::from_str::<BatchStatus>(&self.status)?,
            paused: self.paused,
            stats: serde_json::from_str(&self.stats)?,
            literacy_score: self.literacy_score,
            quality_warnings: serde_json::from_str(&self.quality_warnings)?,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

struct ItemRow {
    id: String,
    batch_id: String,
    content_hash: String,
    content_pointer: String,
    content: String,
    rights_id: Option<String>,
    state: String,
    facts: String,
    created_at: i64,
    updated_at: i64,
}

const ITEM_COLUMNS: &str = "item_id, batch_id, content_hash, content_pointer, content, \
                            rights_id, state, facts, created_at, updated_at";

impl ItemRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            batch_id: row.get(1)?,
            content_hash: row.get(2)?,
            content_pointer: row.get(3)?,
            content: row.get(4)?,
            rights_id: row.get(5)?,
            state: row.get(6)?,
            facts: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn decode(self, history: Vec<ItemTransition>) -> Result<Item> {
        Ok(Item {
            id: parse_uuid(&self.id)?,
            batch_id: parse_uuid(&self.batch_id)?,
            content_hash: self.content_hash,
            content_pointer: self.content_pointer,
            content: self.content,
            rights_id: self.rights_id,
            state: serde_json::from_str(&self.state)?,
            facts: serde_json::from_str(&self.facts)?,
            history,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

fn load_history(conn: &Connection, item_id: &str) -> Result<Vec<ItemTransition>> {
    let mut stmt =
        conn.prepare("SELECT body FROM item_transitions WHERE item_id = ?1 ORDER BY id")?;
    let bodies = stmt
        .query_map(params![item_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    bodies
        .iter()
        .map(|body| serde_json::from_str(body).map_err(StorageError::from))
        .collect()
}

fn load_item(conn: &Connection, where_clause: &str, key: &str) -> Result<Option<Item>> {
    let sql = format!("SELECT {} FROM items WHERE {} = ?1", ITEM_COLUMNS, where_clause);
    let row = conn
        .query_row(&sql, params![key], ItemRow::read)
        .optional()?;
    match row {
        Some(row) => {
            let history = load_history(conn, &row.id)?;
            Ok(Some(row.decode(history)?))
        }
        None => Ok(None),
    }
}

struct RightsRow {
    id: String,
    batch_id: String,
    contributor: String,
    license: String,
    confidence: f64,
    source_item: Option<String>,
    created_at: i64,
}

const RIGHTS_COLUMNS: &str =
    "rights_id, batch_id, contributor, license, confidence, source_item, created_at";

impl RightsRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            batch_id: row.get(1)?,
            contributor: row.get(2)?,
            license: row.get(3)?,
            confidence: row.get(4)?,
            source_item: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn decode(self) -> Result<RightsRecord> {
        Ok(RightsRecord {
            id: self.id,
            batch_id: parse_uuid(&self.batch_id)?,
            contributor: self.contributor,
            license: self.license,
            confidence: self.confidence,
            source_item: self.source_item.as_deref().map(parse_uuid).transpose()?,
            created_at: from_millis(self.created_at),
        })
    }
}

struct JobRow {
    id: String,
    batch_id: String,
    provider_job_id: String,
    item_ids: String,
    status: String,
    consecutive_errors: u32,
    fallback_used: bool,
    created_at: i64,
    updated_at: i64,
}

const JOB_COLUMNS: &str = "job_id, batch_id, provider_job_id, item_ids, status, \
                           consecutive_errors, fallback_used, created_at, updated_at";

impl JobRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            batch_id: row.get(1)?,
            provider_job_id: row.get(2)?,
            item_ids: row.get(3)?,
            status: row.get(4)?,
            consecutive_errors: row.get(5)?,
            fallback_used: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn decode(self) -> Result<EmbeddingJobRef> {
        Ok(EmbeddingJobRef {
            id: parse_uuid(&self.id)?,
            batch_id: parse_uuid(&self.batch_id)?,
            provider_job_id: self.provider_job_id,
            item_ids: serde_json::from_str(&self.item_ids)?,
            status: EmbeddingJobStatus::from_str(&self.status)?,
            consecutive_errors: self.consecutive_errors,
            fallback_used: self.fallback_used,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ItemStore
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
impl ItemStore for SqliteItemStore {
    async fn create_batch(&self, batch: &Batch) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO batches ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                BATCH_COLUMNS
            ),
            params![
                batch.id.to_string(),
                &batch.name,
                serde_json::to_string(&batch.status)?,
                batch.paused,
                serde_json::to_string(&batch.stats)?,
                batch.literacy_score,
                serde_json::to_string(&batch.quality_warnings)?,
                millis(batch.created_at),
                millis(batch.updated_at),
            ],
        )?;
        Ok(())
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<Batch>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM batches WHERE batch_id = ?1", BATCH_COLUMNS),
                params![batch_id.to_string()],
                BatchRow::read,
            )
            .optional()?;
        row.map(BatchRow::decode).transpose()
    }

    async fn list_batches(&self) -> Result<Vec<Batch>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM batches ORDER BY created_at, batch_id",
            BATCH_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], BatchRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(BatchRow::decode).collect()
    }

    async fn update_batch(&self, batch: &Batch) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE batches SET name = ?2, status = ?3, stats = ?4,
                 literacy_score = ?5, quality_warnings = ?6, updated_at = ?7
             WHERE batch_id = ?1",
            params![
                batch.id.to_string(),
                &batch.name,
                serde_json::to_string(&batch.status)?,
                serde_json::to_string(&batch.stats)?,
                batch.literacy_score,
                serde_json::to_string(&batch.quality_warnings)?,
                millis(batch.updated_at),
            ],
        )?;
        if updated == 0 {
            return Err(StorageError::batch_not_found(batch.id));
        }
        Ok(())
    }

    async fn set_batch_paused(&self, batch_id: Uuid, paused: bool) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE batches SET paused = ?2, updated_at = ?3 WHERE batch_id = ?1",
            params![batch_id.to_string(), paused, millis(Utc::now())],
        )?;
        if updated == 0 {
            return Err(StorageError::batch_not_found(batch_id));
        }
        Ok(())
    }

    async fn insert_item(&self, item: &Item) -> Result<InsertOutcome> {
        let conn = self.conn.lock();
        let existing: Option<String> = conn
            .query_row(
                "SELECT item_id FROM items WHERE content_hash = ?1",
                params![&item.content_hash],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(InsertOutcome::Existing(parse_uuid(&id)?));
        }

        conn.execute(
            &format!(
                "INSERT INTO items ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                ITEM_COLUMNS
            ),
            params![
                item.id.to_string(),
                item.batch_id.to_string(),
                &item.content_hash,
                &item.content_pointer,
                &item.content,
                &item.rights_id,
                serde_json::to_string(&item.state)?,
                serde_json::to_string(&item.facts)?,
                millis(item.created_at),
                millis(item.updated_at),
            ],
        )?;
        Ok(InsertOutcome::Inserted(item.id))
    }

    async fn get_item(&self, item_id: Uuid) -> Result<Option<Item>> {
        let conn = self.conn.lock();
        load_item(&conn, "item_id", &item_id.to_string())
    }

    async fn get_item_by_hash(&self, content_hash: &str) -> Result<Option<Item>> {
        let conn = self.conn.lock();
        load_item(&conn, "content_hash", content_hash)
    }

    async fn list_items(&self, batch_id: Uuid) -> Result<Vec<Item>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM items WHERE batch_id = ?1 ORDER BY rowid",
            ITEM_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![batch_id.to_string()], ItemRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let history = load_history(&conn, &row.id)?;
            items.push(row.decode(history)?);
        }
        Ok(items)
    }

    async fn transition_item(
        &self,
        item_id: Uuid,
        transition: ItemTransition,
        facts: Option<(ItemStage, serde_json::Value)>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let id = item_id.to_string();

        let current: Option<(String, String)> = tx
            .query_row(
                "SELECT state, facts FROM items WHERE item_id = ?1",
                params![&id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (state_json, facts_json) = current.ok_or_else(|| StorageError::item_not_found(item_id))?;

        let stored: ItemState = serde_json::from_str(&state_json)?;
        if stored != transition.from {
            return Ok(false);
        }

        let mut merged: serde_json::Value = serde_json::from_str(&facts_json)?;
        if let Some((stage, value)) = facts {
            if !merged.is_object() {
                merged = serde_json::json!({});
            }
            if let Some(map) = merged.as_object_mut() {
                map.insert(stage.as_str().to_string(), value);
            }
        }

        tx.execute(
            "UPDATE items SET state = ?2, facts = ?3, updated_at = ?4 WHERE item_id = ?1",
            params![
                &id,
                serde_json::to_string(&transition.to)?,
                serde_json::to_string(&merged)?,
                millis(transition.at),
            ],
        )?;
        tx.execute(
            "INSERT INTO item_transitions (item_id, body) VALUES (?1, ?2)",
            params![&id, serde_json::to_string(&transition)?],
        )?;
        tx.commit()?;
        Ok(true)
    }

    async fn set_item_rights(&self, item_id: Uuid, rights_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE items SET rights_id = ?2 WHERE item_id = ?1",
            params![item_id.to_string(), rights_id],
        )?;
        if updated == 0 {
            return Err(StorageError::item_not_found(item_id));
        }
        Ok(())
    }

    async fn upsert_rights(&self, record: &RightsRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO rights_records ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                RIGHTS_COLUMNS
            ),
            params![
                &record.id,
                record.batch_id.to_string(),
                &record.contributor,
                &record.license,
                record.confidence,
                record.source_item.map(|id| id.to_string()),
                millis(record.created_at),
            ],
        )?;
        Ok(())
    }

    async fn get_rights(&self, rights_id: &str) -> Result<Option<RightsRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM rights_records WHERE rights_id = ?1",
                    RIGHTS_COLUMNS
                ),
                params![rights_id],
                RightsRow::read,
            )
            .optional()?;
        row.map(RightsRow::decode).transpose()
    }

    async fn list_rights(&self, batch_id: Uuid) -> Result<Vec<RightsRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM rights_records WHERE batch_id = ?1 ORDER BY rights_id",
            RIGHTS_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![batch_id.to_string()], RightsRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RightsRow::decode).collect()
    }

    async fn store_embedding(&self, content_hash: &str, vector: &[f32]) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO embeddings (content_hash, vector, created_at)
             VALUES (?1, ?2, ?3)",
            params![
                content_hash,
                serde_json::to_string(vector)?,
                millis(Utc::now())
            ],
        )?;
        Ok(())
    }

    async fn get_embedding(&self, content_hash: &str) -> Result<Option<Vec<f32>>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT vector FROM embeddings WHERE content_hash = ?1",
                params![content_hash],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|v| serde_json::from_str(&v).map_err(StorageError::from))
            .transpose()
    }

    async fn save_job(&self, job: &EmbeddingJobRef) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO embedding_jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                JOB_COLUMNS
            ),
            params![
                job.id.to_string(),
                job.batch_id.to_string(),
                &job.provider_job_id,
                serde_json::to_string(&job.item_ids)?,
                job.status.as_str(),
                job.consecutive_errors,
                job.fallback_used,
                millis(job.created_at),
                millis(job.updated_at),
            ],
        )?;
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<EmbeddingJobRef>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM embedding_jobs WHERE job_id = ?1", JOB_COLUMNS),
                params![job_id.to_string()],
                JobRow::read,
            )
            .optional()?;
        row.map(JobRow::decode).transpose()
    }

    async fn list_jobs(&self, batch_id: Uuid) -> Result<Vec<EmbeddingJobRef>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM embedding_jobs WHERE batch_id = ?1 ORDER BY rowid",
            JOB_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![batch_id.to_string()], JobRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(JobRow::decode).collect()
    }

    async fn delete_jobs(&self, batch_id: Uuid) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM embedding_jobs WHERE batch_id = ?1",
            params![batch_id.to_string()],
        )?;
        Ok(())
    }

    async fn append_log(&self, entry: LogEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO batch_logs (batch_id, seq, level, stage, message, at)
             VALUES (?1,
                     (SELECT COALESCE(MAX(seq), 0) + 1 FROM batch_logs WHERE batch_id = ?1),
                     ?2, ?3, ?4, ?5)",
            params![
                entry.batch_id.to_string(),
                entry.level.as_str(),
                entry.stage.map(|s| s.as_str()),
                &entry.message,
                millis(entry.at),
            ],
        )?;
        Ok(())
    }

    async fn list_logs(&self, batch_id: Uuid) -> Result<Vec<LogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT seq, level, stage, message, at FROM batch_logs
             WHERE batch_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![batch_id.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(seq, level, stage, message, at)| -> Result<LogEntry> {
                Ok(LogEntry {
                    batch_id,
                    seq: seq as u64,
                    level: LogLevel::from_str(&level)?,
                    stage: stage.as_deref().map(Stage::from_str).transpose()?,
                    message,
                    at: from_millis(at),
                })
            })
            .collect()
    }
}
