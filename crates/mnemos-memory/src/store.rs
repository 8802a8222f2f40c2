//! Embedding Record Store.
//!
//! Persists embedding records to SQLite. One [`RecordStore`] owns one
//! connection and serves one logical collection: a table, optionally narrowed
//! to a single owner by a scope column (the agent id for agent memories).
//!
//! # Storage layout
//!
//! | table                 | record type                 | scope column |
//! |-----------------------|-----------------------------|--------------|
//! | `document_embeddings` | [`EmbeddingRecord`]         | –            |
//! | `agent_memories`      | [`AgentMemoryRecord`]       | `agent_id`   |
//!
//! Vectors are stored as little-endian `f32` blobs (4 × N bytes), metadata as
//! JSON text and timestamps as RFC-3339 strings, so a record read back is
//! identical to the one written.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mnemos_types::{AgentMemoryRecord, EmbeddingRecord, Metadata};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, Row, ToSql, params};
use tracing::debug;
use uuid::Uuid;

use crate::error::{MemoryError, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────────
// StorageLocation
// ─────────────────────────────────────────────────────────────────────────────

/// Where a store keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    /// A private in-memory database per connection (lost on drop).
    InMemory,
    /// A SQLite database file shared by every store opened on it.
    File(PathBuf),
}

impl StorageLocation {
    pub(crate) fn connect(&self) -> Result<Connection> {
        match self {
            StorageLocation::InMemory => Ok(Connection::open_in_memory()?),
            StorageLocation::File(path) => {
                let conn = Connection::open(path)?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get::<_, String>(0)
                })?;
                Ok(conn)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Column helpers
// ─────────────────────────────────────────────────────────────────────────────

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn read_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| rusqlite::Error::InvalidColumnType(idx, e.to_string(), Type::Text))
}

fn read_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    raw.parse::<DateTime<Utc>>()
        .map_err(|e| rusqlite::Error::InvalidColumnType(idx, e.to_string(), Type::Text))
}

fn read_metadata(row: &Row<'_>, idx: usize) -> rusqlite::Result<Metadata> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

// ─────────────────────────────────────────────────────────────────────────────
// StoredRecord
// ─────────────────────────────────────────────────────────────────────────────

/// A record type that knows its own table layout.
pub trait StoredRecord: Clone + Send + Sync + 'static {
    const TABLE: &'static str;
    /// `CREATE TABLE IF NOT EXISTS …` batch for [`Self::TABLE`].
    const SCHEMA: &'static str;
    /// Column list read back by [`StoredRecord::read`], in order.
    const COLUMNS: &'static str;
    /// Column narrowing the table to one owner, if the type is owned.
    const SCOPE_COLUMN: Option<&'static str>;

    /// The embedded content/vector record.
    fn base(&self) -> &EmbeddingRecord;

    fn write(&self, conn: &Connection) -> Result<()>;

    fn read(row: &Row<'_>) -> rusqlite::Result<Self>;
}

impl StoredRecord for EmbeddingRecord {
    const TABLE: &'static str = "document_embeddings";
    const SCHEMA: &'static str = "CREATE TABLE IF NOT EXISTS document_embeddings (
            id          TEXT NOT NULL PRIMARY KEY,
            subject_id  TEXT,
            category    TEXT,
            content     TEXT NOT NULL,
            embedding   BLOB NOT NULL,
            metadata    TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_document_embeddings_category
            ON document_embeddings (category);";
    const COLUMNS: &'static str = "id, subject_id, category, content, embedding, metadata, created_at";
    const SCOPE_COLUMN: Option<&'static str> = None;

    fn base(&self) -> &EmbeddingRecord {
        self
    }

    fn write(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO document_embeddings
                 (id, subject_id, category, content, embedding, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                self.id.to_string(),
                self.subject_id,
                self.category,
                self.content,
                embedding_to_bytes(&self.vector),
                serde_json::to_string(&self.metadata)?,
                self.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        let blob: Vec<u8> = row.get(4)?;
        Ok(EmbeddingRecord {
            id: read_uuid(row, 0)?,
            subject_id: row.get(1)?,
            category: row.get(2)?,
            content: row.get(3)?,
            vector: bytes_to_embedding(&blob),
            metadata: read_metadata(row, 5)?,
            created_at: read_timestamp(row, 6)?,
        })
    }
}

impl StoredRecord for AgentMemoryRecord {
    const TABLE: &'static str = "agent_memories";
    const SCHEMA: &'static str = "CREATE TABLE IF NOT EXISTS agent_memories (
            id               TEXT NOT NULL PRIMARY KEY,
            agent_id         TEXT NOT NULL,
            memory_type      TEXT,
            content          TEXT NOT NULL,
            embedding        BLOB NOT NULL,
            importance_score REAL NOT NULL,
            access_count     INTEGER NOT NULL DEFAULT 0,
            last_accessed    TEXT NOT NULL,
            metadata         TEXT NOT NULL,
            created_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_agent_memories_agent
            ON agent_memories (agent_id);";
    const COLUMNS: &'static str = "id, agent_id, memory_type, content, embedding, importance_score, \
         access_count, last_accessed, metadata, created_at";
    const SCOPE_COLUMN: Option<&'static str> = Some("agent_id");

    fn base(&self) -> &EmbeddingRecord {
        &self.record
    }

    fn write(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO agent_memories
                 (id, agent_id, memory_type, content, embedding, importance_score,
                  access_count, last_accessed, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                self.record.id.to_string(),
                self.agent_id.to_string(),
                self.record.category,
                self.record.content,
                embedding_to_bytes(&self.record.vector),
                f64::from(self.importance_score),
                self.access_count as i64,
                self.last_accessed.to_rfc3339(),
                serde_json::to_string(&self.record.metadata)?,
                self.record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        let blob: Vec<u8> = row.get(4)?;
        let importance: f64 = row.get(5)?;
        let access_count: i64 = row.get(6)?;
        Ok(AgentMemoryRecord {
            record: EmbeddingRecord {
                id: read_uuid(row, 0)?,
                subject_id: None,
                category: row.get(2)?,
                content: row.get(3)?,
                vector: bytes_to_embedding(&blob),
                metadata: read_metadata(row, 8)?,
                created_at: read_timestamp(row, 9)?,
            },
            agent_id: read_uuid(row, 1)?,
            importance_score: importance as f32,
            access_count: access_count.max(0) as u64,
            last_accessed: read_timestamp(row, 7)?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RecordStore
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed, dimension-checked record collection.
///
/// All statements run under one connection mutex, so every insert, delete and
/// update is atomic with respect to readers of the same store.
pub struct RecordStore<R: StoredRecord> {
    conn: Mutex<Connection>,
    dimension: usize,
    scope: Option<String>,
    _record: std::marker::PhantomData<fn() -> R>,
}

impl<R: StoredRecord> RecordStore<R> {
    /// Open (or create) the table for `R` at `location`.
    ///
    /// `scope` narrows every read and delete to rows whose
    /// [`StoredRecord::SCOPE_COLUMN`] equals it; it is ignored for unowned
    /// record types.
    pub fn open(location: &StorageLocation, dimension: usize, scope: Option<String>) -> Result<Self> {
        let conn = location.connect()?;
        conn.execute_batch(R::SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            dimension,
            scope: R::SCOPE_COLUMN.and(scope),
            _record: std::marker::PhantomData,
        })
    }

    /// Open a private in-memory store (useful for testing).
    pub fn open_in_memory(dimension: usize) -> Result<Self> {
        Self::open(&StorageLocation::InMemory, dimension, None)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| MemoryError::IndexUnavailable(format!("{} connection lock poisoned", R::TABLE)))
    }

    /// ` AND <scope_column> = ?n` (or ` WHERE …` when `first`), empty when
    /// unscoped.
    fn scope_clause(&self, first: bool, param: usize) -> String {
        match (R::SCOPE_COLUMN, &self.scope) {
            (Some(col), Some(_)) => {
                let kw = if first { "WHERE" } else { "AND" };
                format!(" {kw} {col} = ?{param}")
            }
            _ => String::new(),
        }
    }

    /// `leading` parameters followed by the scope value, if any.
    fn scoped_args<'a>(&'a self, leading: &[&'a dyn ToSql]) -> Vec<&'a dyn ToSql> {
        let mut args = leading.to_vec();
        if let Some(scope) = &self.scope {
            args.push(scope as &dyn ToSql);
        }
        args
    }

    /// Check the record against the collection contract.
    pub fn validate(&self, record: &R) -> Result<()> {
        let base = record.base();
        if base.vector.len() != self.dimension {
            return Err(MemoryError::dimension(self.dimension, base.vector.len()));
        }
        if base.content.trim().is_empty() {
            return Err(MemoryError::EmptyContent);
        }
        Ok(())
    }

    /// Persist `record` and return its id.
    pub fn insert(&self, record: &R) -> Result<Uuid> {
        self.validate(record)?;
        let id = record.base().id;
        let conn = self.lock()?;
        match record.write(&conn) {
            Ok(()) => {
                debug!(table = R::TABLE, %id, "stored record");
                Ok(id)
            }
            Err(MemoryError::Sqlite(rusqlite::Error::SqliteFailure(e, _)))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(MemoryError::DuplicateId(id))
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch one record by id.
    pub fn get(&self, id: &Uuid) -> Result<R> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?1{}",
            R::COLUMNS,
            R::TABLE,
            self.scope_clause(false, 2)
        );
        let id_str = id.to_string();
        let args = self.scoped_args(&[&id_str]);
        match conn.query_row(&sql, args.as_slice(), R::read) {
            Ok(record) => Ok(record),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(MemoryError::NotFound(format!("record {id}"))),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch several records in one lock acquisition. Missing ids are absent
    /// from the returned map.
    pub fn get_many(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, R>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?1{}",
            R::COLUMNS,
            R::TABLE,
            self.scope_clause(false, 2)
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut found = HashMap::with_capacity(ids.len());
        for id in ids {
            let id_str = id.to_string();
            let args = self.scoped_args(&[&id_str]);
            let mut rows = stmt.query(args.as_slice())?;
            if let Some(row) = rows.next()? {
                found.insert(*id, R::read(row)?);
            }
        }
        Ok(found)
    }

    /// All records in insertion order.
    pub fn all(&self) -> Result<Vec<R>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM {}{} ORDER BY rowid ASC",
            R::COLUMNS,
            R::TABLE,
            self.scope_clause(true, 1)
        );
        let mut stmt = conn.prepare(&sql)?;
        let args = self.scoped_args(&[]);
        let rows = stmt.query_map(args.as_slice(), R::read)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Ids of every record in scope, in insertion order.
    pub fn ids(&self) -> Result<Vec<Uuid>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT id FROM {}{} ORDER BY rowid ASC",
            R::TABLE,
            self.scope_clause(true, 1)
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let args = self.scoped_args(&[]);
        let rows = stmt.query_map(args.as_slice(), |row| read_uuid(row, 0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// SQLite's `data_version` for this connection. It changes whenever
    /// another connection commits to the same database file, never for
    /// writes made through this store.
    pub fn data_version(&self) -> Result<i64> {
        let conn = self.lock()?;
        let version: i64 = conn.query_row("PRAGMA data_version", [], |row| row.get(0))?;
        Ok(version)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let sql = format!("SELECT COUNT(*) FROM {}{}", R::TABLE, self.scope_clause(true, 1));
        let args = self.scoped_args(&[]);
        let n: i64 = conn.query_row(&sql, args.as_slice(), |row| row.get(0))?;
        Ok(n.max(0) as usize)
    }

    /// Remove one record. Returns [`MemoryError::NotFound`] if absent.
    pub fn delete(&self, id: &Uuid) -> Result<()> {
        let conn = self.lock()?;
        let sql = format!("DELETE FROM {} WHERE id = ?1{}", R::TABLE, self.scope_clause(false, 2));
        let id_str = id.to_string();
        let args = self.scoped_args(&[&id_str]);
        let changed = conn.execute(&sql, args.as_slice())?;
        if changed == 0 {
            return Err(MemoryError::NotFound(format!("record {id}")));
        }
        debug!(table = R::TABLE, %id, "deleted record");
        Ok(())
    }

    /// Remove every record in scope. Returns the number removed.
    pub fn purge(&self) -> Result<usize> {
        let conn = self.lock()?;
        let sql = format!("DELETE FROM {}{}", R::TABLE, self.scope_clause(true, 1));
        let args = self.scoped_args(&[]);
        Ok(conn.execute(&sql, args.as_slice())?)
    }
}

impl RecordStore<AgentMemoryRecord> {
    /// Increment `access_count` and stamp `last_accessed = at` on every
    /// memory in scope, as a single SQL statement.
    ///
    /// Returns the number of memories touched.
    pub fn touch_all(&self, at: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let sql = format!(
            "UPDATE agent_memories
                SET access_count = access_count + 1, last_accessed = ?1{}",
            self.scope_clause(true, 2)
        );
        let at = at.to_rfc3339();
        let args = self.scoped_args(&[&at]);
        Ok(conn.execute(&sql, args.as_slice())?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
