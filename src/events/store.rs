//! Event persistence.
//!
//! # Responsibilities
//! - Insert a batch of events atomically (all or nothing)
//! - Delete events older than a cutoff, a bounded batch at a time
//!
//! # Implementations
//! - `MemoryEventStore`: process-local, used in tests and when no path is configured
//! - `SqliteEventStore`: one SQLite table, each batch in its own transaction
//!
//! Both mark events `processed` once they are written.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::PersistenceError;
use crate::events::types::LogEvent;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist `events` as processed, returning their assigned ids in order.
    async fn insert_batch(&self, events: &[LogEvent]) -> Result<Vec<u64>, PersistenceError>;

    /// Delete up to `limit` events created strictly before `cutoff`, oldest first.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize, PersistenceError>;

    /// Most recent events, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<LogEvent>, PersistenceError>;

    async fn count(&self) -> Result<usize, PersistenceError>;
}

#[derive(Debug, Default)]
struct Snapshot {
    next_id: u64,
    events: Vec<LogEvent>,
}

impl Snapshot {
    fn insert(&mut self, events: &[LogEvent]) -> Vec<u64> {
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            self.next_id += 1;
            let mut stored = event.clone();
            stored.id = Some(self.next_id);
            stored.processed = true;
            ids.push(self.next_id);
            self.events.push(stored);
        }
        ids
    }

    fn delete_older_than(&mut self, cutoff: DateTime<Utc>, limit: usize) -> usize {
        let mut expired: Vec<usize> = self
            .events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.created_at < cutoff)
            .map(|(i, _)| i)
            .collect();
        if expired.len() > limit {
            expired.sort_by_key(|&i| self.events[i].created_at);
            expired.truncate(limit);
        }

        let doomed: std::collections::HashSet<usize> = expired.into_iter().collect();
        let before = self.events.len();
        let mut index = 0;
        self.events.retain(|_| {
            let keep = !doomed.contains(&index);
            index += 1;
            keep
        });
        before - self.events.len()
    }

    fn recent(&self, limit: usize) -> Vec<LogEvent> {
        self.events.iter().rev().take(limit).cloned().collect()
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    inner: Mutex<Snapshot>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<LogEvent> {
        self.inner.lock().events.clone()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert_batch(&self, events: &[LogEvent]) -> Result<Vec<u64>, PersistenceError> {
        Ok(self.inner.lock().insert(events))
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize, PersistenceError> {
        Ok(self.inner.lock().delete_older_than(cutoff, limit))
    }

    async fn recent(&self, limit: usize) -> Result<Vec<LogEvent>, PersistenceError> {
        Ok(self.inner.lock().recent(limit))
    }

    async fn count(&self) -> Result<usize, PersistenceError> {
        Ok(self.inner.lock().events.len())
    }
}

/// Schema and per-connection settings for the SQLite store.
///
/// WAL keeps `recent` readers off the flush writer; the `created_at` index
/// keeps cleanup batches from scanning the table.
const SCHEMA_SQL: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS log_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,
    source TEXT
);
CREATE INDEX IF NOT EXISTS idx_log_events_created_at ON log_events(created_at);
";

const SELECT_COLUMNS: &str = "SELECT id, event_type, payload, created_at, processed, source FROM log_events";

type EventRow = (i64, String, String, i64, bool, Option<String>);

/// Store backed by a SQLite database file.
///
/// Statements run on the blocking pool; each mutation is one transaction, so
/// a failed batch leaves nothing behind and a cleanup batch only locks the
/// rows it deletes.
#[derive(Debug)]
pub struct SqliteEventStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEventStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        let target = path.clone();
        let conn = blocking(move || {
            let conn = Connection::open(&target)?;
            conn.execute_batch(SCHEMA_SQL)?;
            Ok(conn)
        })
        .await?;

        let store = Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        };
        let events = store.count().await?;
        tracing::info!(path = %store.path.display(), events, "Event store opened");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, PersistenceError>
    where
        F: FnOnce(&mut Connection) -> Result<T, PersistenceError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        blocking(move || f(&mut conn.lock())).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, PersistenceError>
where
    F: FnOnce() -> Result<T, PersistenceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PersistenceError::Unavailable(format!("store task failed: {e}")))?
}

fn event_from_row((id, event_type, payload, created_at, processed, source): EventRow) -> Result<LogEvent, PersistenceError> {
    let created_at = DateTime::<Utc>::from_timestamp_micros(created_at)
        .ok_or_else(|| PersistenceError::Corrupt(format!("event {id} has timestamp {created_at}")))?;
    Ok(LogEvent {
        id: Some(id as u64),
        event_type,
        payload: serde_json::from_str(&payload)?,
        created_at,
        processed,
        source,
    })
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn insert_batch(&self, events: &[LogEvent]) -> Result<Vec<u64>, PersistenceError> {
        let rows = events
            .iter()
            .map(|e| {
                Ok((
                    e.event_type.clone(),
                    serde_json::to_string(&e.payload)?,
                    e.created_at.timestamp_micros(),
                    e.source.clone(),
                ))
            })
            .collect::<Result<Vec<_>, PersistenceError>>()?;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut ids = Vec::with_capacity(rows.len());
            {
                let mut insert = tx.prepare_cached(
                    "INSERT INTO log_events (event_type, payload, created_at, processed, source) \
                     VALUES (?1, ?2, ?3, 1, ?4)",
                )?;
                for (event_type, payload, created_at, source) in &rows {
                    insert.execute(params![event_type, payload, created_at, source])?;
                    ids.push(tx.last_insert_rowid() as u64);
                }
            }
            tx.commit()?;
            Ok(ids)
        })
        .await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<usize, PersistenceError> {
        let cutoff = cutoff.timestamp_micros();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let deleted = tx.execute(
                "DELETE FROM log_events WHERE id IN \
                 (SELECT id FROM log_events WHERE created_at < ?1 ORDER BY created_at, id LIMIT ?2)",
                params![cutoff, limit],
            )?;
            tx.commit()?;
            Ok(deleted)
        })
        .await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<LogEvent>, PersistenceError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!("{SELECT_COLUMNS} ORDER BY id DESC LIMIT ?1"))?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
                })?
                .collect::<Result<Vec<EventRow>, _>>()?;
            rows.into_iter().map(event_from_row).collect()
        })
        .await
    }

    async fn count(&self) -> Result<usize, PersistenceError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM log_events", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }
}
