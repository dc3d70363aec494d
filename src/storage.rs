//! Durable process records and the append-only output ledger.
//!
//! [`ProcessStore`] is the seam the supervisor writes through. Two backends:
//! [`InMemoryStore`] for tests and throwaway hosts, and [`SqliteStore`] for
//! anything that must survive a restart.

use crate::{
    error::StoreError,
    process_record::{epoch, OutputRecord, ProcessId, ProcessRecord, ProcessState},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Record store + output ledger.
///
/// Every method is safe to call concurrently for different process ids.
/// Concurrent state writes for the *same* id are serialized by the supervisor.
#[async_trait]
pub trait ProcessStore: Send + Sync + 'static {
    /// Insert a new record
    async fn insert(&self, record: &ProcessRecord) -> Result<(), StoreError>;

    /// Build and insert a record in `initialized` state
    async fn create(
        &self,
        command: &str,
        args: &[String],
        label: &str,
    ) -> Result<ProcessRecord, StoreError> {
        let record = ProcessRecord::new(command, args.to_vec(), label);
        self.insert(&record).await?;
        Ok(record)
    }

    async fn get(&self, id: ProcessId) -> Result<Option<ProcessRecord>, StoreError>;

    /// All records, oldest first
    async fn list(&self) -> Result<Vec<ProcessRecord>, StoreError>;

    async fn set_state(&self, id: ProcessId, state: ProcessState) -> Result<(), StoreError>;

    /// Move to `running` and record the process group leader in one write.
    async fn mark_running(&self, id: ProcessId, pid: Option<u32>) -> Result<(), StoreError>;

    /// Append one chunk. Fails with `RecordMissing` once the record is gone.
    async fn append_output(&self, record: &OutputRecord) -> Result<(), StoreError>;

    /// Records with `created_at > after`, ascending
    async fn output_after(
        &self,
        id: ProcessId,
        after: DateTime<Utc>,
    ) -> Result<Vec<OutputRecord>, StoreError>;

    async fn full_output(&self, id: ProcessId) -> Result<Vec<OutputRecord>, StoreError> {
        self.output_after(id, epoch()).await
    }

    async fn last_output_at(&self, id: ProcessId) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Delete the record and its ledger rows together. Returns whether a
    /// record existed.
    async fn delete(&self, id: ProcessId) -> Result<bool, StoreError>;
}

#[async_trait]
impl<S: ProcessStore + ?Sized> ProcessStore for Arc<S> {
    async fn insert(&self, record: &ProcessRecord) -> Result<(), StoreError> {
        (**self).insert(record).await
    }

    async fn get(&self, id: ProcessId) -> Result<Option<ProcessRecord>, StoreError> {
        (**self).get(id).await
    }

    async fn list(&self) -> Result<Vec<ProcessRecord>, StoreError> {
        (**self).list().await
    }

    async fn set_state(&self, id: ProcessId, state: ProcessState) -> Result<(), StoreError> {
        (**self).set_state(id, state).await
    }

    async fn mark_running(&self, id: ProcessId, pid: Option<u32>) -> Result<(), StoreError> {
        (**self).mark_running(id, pid).await
    }

    async fn append_output(&self, record: &OutputRecord) -> Result<(), StoreError> {
        (**self).append_output(record).await
    }

    async fn output_after(
        &self,
        id: ProcessId,
        after: DateTime<Utc>,
    ) -> Result<Vec<OutputRecord>, StoreError> {
        (**self).output_after(id, after).await
    }

    async fn last_output_at(&self, id: ProcessId) -> Result<Option<DateTime<Utc>>, StoreError> {
        (**self).last_output_at(id).await
    }

    async fn delete(&self, id: ProcessId) -> Result<bool, StoreError> {
        (**self).delete(id).await
    }
}

#[derive(Debug, Default)]
struct Tables {
    records: HashMap<ProcessId, ProcessRecord>,
    ledger: HashMap<ProcessId, Vec<OutputRecord>>,
}

/// In-process store, shared between clones.
///
/// A single lock covers records and ledger, so a delete is never partially
/// observable.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessStore for InMemoryStore {
    async fn insert(&self, record: &ProcessRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if tables.records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        tables.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: ProcessId) -> Result<Option<ProcessRecord>, StoreError> {
        Ok(self.tables.read().records.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<ProcessRecord>, StoreError> {
        let mut records: Vec<ProcessRecord> = self.tables.read().records.values().cloned().collect();
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }

    async fn set_state(&self, id: ProcessId, state: ProcessState) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let record = tables
            .records
            .get_mut(&id)
            .ok_or(StoreError::RecordMissing(id))?;
        record.state = state;
        Ok(())
    }

    async fn mark_running(&self, id: ProcessId, pid: Option<u32>) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let record = tables
            .records
            .get_mut(&id)
            .ok_or(StoreError::RecordMissing(id))?;
        record.state = ProcessState::Running;
        record.pid = pid;
        Ok(())
    }

    async fn append_output(&self, record: &OutputRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.records.contains_key(&record.process_id) {
            return Err(StoreError::RecordMissing(record.process_id));
        }
        let rows = tables.ledger.entry(record.process_id).or_default();
        let at = rows.partition_point(|row| row.created_at <= record.created_at);
        rows.insert(at, record.clone());
        Ok(())
    }

    async fn output_after(
        &self,
        id: ProcessId,
        after: DateTime<Utc>,
    ) -> Result<Vec<OutputRecord>, StoreError> {
        let tables = self.tables.read();
        let Some(rows) = tables.ledger.get(&id) else {
            return Ok(Vec::new());
        };
        let start = rows.partition_point(|row| row.created_at <= after);
        Ok(rows[start..].to_vec())
    }

    async fn last_output_at(&self, id: ProcessId) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .tables
            .read()
            .ledger
            .get(&id)
            .and_then(|rows| rows.last())
            .map(|row| row.created_at))
    }

    async fn delete(&self, id: ProcessId) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        tables.ledger.remove(&id);
        Ok(tables.records.remove(&id).is_some())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS processes (
  id TEXT PRIMARY KEY,
  label TEXT NOT NULL,
  command TEXT NOT NULL,
  args TEXT NOT NULL,
  state TEXT NOT NULL,
  pid INTEGER,
  created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS process_output (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  process_id TEXT NOT NULL,
  data TEXT NOT NULL,
  created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_process_output_time ON process_output(process_id, created_at);
CREATE INDEX IF NOT EXISTS idx_processes_created ON processes(created_at);
"#;

type ProcessRow = (String, String, String, String, String, Option<i64>, i64);

const PROCESS_COLUMNS: &str = "id, label, command, args, state, pid, created_at";

/// SQLite-backed store. Timestamps are stored as integer microseconds.
///
/// rusqlite is blocking, so every call runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| StoreError::Corrupt(format!("cannot create {}: {err}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_millis(5_000))?;
        debug!(path = %path.display(), "opened sqlite process store");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        add_pid_column(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|err| StoreError::Join(err.to_string()))?
    }
}

/// Ledgers created before the pid column existed get it added in place.
fn add_pid_column(conn: &Connection) -> Result<(), StoreError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('processes')")?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    if !columns.iter().any(|name| name == "pid") {
        conn.execute("ALTER TABLE processes ADD COLUMN pid INTEGER", [])?;
        debug!("added pid column to processes table");
    }
    Ok(())
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {micros}")))
}

fn parse_id(raw: &str) -> Result<ProcessId, StoreError> {
    raw.parse()
        .map_err(|err| StoreError::Corrupt(format!("invalid process id '{raw}': {err}")))
}

fn row_to_record(row: ProcessRow) -> Result<ProcessRecord, StoreError> {
    let (id, label, command, args, state, pid, created_at) = row;
    let pid = pid
        .map(|raw| {
            u32::try_from(raw).map_err(|_| StoreError::Corrupt(format!("invalid pid {raw}")))
        })
        .transpose()?;
    Ok(ProcessRecord {
        id: parse_id(&id)?,
        label,
        command,
        args: serde_json::from_str(&args)?,
        state: state.parse().map_err(StoreError::Corrupt)?,
        pid,
        created_at: from_micros(created_at)?,
    })
}

fn read_process_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProcessRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

#[async_trait]
impl ProcessStore for SqliteStore {
    async fn insert(&self, record: &ProcessRecord) -> Result<(), StoreError> {
        let record = record.clone();
        let args = serde_json::to_string(&record.args)?;
        self.run(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO processes (id, label, command, args, state, pid, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.id.to_string(),
                    record.label,
                    record.command,
                    args,
                    record.state.as_str(),
                    record.pid,
                    to_micros(record.created_at)
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Duplicate(record.id));
            }
            Ok(())
        })
        .await
    }

    async fn get(&self, id: ProcessId) -> Result<Option<ProcessRecord>, StoreError> {
        self.run(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {PROCESS_COLUMNS} FROM processes WHERE id = ?1"),
                    params![id.to_string()],
                    read_process_row,
                )
                .optional()?;
            row.map(row_to_record).transpose()
        })
        .await
    }

    async fn list(&self) -> Result<Vec<ProcessRecord>, StoreError> {
        self.run(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROCESS_COLUMNS} FROM processes ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt
                .query_map([], read_process_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(row_to_record).collect()
        })
        .await
    }

    async fn set_state(&self, id: ProcessId, state: ProcessState) -> Result<(), StoreError> {
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE processes SET state = ?1 WHERE id = ?2",
                params![state.as_str(), id.to_string()],
            )?;
            if updated == 0 {
                return Err(StoreError::RecordMissing(id));
            }
            Ok(())
        })
        .await
    }

    async fn mark_running(&self, id: ProcessId, pid: Option<u32>) -> Result<(), StoreError> {
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE processes SET state = ?1, pid = ?2 WHERE id = ?3",
                params![ProcessState::Running.as_str(), pid, id.to_string()],
            )?;
            if updated == 0 {
                return Err(StoreError::RecordMissing(id));
            }
            Ok(())
        })
        .await
    }

    async fn append_output(&self, record: &OutputRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.run(move |conn| {
            let id = record.process_id.to_string();
            let inserted = conn.execute(
                "INSERT INTO process_output (process_id, data, created_at)
                 SELECT ?1, ?2, ?3 WHERE EXISTS (SELECT 1 FROM processes WHERE id = ?1)",
                params![id, record.data, to_micros(record.created_at)],
            )?;
            if inserted == 0 {
                return Err(StoreError::RecordMissing(record.process_id));
            }
            Ok(())
        })
        .await
    }

    async fn output_after(
        &self,
        id: ProcessId,
        after: DateTime<Utc>,
    ) -> Result<Vec<OutputRecord>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT data, created_at FROM process_output
                 WHERE process_id = ?1 AND created_at > ?2
                 ORDER BY created_at ASC, seq ASC",
            )?;
            let rows = stmt
                .query_map(params![id.to_string(), to_micros(after)], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(data, created_at)| {
                    Ok(OutputRecord {
                        process_id: id,
                        data,
                        created_at: from_micros(created_at)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn last_output_at(&self, id: ProcessId) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.run(move |conn| {
            let last: Option<i64> = conn.query_row(
                "SELECT MAX(created_at) FROM process_output WHERE process_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )?;
            last.map(from_micros).transpose()
        })
        .await
    }

    async fn delete(&self, id: ProcessId) -> Result<bool, StoreError> {
        self.run(move |conn| {
            let key = id.to_string();
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM process_output WHERE process_id = ?1", params![key])?;
            let removed = tx.execute("DELETE FROM processes WHERE id = ?1", params![key])?;
            tx.commit()?;
            Ok(removed > 0)
        })
        .await
    }
}
