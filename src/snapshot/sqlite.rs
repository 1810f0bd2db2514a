//! SQLite-backed [`SnapshotStore`].
//!
//! One database file holds records and entries of any number of
//! jobs. Entries are append-only rows; deleting a snapshot removes
//! its record and entries in a single transaction.

use std::path::Path;
use std::sync::Mutex;
use std::sync::OnceLock;

use chrono::DateTime;
use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use crate::errors::ExecutionError;
use crate::execution::JobId;

use super::store::SnapshotStore;
use super::SnapshotEntry;
use super::SnapshotId;
use super::SnapshotRecord;

// The `'static` lifetime within [`Migrations`] is saying that the
// [`str`]s composing the migrations are `'static`.
static MIGRATIONS: OnceLock<Migrations<'static>> = OnceLock::new();

fn get_migrations() -> &'static Migrations<'static> {
    MIGRATIONS.get_or_init(|| {
        Migrations::new(vec![
            M::up(
                "CREATE TABLE records ( \
                 job_id INTEGER NOT NULL, \
                 snapshot_id INTEGER NOT NULL CHECK (snapshot_id >= 0), \
                 started_at TEXT NOT NULL, \
                 successful INTEGER NOT NULL CHECK (successful IN (0, 1)), \
                 PRIMARY KEY (job_id, snapshot_id) \
                 ) STRICT",
            ),
            M::up(
                "CREATE TABLE entries ( \
                 created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 seq INTEGER PRIMARY KEY, \
                 job_id INTEGER NOT NULL, \
                 snapshot_id INTEGER NOT NULL, \
                 vertex TEXT NOT NULL, \
                 ser_key TEXT NOT NULL, \
                 ser_value TEXT NOT NULL \
                 ) STRICT",
            ),
            M::up("CREATE INDEX entries_by_vertex ON entries (job_id, snapshot_id, vertex, seq)"),
        ])
    })
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection) -> Result<(), ExecutionError> {
    // These are recommended by Litestream.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    get_migrations().to_latest(conn)?;
    Ok(())
}

pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    /// Open or create the database file.
    pub fn open(file: &Path) -> Result<Self, ExecutionError> {
        tracing::info!("Opening snapshot store at {file:?}");
        let mut conn = Connection::open_with_flags(
            file,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        setup_conn(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, ExecutionError> {
        let mut conn = Connection::open_in_memory()?;
        setup_conn(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|err| err.into_inner())
    }
}

fn conversion_err(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

impl SnapshotStore for SqliteSnapshotStore {
    fn put_record(&self, record: &SnapshotRecord) -> Result<(), ExecutionError> {
        tracing::trace!("Writing {record:?}");
        self.conn().execute(
            "INSERT INTO records (job_id, snapshot_id, started_at, successful) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (job_id, snapshot_id) DO UPDATE \
             SET started_at = EXCLUDED.started_at, successful = EXCLUDED.successful",
            (
                record.job_id.0,
                record.snapshot_id.0,
                record.started_at.to_rfc3339(),
                record.successful,
            ),
        )?;
        Ok(())
    }

    fn records(&self, job_id: JobId) -> Result<Vec<SnapshotRecord>, ExecutionError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT snapshot_id, started_at, successful \
             FROM records \
             WHERE job_id = ?1 \
             ORDER BY snapshot_id",
        )?;
        let records = stmt
            .query_map((job_id.0,), |row| {
                let started_at: String = row.get(1)?;
                let started_at = DateTime::parse_from_rfc3339(&started_at)
                    .map_err(|err| conversion_err(1, err))?
                    .with_timezone(&Utc);
                Ok(SnapshotRecord {
                    job_id,
                    snapshot_id: SnapshotId(row.get(0)?),
                    started_at,
                    successful: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn append_entries(
        &self,
        job_id: JobId,
        snapshot_id: SnapshotId,
        vertex: &str,
        entries: &[SnapshotEntry],
    ) -> Result<(), ExecutionError> {
        let mut conn = self.conn();
        let txn = conn.transaction()?;
        for entry in entries {
            tracing::trace!("Writing {entry:?} for {vertex} in {snapshot_id}");
            txn.execute(
                "INSERT INTO entries (job_id, snapshot_id, vertex, ser_key, ser_value) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (
                    job_id.0,
                    snapshot_id.0,
                    vertex,
                    serde_json::to_string(&entry.key)?,
                    serde_json::to_string(&entry.value)?,
                ),
            )?;
        }
        txn.commit()?;
        Ok(())
    }

    fn entries(
        &self,
        job_id: JobId,
        snapshot_id: SnapshotId,
        vertex: &str,
    ) -> Result<Vec<SnapshotEntry>, ExecutionError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT ser_key, ser_value \
             FROM entries \
             WHERE job_id = ?1 AND snapshot_id = ?2 AND vertex = ?3 \
             ORDER BY seq",
        )?;
        let entries = stmt
            .query_map((job_id.0, snapshot_id.0, vertex), |row| {
                let key: String = row.get(0)?;
                let value: String = row.get(1)?;
                Ok(SnapshotEntry {
                    key: serde_json::from_str(&key).map_err(|err| conversion_err(0, err))?,
                    value: serde_json::from_str(&value).map_err(|err| conversion_err(1, err))?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn delete_snapshot(
        &self,
        job_id: JobId,
        snapshot_id: SnapshotId,
    ) -> Result<(), ExecutionError> {
        tracing::trace!("Deleting {snapshot_id} of {job_id}");
        let mut conn = self.conn();
        let txn = conn.transaction()?;
        txn.execute(
            "DELETE FROM records WHERE job_id = ?1 AND snapshot_id = ?2",
            (job_id.0, snapshot_id.0),
        )?;
        txn.execute(
            "DELETE FROM entries WHERE job_id = ?1 AND snapshot_id = ?2",
            (job_id.0, snapshot_id.0),
        )?;
        txn.commit()?;
        Ok(())
    }

    fn is_empty(&self, job_id: JobId) -> Result<bool, ExecutionError> {
        let count: i64 = self.conn().query_row(
            "SELECT (SELECT COUNT(*) FROM records WHERE job_id = ?1) \
             + (SELECT COUNT(*) FROM entries WHERE job_id = ?1)",
            (job_id.0,),
            |row| row.get(0),
        )?;
        Ok(count == 0)
    }
}

#[test]
fn sqlite_round_trips_records_and_entries() {
    use serde_json::json;

    use super::SnapshotKey;

    let store = SqliteSnapshotStore::open_in_memory().unwrap();
    let job = JobId(9);

    let mut record = SnapshotRecord::new(job, SnapshotId(0));
    store.put_record(&record).unwrap();
    record.successful = true;
    store.put_record(&record).unwrap();
    let records = store.records(job).unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].successful);
    assert_eq!(records[0].started_at, record.started_at);

    let entries = vec![
        SnapshotEntry::new(SnapshotKey::Partitioned(json!([1, "a"])), json!({"acc": 3})),
        SnapshotEntry::new(SnapshotKey::Broadcast(json!("next")), json!(12)),
    ];
    store
        .append_entries(job, SnapshotId(0), "aggregate", &entries)
        .unwrap();
    assert_eq!(
        store.entries(job, SnapshotId(0), "aggregate").unwrap(),
        entries
    );
    assert!(store.entries(job, SnapshotId(0), "other").unwrap().is_empty());

    assert!(!store.is_empty(job).unwrap());
    store.delete_snapshot(job, SnapshotId(0)).unwrap();
    assert!(store.is_empty(job).unwrap());
}
