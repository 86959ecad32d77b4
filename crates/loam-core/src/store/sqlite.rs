//! SQLite-backed [`Storage`].
//!
//! Runtime defaults match a single-writer, many-reader replica:
//! - `journal_mode = WAL` so readers are not blocked by an in-flight batch
//! - `busy_timeout = 5s` to ride out transient lock contention
//! - every [`WriteBatch`] runs in one transaction

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, params};

use super::schema;
use super::{Storage, StoreError, WriteBatch, WriteOp};
use crate::authz::Authorization;
use crate::clock::Timestamp;
use crate::oid::{Oid, OidRange};
use crate::operation::{Baseline, Operation, Patch};
use crate::replica::ReplicaInfo;

/// Busy timeout used for store connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const OPERATION_COLUMNS: &str = "oid, timestamp, data, authz";
const BASELINE_COLUMNS: &str = "oid, snapshot, timestamp, authz";

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store file, apply pragmas and migrate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or SQLite fails
    /// to open, configure or migrate the database.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn, true)
    }

    /// An in-memory store, mainly for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite fails to migrate the database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, false)
    }

    fn from_connection(mut conn: Connection, wal: bool) -> Result<Self, StoreError> {
        configure_connection(&conn, wal)?;
        let version = schema::migrate(&mut conn)?;
        tracing::debug!(version, "opened sqlite store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn configure_connection(conn: &Connection, wal: bool) -> rusqlite::Result<()> {
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    if wal {
        let _journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    }
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

type RawRow = (String, String, String, Option<String>);

fn read_raw(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn corrupt(what: &'static str, reason: impl ToString) -> StoreError {
    StoreError::Corrupt {
        what,
        reason: reason.to_string(),
    }
}

fn decode_authz(raw: Option<String>) -> Result<Option<Authorization>, StoreError> {
    raw.map(|tag| Authorization::parse(&tag).map_err(|e| corrupt("authorization", e)))
        .transpose()
}

fn decode_operation((oid, ts, data, authz): RawRow) -> Result<Operation, StoreError> {
    Ok(Operation {
        oid: Oid::parse(&oid).map_err(|e| corrupt("operation oid", e))?,
        timestamp: Timestamp::parse(&ts).map_err(|e| corrupt("operation timestamp", e))?,
        data: serde_json::from_str::<Patch>(&data)?,
        authz: decode_authz(authz)?,
    })
}

fn decode_baseline((oid, snapshot, ts, authz): RawRow) -> Result<Baseline, StoreError> {
    Ok(Baseline {
        oid: Oid::parse(&oid).map_err(|e| corrupt("baseline oid", e))?,
        snapshot: serde_json::from_str(&snapshot)?,
        timestamp: Timestamp::parse(&ts).map_err(|e| corrupt("baseline timestamp", e))?,
        authz: decode_authz(authz)?,
    })
}

fn query_rows<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<RawRow>, StoreError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, read_raw)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

impl Storage for SqliteStore {
    fn operations_in(&self, range: &OidRange) -> Result<Vec<Operation>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {OPERATION_COLUMNS} FROM operations
             WHERE oid >= ?1 AND oid < ?2 ORDER BY oid, timestamp"
        );
        query_rows(&conn, &sql, params![range.start, range.end])?
            .into_iter()
            .map(decode_operation)
            .collect()
    }

    fn baselines_in(&self, range: &OidRange) -> Result<Vec<Baseline>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {BASELINE_COLUMNS} FROM baselines
             WHERE oid >= ?1 AND oid < ?2 ORDER BY oid"
        );
        query_rows(&conn, &sql, params![range.start, range.end])?
            .into_iter()
            .map(decode_baseline)
            .collect()
    }

    fn operations_through(&self, cutoff: &Timestamp) -> Result<Vec<Operation>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {OPERATION_COLUMNS} FROM operations
             WHERE timestamp <= ?1 ORDER BY timestamp, oid"
        );
        query_rows(&conn, &sql, params![cutoff.encode()])?
            .into_iter()
            .map(decode_operation)
            .collect()
    }

    fn operations_after(&self, since: Option<&Timestamp>) -> Result<Vec<Operation>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {OPERATION_COLUMNS} FROM operations
             WHERE ?1 IS NULL OR timestamp > ?1 ORDER BY timestamp, oid"
        );
        query_rows(&conn, &sql, params![since.map(Timestamp::encode)])?
            .into_iter()
            .map(decode_operation)
            .collect()
    }

    fn all_baselines(&self) -> Result<Vec<Baseline>, StoreError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {BASELINE_COLUMNS} FROM baselines ORDER BY oid");
        query_rows(&conn, &sql, [])?
            .into_iter()
            .map(decode_baseline)
            .collect()
    }

    fn meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT value FROM store_meta WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn replicas(&self) -> Result<Vec<ReplicaInfo>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached("SELECT info FROM replicas ORDER BY id")?;
        let raw = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for write in batch.writes {
            match write {
                WriteOp::PutOperation(op) => {
                    tx.execute(
                        "INSERT OR IGNORE INTO operations (oid, timestamp, data, authz)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![
                            op.oid.as_str(),
                            op.timestamp.encode(),
                            serde_json::to_string(&op.data)?,
                            op.authz.as_ref().map(Authorization::as_str),
                        ],
                    )?;
                }
                WriteOp::DeleteOperation { oid, timestamp } => {
                    tx.execute(
                        "DELETE FROM operations WHERE oid = ?1 AND timestamp = ?2",
                        params![oid.as_str(), timestamp.encode()],
                    )?;
                }
                WriteOp::PutBaseline(baseline) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO baselines (oid, snapshot, timestamp, authz)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![
                            baseline.oid.as_str(),
                            serde_json::to_string(&baseline.snapshot)?,
                            baseline.timestamp.encode(),
                            baseline.authz.as_ref().map(Authorization::as_str),
                        ],
                    )?;
                }
                WriteOp::DeleteBaseline(oid) => {
                    tx.execute("DELETE FROM baselines WHERE oid = ?1", [oid.as_str()])?;
                }
                WriteOp::PutReplica(info) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO replicas (id, info) VALUES (?1, ?2)",
                        params![info.id.as_str(), serde_json::to_string(&info)?],
                    )?;
                }
                WriteOp::SetMeta { key, value } => {
                    tx.execute(
                        "INSERT OR REPLACE INTO store_meta (key, value) VALUES (?1, ?2)",
                        params![key, value],
                    )?;
                }
            }
        }
        // Dropping `tx` on an early return rolls the whole batch back.
        tx.commit()?;
        Ok(())
    }
}
