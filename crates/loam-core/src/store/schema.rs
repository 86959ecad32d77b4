//! SQLite schema for the replica store and its versioned migrations.
//!
//! - `operations` is keyed by `(oid, timestamp)`; both are stored as their
//!   canonical text, whose byte order matches the in-memory order, so range
//!   scans and cutoff comparisons run directly in SQL
//! - `baselines` holds at most one row per OID
//! - `replicas` stores registry entries as JSON
//! - `store_meta` carries small key/value facts such as the schema version

use rusqlite::{Connection, types::Type};

/// Migration v1: operations, baselines and metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS operations (
    oid TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    data TEXT NOT NULL,
    authz TEXT,
    PRIMARY KEY (oid, timestamp)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS baselines (
    oid TEXT PRIMARY KEY,
    snapshot TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    authz TEXT
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS store_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;
";

/// Migration v2: replica registry and a timestamp index for cutoff scans.
pub const MIGRATION_V2_SQL: &str = r"
CREATE TABLE IF NOT EXISTS replicas (
    id TEXT PRIMARY KEY,
    info TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_operations_timestamp ON operations(timestamp);
";

/// Indexes the latest schema must contain.
pub const REQUIRED_INDEXES: &[&str] = &["idx_operations_timestamp"];

/// Latest store schema version understood by this binary.
pub const LATEST_STORE_VERSION: u32 = 2;

const MIGRATIONS: &[(u32, &str)] = &[(1, MIGRATION_V1_SQL), (2, MIGRATION_V2_SQL)];

/// Read `PRAGMA user_version` as a `u32`.
///
/// # Errors
///
/// Returns an error if the query fails or the value does not fit a `u32`.
pub fn current_store_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(version).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(error))
    })
}

/// Apply pending migrations in ascending order, one transaction each.
///
/// # Errors
///
/// Returns an error if any migration fails; earlier migrations stay applied.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<u32> {
    let mut current = current_store_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", i64::from(*version))?;
        tx.commit()?;
        tracing::debug!(version, "applied store migration");
        current = *version;
    }

    Ok(current)
}
