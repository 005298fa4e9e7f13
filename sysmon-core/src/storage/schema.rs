//! SQL schema and migration chain.
//!
//! One linear chain, no down-migrations — this is a monitoring agent, not a
//! multi-tenant product. `schema_version` records the highest applied
//! migration; `migrate` is idempotent and safe to call on every open.

use rusqlite::Connection;

use crate::error::StorageError;

/// Highest migration this binary knows how to apply.
pub const CURRENT_VERSION: i64 = 1;

/// Opens the connection-wide pragmas: WAL journaling for
/// concurrent reads during ingestion, `NORMAL` synchronous for durability
/// without per-commit fsync cost.
pub fn apply_pragmas(conn: &Connection) -> Result<(), StorageError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

/// Runs every migration above the database's current `schema_version`.
pub fn migrate(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);",
    )?;
    let current: i64 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    if current < 1 {
        migrate_v1(conn)?;
    }

    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [CURRENT_VERSION])?;
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS metrics (
            timestamp   INTEGER NOT NULL,
            metric_type TEXT    NOT NULL,
            host        TEXT    NOT NULL,
            tags        TEXT    NOT NULL DEFAULT '',
            value       REAL    NOT NULL,
            PRIMARY KEY (timestamp, metric_type, host, tags)
        );
        CREATE INDEX IF NOT EXISTS idx_metrics_type_ts ON metrics (metric_type, timestamp);
        CREATE INDEX IF NOT EXISTS idx_metrics_host_ts ON metrics (host, timestamp);

        CREATE TABLE IF NOT EXISTS hosts (
            hostname     TEXT PRIMARY KEY,
            last_seen    INTEGER NOT NULL,
            first_seen   INTEGER NOT NULL,
            platform     TEXT NOT NULL DEFAULT 'Unknown',
            agent_version TEXT NOT NULL DEFAULT '',
            tags         TEXT NOT NULL DEFAULT ''
        );

        -- Reserved for a future anomaly-detection subsystem. The core
        -- never reads or writes this table; it only preserves it across
        -- migrations.
        CREATE TABLE IF NOT EXISTS baselines (
            key   TEXT PRIMARY KEY,
            value BLOB
        );",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_pragmas(&conn).unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        let version: i64 = conn
            .query_row("SELECT version FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn migrate_creates_expected_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        for table in ["metrics", "hosts", "baselines", "schema_version"] {
            let count: i64 = conn
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }
}
