//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: CoValues, sessions, transactions, checkpoint signatures.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per CoValue
        CREATE TABLE covalues (
            covalue_id BLOB PRIMARY KEY,      -- 32 bytes, BLAKE3 of canonical header
            header BLOB NOT NULL,             -- CBOR encoded header
            stored_at INTEGER NOT NULL        -- local timestamp of first store
        );

        -- Per-session transaction count
        CREATE TABLE sessions (
            covalue_id BLOB NOT NULL,
            session_id TEXT NOT NULL,         -- text form of the session id
            tx_count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (covalue_id, session_id)
        );

        -- Session transactions in append order
        CREATE TABLE transactions (
            covalue_id BLOB NOT NULL,
            session_id TEXT NOT NULL,
            idx INTEGER NOT NULL,             -- 0-based position in the session
            tx BLOB NOT NULL,                 -- CBOR encoded transaction
            PRIMARY KEY (covalue_id, session_id, idx)
        );

        -- Signature recorded after the transaction at idx
        CREATE TABLE signatures (
            covalue_id BLOB NOT NULL,
            session_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            signature BLOB NOT NULL,          -- 64 bytes, Ed25519 signature
            PRIMARY KEY (covalue_id, session_id, idx)
        );
        "#,
    )?;

    Ok(())
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in ["covalues", "sessions", "transactions", "signatures", "schema_migrations"] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }
}
