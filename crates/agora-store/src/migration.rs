//! Versioned schema migrations for the SQLite backend.
//!
//! Migration N takes the schema from version N-1 to N. Applied versions are
//! recorded in `schema_migrations`, so [`migrate`] is idempotent.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

pub const CURRENT_VERSION: u32 = 1;

pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;
        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
            tracing::info!(version, "applied schema migration");
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

/// v1: blocks, entries, content-addressed payloads and sequence numbers.
/// Values are CBOR blobs; the key columns are what we query by.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE accounting_blocks (
            height INTEGER PRIMARY KEY,
            hash BLOB NOT NULL,               -- 32 bytes
            block BLOB NOT NULL               -- CBOR AccountingBlock
        );

        CREATE TABLE protected_entries (
            key BLOB PRIMARY KEY,             -- 32 bytes, payload hash
            entry BLOB NOT NULL,              -- CBOR StorageEntry
            stored_at INTEGER NOT NULL
        );

        CREATE TABLE append_only_payloads (
            hash BLOB PRIMARY KEY,
            payload BLOB NOT NULL             -- CBOR AppendOnlyPayload
        );

        CREATE TABLE sequence_numbers (
            key BLOB PRIMARY KEY,
            sequence_number INTEGER NOT NULL,
            recorded_at INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
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

        for table in [
            "accounting_blocks",
            "append_only_payloads",
            "protected_entries",
            "schema_migrations",
            "sequence_numbers",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }
}
