//! SQLite implementation of [`Persistence`].
//!
//! Uses rusqlite with bundled SQLite. Every call runs on the blocking pool
//! via `tokio::task::spawn_blocking`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection};

use agora_core::{AccountingBlock, AppendOnlyPayload, PayloadHash, StorageEntry};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::persistence::{decode, encode, Persistence};
use crate::sequence::SequenceRecord;

/// SQLite-backed persistence. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct SqlitePersistence {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePersistence {
    /// Open (creating if needed) and migrate the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Background(format!("connection mutex poisoned: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Background(e.to_string()))?
    }
}

fn key_from_blob(blob: Vec<u8>) -> Result<PayloadHash> {
    PayloadHash::try_from(blob.as_slice())
        .map_err(|_| StoreError::InvalidData(format!("expected 32-byte key, got {}", blob.len())))
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn save_blocks(&self, blocks: &[AccountingBlock]) -> Result<()> {
        let rows = blocks
            .iter()
            .map(|b| -> Result<_> { Ok((b.height as i64, b.hash.as_bytes().to_vec(), encode(b)?)) })
            .collect::<Result<Vec<_>>>()?;

        self.run(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO accounting_blocks (height, hash, block) VALUES (?1, ?2, ?3)",
                )?;
                for (height, hash, block) in &rows {
                    stmt.execute(params![height, hash, block])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn load_blocks(&self) -> Result<Vec<AccountingBlock>> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT block FROM accounting_blocks ORDER BY height ASC")?;
            let blobs = stmt
                .query_map([], |row| row.get::<_, Vec<u8>>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            blobs.iter().map(|b| decode::<AccountingBlock>(b)).collect()
        })
        .await
    }

    async fn delete_blocks_from(&self, height: u64) -> Result<usize> {
        self.run(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM accounting_blocks WHERE height >= ?1",
                params![height as i64],
            )?;
            Ok(deleted)
        })
        .await
    }

    async fn save_entry(&self, entry: &StorageEntry) -> Result<()> {
        let key = entry.key().as_bytes().to_vec();
        let blob = encode(entry)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO protected_entries (key, entry, stored_at) VALUES (?1, ?2, ?3)",
                params![key, blob, now_millis()],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_entry(&self, key: &PayloadHash) -> Result<()> {
        let key = key.as_bytes().to_vec();
        self.run(move |conn| {
            conn.execute("DELETE FROM protected_entries WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn load_entries(&self) -> Result<Vec<StorageEntry>> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT entry FROM protected_entries")?;
            let blobs = stmt
                .query_map([], |row| row.get::<_, Vec<u8>>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            blobs.iter().map(|b| decode::<StorageEntry>(b)).collect()
        })
        .await
    }

    async fn save_append_only(&self, hash: &PayloadHash, payload: &AppendOnlyPayload) -> Result<()> {
        let hash = hash.as_bytes().to_vec();
        let blob = encode(payload)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO append_only_payloads (hash, payload) VALUES (?1, ?2)",
                params![hash, blob],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_append_only(&self) -> Result<Vec<(PayloadHash, AppendOnlyPayload)>> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT hash, payload FROM append_only_payloads")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(hash, blob)| -> Result<(PayloadHash, AppendOnlyPayload)> {
                    Ok((key_from_blob(hash)?, decode(&blob)?))
                })
                .collect()
        })
        .await
    }

    async fn save_sequence_numbers(&self, records: &[(PayloadHash, SequenceRecord)]) -> Result<()> {
        let records = records.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM sequence_numbers", [])?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO sequence_numbers (key, sequence_number, recorded_at) VALUES (?1, ?2, ?3)",
                )?;
                for (key, record) in &records {
                    stmt.execute(params![
                        key.as_bytes().as_slice(),
                        record.sequence_number as i64,
                        record.recorded_at
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn load_sequence_numbers(&self) -> Result<Vec<(PayloadHash, SequenceRecord)>> {
        self.run(|conn| {
            let mut stmt =
                conn.prepare("SELECT key, sequence_number, recorded_at FROM sequence_numbers")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(key, seq, recorded_at)| -> Result<(PayloadHash, SequenceRecord)> {
                    Ok((
                        key_from_blob(key)?,
                        SequenceRecord {
                            sequence_number: seq as u64,
                            recorded_at,
                        },
                    ))
                })
                .collect()
        })
        .await
    }
}
