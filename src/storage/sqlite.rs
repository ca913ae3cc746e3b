//! SQLite-backed persistent coordination storage.
//!
//! Provides durable, transactionally-serialized index assignment and
//! integration progress tracking. Uses connection pooling via r2d2 for
//! concurrent access; every mutating operation runs inside its own
//! transaction so that two processes racing to sequence or integrate
//! never corrupt each other's view of the log.
//!
//! Every method hands its synchronous `rusqlite` work to
//! [`run_blocking`], which runs it on tokio's blocking thread pool rather
//! than inline on the calling task. `rusqlite` has no async API of its
//! own, so without this a transaction in progress (which can span a whole
//! sequencing or integration round) would tie up a runtime worker thread
//! for its entire duration, starving every other task scheduled onto that
//! thread.

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::Path;

use super::traits::{AntispamStore, CoordinatorStore, StorageError, StorageResult, COMPATIBILITY_VERSION};
use crate::entry::{Entry, SequencedEntry};

/// Runs a synchronous SQLite operation on tokio's blocking thread pool.
async fn run_blocking<F, T>(f: F) -> StorageResult<T>
where
    F: FnOnce() -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Database(format!("blocking task panicked: {}", e)))?
}

/// Initialize (if absent) and check a `meta` table holding a single
/// `compatibility_version` row, failing fatally on a foreign schema.
fn check_meta_compatibility(conn: &rusqlite::Connection) -> StorageResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            compatibility_version INTEGER NOT NULL
        );
        "#,
    )
    .map_err(db_err)?;
    conn.execute(
        "INSERT OR IGNORE INTO meta (id, compatibility_version) VALUES (0, ?1)",
        params![COMPATIBILITY_VERSION],
    )
    .map_err(db_err)?;
    let stored: i64 = conn
        .query_row("SELECT compatibility_version FROM meta WHERE id = 0", [], |r| r.get(0))
        .map_err(db_err)?;
    if stored as u32 != COMPATIBILITY_VERSION {
        return Err(StorageError::InvalidData(format!(
            "schema compatibility_version {} does not match library version {}",
            stored, COMPATIBILITY_VERSION
        )));
    }
    Ok(())
}

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

fn encode_batch(entries: &[SequencedEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for e in entries {
        out.extend_from_slice(&(e.bundle_data.len() as u32).to_be_bytes());
        out.extend_from_slice(&e.bundle_data);
        out.extend_from_slice(&e.leaf_hash);
    }
    out
}

fn decode_batch(bytes: &[u8]) -> Result<Vec<SequencedEntry>, StorageError> {
    let mut out = Vec::new();
    let mut cursor = 0usize;
    while cursor < bytes.len() {
        if cursor + 4 > bytes.len() {
            return Err(StorageError::InvalidData("truncated batch length".to_string()));
        }
        let len = u32::from_be_bytes(bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
        cursor += 4;
        if cursor + len + 32 > bytes.len() {
            return Err(StorageError::InvalidData("truncated batch body".to_string()));
        }
        let bundle_data = bytes[cursor..cursor + len].to_vec();
        cursor += len;
        let leaf_hash: [u8; 32] = bytes[cursor..cursor + 32].try_into().unwrap();
        cursor += 32;
        out.push(SequencedEntry { bundle_data, leaf_hash });
    }
    Ok(out)
}

/// SQLite-backed [`CoordinatorStore`].
pub struct SqliteCoordinatorStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteCoordinatorStore {
    /// Open (or create) the database at `db_path`.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(Self { pool })
    }

    /// An in-memory database, for tests.
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl CoordinatorStore for SqliteCoordinatorStore {
    async fn init_schema(&self) -> StorageResult<()> {
        let pool = self.pool.clone();
        run_blocking(move || {
            let conn = pool.get().map_err(|e| StorageError::Connection(e.to_string()))?;
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS seq_coord (
                    id INTEGER PRIMARY KEY CHECK (id = 0),
                    next_index INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS seq_batches (
                    first_index INTEGER PRIMARY KEY,
                    count INTEGER NOT NULL,
                    entries BLOB NOT NULL
                );
                CREATE TABLE IF NOT EXISTS int_coord (
                    id INTEGER PRIMARY KEY CHECK (id = 0),
                    integrated_size INTEGER NOT NULL,
                    root_hash BLOB NOT NULL
                );
                "#,
            )
            .map_err(db_err)?;
            conn.execute("INSERT OR IGNORE INTO seq_coord (id, next_index) VALUES (0, 0)", [])
                .map_err(db_err)?;
            let empty_root = Sha256::digest([]);
            conn.execute(
                "INSERT OR IGNORE INTO int_coord (id, integrated_size, root_hash) VALUES (0, 0, ?1)",
                params![empty_root.as_slice()],
            )
            .map_err(db_err)?;
            check_meta_compatibility(&conn)
        })
        .await
    }

    async fn check_compatibility(&self) -> StorageResult<()> {
        let pool = self.pool.clone();
        run_blocking(move || {
            let conn = pool.get().map_err(|e| StorageError::Connection(e.to_string()))?;
            check_meta_compatibility(&conn)
        })
        .await
    }

    async fn assign_entries(
        &self,
        entries: &[Entry],
        max_outstanding: u64,
    ) -> StorageResult<(u64, Vec<SequencedEntry>)> {
        let pool = self.pool.clone();
        let entries = entries.to_vec();
        run_blocking(move || {
            let mut conn = pool.get().map_err(|e| StorageError::Connection(e.to_string()))?;
            let tx = conn.transaction().map_err(db_err)?;

            let next_index: i64 = tx
                .query_row("SELECT next_index FROM seq_coord WHERE id = 0", [], |r| r.get(0))
                .map_err(db_err)?;
            let integrated_size: i64 = tx
                .query_row("SELECT integrated_size FROM int_coord WHERE id = 0", [], |r| r.get(0))
                .map_err(db_err)?;

            let outstanding = (next_index - integrated_size) as u64;
            if outstanding + entries.len() as u64 > max_outstanding {
                return Err(StorageError::Pushback(outstanding, max_outstanding));
            }

            let sequenced: Vec<SequencedEntry> = entries
                .iter()
                .enumerate()
                .map(|(i, e)| SequencedEntry::from_entry(e, next_index as u64 + i as u64))
                .collect();

            let encoded = encode_batch(&sequenced);
            tx.execute(
                "INSERT INTO seq_batches (first_index, count, entries) VALUES (?1, ?2, ?3)",
                params![next_index, entries.len() as i64, encoded],
            )
            .map_err(db_err)?;
            tx.execute(
                "UPDATE seq_coord SET next_index = ?1 WHERE id = 0",
                params![next_index + entries.len() as i64],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;

            Ok((next_index as u64, sequenced))
        })
        .await
    }

    async fn consume_entries<F, Fut>(
        &self,
        limit: usize,
        force_update: bool,
        consume: F,
    ) -> StorageResult<bool>
    where
        F: FnOnce(u64, Vec<SequencedEntry>) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<[u8; 32]>> + Send + 'static,
    {
        let pool = self.pool.clone();
        // `consume` drives async object-store I/O; bridging it back into
        // this synchronous transaction via `Handle::block_on` is safe here
        // because this whole closure already runs off the runtime's core
        // worker threads, on the blocking pool `run_blocking` dispatches to.
        let handle = tokio::runtime::Handle::current();
        run_blocking(move || {
            let mut conn = pool.get().map_err(|e| StorageError::Connection(e.to_string()))?;
            let tx = conn.transaction().map_err(db_err)?;

            let integrated_size: i64 = tx
                .query_row("SELECT integrated_size FROM int_coord WHERE id = 0", [], |r| r.get(0))
                .map_err(db_err)?;

            let rows: Vec<(i64, Vec<u8>)> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT first_index, entries FROM seq_batches \
                         WHERE first_index >= ?1 ORDER BY first_index ASC LIMIT ?2",
                    )
                    .map_err(db_err)?;
                stmt.query_map(params![integrated_size, limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?
            };

            let mut batch = Vec::new();
            let mut taken_firsts = Vec::new();
            let mut expected = integrated_size;
            for (first, blob) in rows {
                if first != expected {
                    break;
                }
                let decoded = decode_batch(&blob)?;
                expected += decoded.len() as i64;
                batch.extend(decoded);
                taken_firsts.push(first);
            }

            if batch.is_empty() && !force_update {
                return Ok(false);
            }

            let from_index = integrated_size as u64;
            let new_root = handle
                .block_on(consume(from_index, batch))
                .map_err(|e| StorageError::Database(e.to_string()))?;

            for first in &taken_firsts {
                tx.execute("DELETE FROM seq_batches WHERE first_index = ?1", params![first])
                    .map_err(db_err)?;
            }
            tx.execute(
                "UPDATE int_coord SET integrated_size = ?1, root_hash = ?2 WHERE id = 0",
                params![expected, new_root.as_slice()],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;

            Ok(true)
        })
        .await
    }

    async fn current_tree(&self) -> StorageResult<(u64, [u8; 32])> {
        let pool = self.pool.clone();
        run_blocking(move || {
            let conn = pool.get().map_err(|e| StorageError::Connection(e.to_string()))?;
            let (size, root): (i64, Vec<u8>) = conn
                .query_row("SELECT integrated_size, root_hash FROM int_coord WHERE id = 0", [], |r| {
                    Ok((r.get(0)?, r.get(1)?))
                })
                .map_err(db_err)?;
            let mut arr = [0u8; 32];
            if root.len() != 32 {
                return Err(StorageError::InvalidData("stored root hash is not 32 bytes".to_string()));
            }
            arr.copy_from_slice(&root);
            Ok((size as u64, arr))
        })
        .await
    }
}

/// SQLite-backed [`AntispamStore`].
pub struct SqliteAntispamStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteAntispamStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl AntispamStore for SqliteAntispamStore {
    async fn init_schema(&self) -> StorageResult<()> {
        let pool = self.pool.clone();
        run_blocking(move || {
            let conn = pool.get().map_err(|e| StorageError::Connection(e.to_string()))?;
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS antispam_identities (
                    identity_hash BLOB PRIMARY KEY,
                    idx INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS antispam_coord (
                    id INTEGER PRIMARY KEY CHECK (id = 0),
                    follow_position INTEGER NOT NULL
                );
                "#,
            )
            .map_err(db_err)?;
            conn.execute(
                "INSERT OR IGNORE INTO antispam_coord (id, follow_position) VALUES (0, 0)",
                [],
            )
            .map_err(db_err)?;
            check_meta_compatibility(&conn)
        })
        .await
    }

    async fn check_compatibility(&self) -> StorageResult<()> {
        let pool = self.pool.clone();
        run_blocking(move || {
            let conn = pool.get().map_err(|e| StorageError::Connection(e.to_string()))?;
            check_meta_compatibility(&conn)
        })
        .await
    }

    async fn lookup(&self, identity_hash: &[u8; 32]) -> StorageResult<Option<u64>> {
        let pool = self.pool.clone();
        let identity_hash = *identity_hash;
        run_blocking(move || {
            let conn = pool.get().map_err(|e| StorageError::Connection(e.to_string()))?;
            let idx: Option<i64> = conn
                .query_row(
                    "SELECT idx FROM antispam_identities WHERE identity_hash = ?1",
                    params![identity_hash.as_slice()],
                    |r| r.get(0),
                )
                .optional()
                .map_err(db_err)?;
            Ok(idx.map(|v| v as u64))
        })
        .await
    }

    async fn follow_position(&self) -> StorageResult<u64> {
        let pool = self.pool.clone();
        run_blocking(move || {
            let conn = pool.get().map_err(|e| StorageError::Connection(e.to_string()))?;
            let pos: i64 = conn
                .query_row("SELECT follow_position FROM antispam_coord WHERE id = 0", [], |r| r.get(0))
                .map_err(db_err)?;
            Ok(pos as u64)
        })
        .await
    }

    async fn advance(&self, entries: &[([u8; 32], u64)], through_index: u64) -> StorageResult<()> {
        let pool = self.pool.clone();
        let entries = entries.to_vec();
        run_blocking(move || {
            let mut conn = pool.get().map_err(|e| StorageError::Connection(e.to_string()))?;
            let tx = conn.transaction().map_err(db_err)?;
            for (identity_hash, index) in &entries {
                tx.execute(
                    "INSERT OR IGNORE INTO antispam_identities (identity_hash, idx) VALUES (?1, ?2)",
                    params![identity_hash.as_slice(), *index as i64],
                )
                .map_err(db_err)?;
            }
            tx.execute(
                "UPDATE antispam_coord SET follow_position = MAX(follow_position, ?1) WHERE id = 0",
                params![through_index as i64],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::default_marshal;

    fn entry(n: u8) -> Entry {
        Entry::new(vec![n, n, n])
    }

    #[tokio::test]
    async fn test_schema_init_is_idempotent() {
        let store = SqliteCoordinatorStore::in_memory().unwrap();
        store.init_schema().await.unwrap();
        store.init_schema().await.unwrap();
    }

    #[tokio::test]
    async fn test_assign_and_consume_round_trip() {
        let store = SqliteCoordinatorStore::in_memory().unwrap();
        store.init_schema().await.unwrap();

        let (first, sequenced) = store.assign_entries(&[entry(1), entry(2)], 100).await.unwrap();
        assert_eq!(first, 0);
        assert_eq!(sequenced.len(), 2);

        let did_work = store
            .consume_entries(10, false, |from, batch| async move {
                assert_eq!(from, 0);
                assert_eq!(batch.len(), 2);
                assert_eq!(batch[0].bundle_data, default_marshal(0, &[1, 1, 1]));
                Ok([9u8; 32])
            })
            .await
            .unwrap();
        assert!(did_work);

        let (size, root) = store.current_tree().await.unwrap();
        assert_eq!(size, 2);
        assert_eq!(root, [9u8; 32]);
    }

    #[tokio::test]
    async fn test_pushback_when_outstanding_exceeds_limit() {
        let store = SqliteCoordinatorStore::in_memory().unwrap();
        store.init_schema().await.unwrap();
        let result = store.assign_entries(&[entry(1), entry(2), entry(3)], 1).await;
        assert!(matches!(result, Err(StorageError::Pushback(_, _))));
    }

    #[tokio::test]
    async fn test_antispam_first_writer_wins() {
        let store = SqliteAntispamStore::in_memory().unwrap();
        store.init_schema().await.unwrap();
        let id = [3u8; 32];
        store.advance(&[(id, 10)], 11).await.unwrap();
        store.advance(&[(id, 500)], 501).await.unwrap();
        assert_eq!(store.lookup(&id).await.unwrap(), Some(10));
        assert_eq!(store.follow_position().await.unwrap(), 501);
    }
}
