//! In-memory storage implementations.
//!
//! Used by tests and by any caller that only needs a single-process,
//! ephemeral log. Data is lost when the process exits.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;

use super::traits::{AntispamStore, CoordinatorStore, ObjectStore, StorageError, StorageResult};
use crate::entry::{Entry, SequencedEntry};

/// In-memory [`ObjectStore`]. Thread-safe via an internal mutex.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<HashMap<String, (Vec<u8>, SystemTime)>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, path: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.objects.lock().await.get(path).map(|(data, _)| data.clone()))
    }

    async fn get_last_modified(&self, path: &str) -> StorageResult<Option<SystemTime>> {
        Ok(self.objects.lock().await.get(path).map(|(_, t)| *t))
    }

    async fn set(&self, path: &str, data: Vec<u8>) -> StorageResult<()> {
        self.objects
            .lock()
            .await
            .insert(path.to_string(), (data, SystemTime::now()));
        Ok(())
    }

    async fn set_if_absent_or_equal(&self, path: &str, data: Vec<u8>) -> StorageResult<()> {
        let mut objects = self.objects.lock().await;
        match objects.get(path) {
            None => {
                objects.insert(path.to_string(), (data, SystemTime::now()));
                Ok(())
            }
            Some((existing, _)) if existing == &data => Ok(()),
            Some(_) => Err(StorageError::Conflict(path.to_string())),
        }
    }
}

struct CoordinatorState {
    /// Entries sequenced but not yet integrated, keyed by first index.
    pending_batches: std::collections::BTreeMap<u64, Vec<SequencedEntry>>,
    next_index: u64,
    integrated_size: u64,
    root_hash: [u8; 32],
}

/// In-memory [`CoordinatorStore`]. A single mutex stands in for SQLite's
/// transactional row locking: the whole critical section (reserve indices,
/// or select-consume-commit) runs while the lock is held, matching the
/// "at most one writer makes progress" serialization the real backend
/// provides.
pub struct MemoryCoordinatorStore {
    state: Mutex<CoordinatorState>,
}

impl MemoryCoordinatorStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CoordinatorState {
                pending_batches: std::collections::BTreeMap::new(),
                next_index: 0,
                integrated_size: 0,
                root_hash: sha2::Sha256::digest([]).into(),
            }),
        }
    }
}

impl Default for MemoryCoordinatorStore {
    fn default() -> Self {
        Self::new()
    }
}

use sha2::Digest;

#[async_trait]
impl CoordinatorStore for MemoryCoordinatorStore {
    async fn init_schema(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn check_compatibility(&self) -> StorageResult<()> {
        // A fresh in-memory store is always current; there is no foreign
        // schema to disagree with across process lifetimes.
        Ok(())
    }

    async fn assign_entries(
        &self,
        entries: &[Entry],
        max_outstanding: u64,
    ) -> StorageResult<(u64, Vec<SequencedEntry>)> {
        let mut state = self.state.lock().await;
        let outstanding = state.next_index - state.integrated_size;
        if outstanding + entries.len() as u64 > max_outstanding {
            return Err(StorageError::Pushback(outstanding, max_outstanding));
        }
        let first_index = state.next_index;
        let sequenced: Vec<SequencedEntry> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| SequencedEntry::from_entry(e, first_index + i as u64))
            .collect();
        state.pending_batches.insert(first_index, sequenced.clone());
        state.next_index += entries.len() as u64;
        Ok((first_index, sequenced))
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
        let mut state = self.state.lock().await;

        let mut taken_keys = Vec::new();
        let mut batch = Vec::new();
        for (&first, entries) in state.pending_batches.iter() {
            if taken_keys.len() >= limit {
                break;
            }
            if first != state.integrated_size + batch.len() as u64 {
                break;
            }
            batch.extend(entries.clone());
            taken_keys.push(first);
        }

        if batch.is_empty() && !force_update {
            return Ok(false);
        }

        let from_index = state.integrated_size;
        let new_root = consume(from_index, batch.clone())
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?;

        for key in taken_keys {
            state.pending_batches.remove(&key);
        }
        state.integrated_size += batch.len() as u64;
        state.root_hash = new_root;
        Ok(true)
    }

    async fn current_tree(&self) -> StorageResult<(u64, [u8; 32])> {
        let state = self.state.lock().await;
        Ok((state.integrated_size, state.root_hash))
    }
}

/// In-memory [`AntispamStore`].
#[derive(Default)]
pub struct MemoryAntispamStore {
    state: Mutex<AntispamState>,
}

#[derive(Default)]
struct AntispamState {
    by_identity: HashMap<[u8; 32], u64>,
    follow_position: u64,
}

impl MemoryAntispamStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AntispamStore for MemoryAntispamStore {
    async fn init_schema(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn check_compatibility(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn lookup(&self, identity_hash: &[u8; 32]) -> StorageResult<Option<u64>> {
        Ok(self.state.lock().await.by_identity.get(identity_hash).copied())
    }

    async fn follow_position(&self) -> StorageResult<u64> {
        Ok(self.state.lock().await.follow_position)
    }

    async fn advance(&self, entries: &[([u8; 32], u64)], through_index: u64) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        for (identity_hash, index) in entries {
            state.by_identity.entry(*identity_hash).or_insert(*index);
        }
        state.follow_position = state.follow_position.max(through_index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::default_leaf_hash;

    fn entry(n: u8) -> Entry {
        Entry::new(vec![n])
    }

    #[tokio::test]
    async fn test_object_store_set_if_absent_or_equal() {
        let store = MemoryObjectStore::new();
        store.set_if_absent_or_equal("a", vec![1, 2, 3]).await.unwrap();
        assert!(store.set_if_absent_or_equal("a", vec![1, 2, 3]).await.is_ok());
        assert!(store.set_if_absent_or_equal("a", vec![9]).await.is_err());
    }

    #[tokio::test]
    async fn test_assign_entries_reserves_contiguous_indices() {
        let store = MemoryCoordinatorStore::new();
        let (first, _) = store.assign_entries(&[entry(1), entry(2)], 100).await.unwrap();
        assert_eq!(first, 0);
        let (second, _) = store.assign_entries(&[entry(3)], 100).await.unwrap();
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn test_assign_entries_pushback() {
        let store = MemoryCoordinatorStore::new();
        store.assign_entries(&[entry(1), entry(2)], 1).await.unwrap_err();
    }

    #[tokio::test]
    async fn test_consume_entries_advances_integrated_size() {
        let store = MemoryCoordinatorStore::new();
        store.assign_entries(&[entry(1), entry(2)], 100).await.unwrap();

        let did_work = store
            .consume_entries(10, false, |from, batch| async move {
                assert_eq!(from, 0);
                assert_eq!(batch.len(), 2);
                Ok([7u8; 32])
            })
            .await
            .unwrap();
        assert!(did_work);

        let (size, root) = store.current_tree().await.unwrap();
        assert_eq!(size, 2);
        assert_eq!(root, [7u8; 32]);
    }

    #[tokio::test]
    async fn test_antispam_first_writer_wins() {
        let store = MemoryAntispamStore::new();
        let id = [1u8; 32];
        store.advance(&[(id, 5)], 6).await.unwrap();
        store.advance(&[(id, 99)], 100).await.unwrap();
        assert_eq!(store.lookup(&id).await.unwrap(), Some(5));
        assert_eq!(store.follow_position().await.unwrap(), 100);
    }
}
