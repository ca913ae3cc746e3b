//! The integrator: folds a batch of newly sequenced entries into the tree,
//! writing entry bundles and hash tiles and returning the new root hash.
//!
//! An [`Integrator`] is stateless between calls; every invariant it needs
//! (the log's current size and root) is read fresh from the
//! [`crate::sequencer::Sequencer`] immediately before each integration
//! attempt and re-verified against the tiles actually on disk. This makes
//! `integrate_once` safe to call repeatedly, including after a crash mid
//! integration: `set_if_absent_or_equal` makes every tile and bundle write
//! idempotent, and the recomputed-root check in [`integrate`] refuses to
//! proceed if the on-disk state has drifted from what the coordinator
//! believes.

use crate::entry::SequencedEntry;
use crate::error::{Result, TesseraError};
use crate::path::{self, TILE_WIDTH};
use crate::range::{prefix_node_ids, CompactRange};
use crate::sequencer::Sequencer;
use crate::storage::traits::{CoordinatorStore, ObjectStore, StorageError, StorageResult};
use crate::tile::{TileReadCache, TileWriteCache};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Folds sequenced entries into the tile tree and entry-bundle store.
pub struct Integrator<O: ObjectStore> {
    object_store: Arc<O>,
}

impl<O: ObjectStore> Integrator<O> {
    pub fn new(object_store: Arc<O>) -> Self {
        Self { object_store }
    }

    /// The object store this integrator writes tiles and entry bundles to,
    /// shared with components (the antispam follower, the witness gateway)
    /// that read the same tree from the other side.
    pub fn object_store(&self) -> Arc<O> {
        Arc::clone(&self.object_store)
    }

    /// Run one integration step against `sequencer`: read the current
    /// frontier, then drive the coordinator's transactional consume with a
    /// closure that performs the tree update. Returns `true` if work was
    /// done (a hint that more batches may remain).
    pub async fn integrate_once<C: CoordinatorStore>(
        &self,
        sequencer: &Sequencer<C>,
        limit: usize,
        force_update: bool,
    ) -> Result<bool> {
        let (expected_size, expected_root) = sequencer.current_tree().await?;
        let store = Arc::clone(&self.object_store);

        let consume = move |from_index: u64, entries: Vec<SequencedEntry>| -> Pin<
            Box<dyn Future<Output = StorageResult<[u8; 32]>> + Send>,
        > {
            Box::pin(async move {
                if from_index != expected_size {
                    return Err(StorageError::Database(format!(
                        "sequencer frontier moved between read ({}) and integration ({})",
                        expected_size, from_index
                    )));
                }
                integrate(store, from_index, expected_root, entries)
                    .await
                    .map_err(|e| StorageError::Database(e.to_string()))
            })
        };

        sequencer.consume_entries(limit, force_update, consume).await
    }
}

/// The core integration algorithm, independent of the coordinator
/// transaction wrapping it: verify the base range, extend it with the new
/// entries, and persist both the dirty tiles and the new entry bundles.
async fn integrate<O: ObjectStore>(
    store: Arc<O>,
    from_index: u64,
    expected_root: [u8; 32],
    entries: Vec<SequencedEntry>,
) -> Result<[u8; 32]> {
    let read_cache = TileReadCache::new(Arc::clone(&store));

    // Step 1+2: rebuild the base range [0, from_index) from stored tiles
    // and verify it matches what the coordinator believes the root to be.
    let base_range = build_prefix_range(&read_cache, from_index).await?;
    let actual_root = base_range.root_hash()?;
    if actual_root != expected_root {
        return Err(TesseraError::inconsistent(format!(
            "recomputed root for prefix [0, {}) does not match the stored root",
            from_index
        )));
    }

    let new_size = from_index + entries.len() as u64;
    let mut write_cache = TileWriteCache::new();

    // Step 3: build a fresh range over only the newly sequenced leaves.
    let mut new_range = CompactRange::new_empty(from_index);
    {
        let mut visit = |level: u8, index: u64, hash: [u8; 32]| -> Result<()> {
            write_cache.set_node(level, index, hash);
            Ok(())
        };
        for e in &entries {
            new_range.append(e.leaf_hash, &mut visit)?;
        }
    }

    // Step 4: merge the new range into the base range with the same
    // visitor, capturing every real carry that spans the two.
    let mut merged = base_range;
    {
        let mut visit = |level: u8, index: u64, hash: [u8; 32]| -> Result<()> {
            write_cache.set_node(level, index, hash);
            Ok(())
        };
        merged.merge(new_range, &mut visit)?;
    }
    let new_root = merged.root_hash()?;

    // Steps 5+6: persist entry bundles and dirty tiles. Independent of one
    // another, so they run concurrently.
    let (bundles, tiles) = tokio::join!(
        write_entry_bundles(store.as_ref(), from_index, &entries),
        write_cache.flush(store.as_ref(), from_index, new_size),
    );
    bundles?;
    tiles?;

    Ok(new_root)
}

/// Build the compact range covering `[0, size)`, prewarming every tile it
/// needs in one pass so the per-node lookups that follow are pure cache
/// reads.
async fn build_prefix_range<O: ObjectStore>(
    read_cache: &TileReadCache<O>,
    size: u64,
) -> Result<CompactRange> {
    if size == 0 {
        return Ok(CompactRange::new_empty(0));
    }
    let ids = prefix_node_ids(size);
    read_cache.prewarm(&ids, size).await?;

    let mut nodes = Vec::with_capacity(ids.len());
    for (level, index) in ids {
        let hash = read_cache.node_hash(level, index, size).await?;
        nodes.push((level, index, hash));
    }
    Ok(CompactRange::from_nodes(0, size, nodes))
}

/// Append newly sequenced entries' marshaled bytes to the entry-bundle
/// sequence, growing or completing partial bundles as needed.
async fn write_entry_bundles<O: ObjectStore>(
    store: &O,
    from_index: u64,
    entries: &[SequencedEntry],
) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    let mut global_index = from_index;
    let mut offset = 0usize;
    while offset < entries.len() {
        let bundle_index = global_index / TILE_WIDTH;
        let bundle_start = bundle_index * TILE_WIDTH;
        let already_present = (global_index - bundle_start) as usize;
        let room_left = TILE_WIDTH as usize - already_present;
        let take = room_left.min(entries.len() - offset);
        let chunk = &entries[offset..offset + take];

        let mut data = Vec::new();
        if already_present > 0 {
            let old_path = path::partial_entry_bundle_path(bundle_index, already_present as u16);
            let bytes = store
                .get(&old_path)
                .await
                .map_err(TesseraError::from)?
                .ok_or_else(|| TesseraError::inconsistent(format!("missing partial entry bundle {}", old_path)))?;
            data = bytes;
        }
        for e in chunk {
            data.extend_from_slice(&e.bundle_data);
        }

        let new_width = already_present + take;
        let path = if new_width == TILE_WIDTH as usize {
            path::entry_bundle_path(bundle_index)
        } else {
            path::partial_entry_bundle_path(bundle_index, new_width as u16)
        };
        store
            .set_if_absent_or_equal(&path, data)
            .await
            .map_err(TesseraError::from)?;

        global_index += take as u64;
        offset += take;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{default_leaf_hash, Entry};
    use crate::storage::memory::{MemoryCoordinatorStore, MemoryObjectStore};
    use sha2::{Digest, Sha256};

    fn entry(n: u8) -> Entry {
        Entry::new(vec![n])
    }

    async fn run_integration_round(
        sequencer: &Sequencer<MemoryCoordinatorStore>,
        integrator: &Integrator<MemoryObjectStore>,
    ) -> bool {
        integrator.integrate_once(sequencer, 1000, false).await.unwrap()
    }

    #[tokio::test]
    async fn test_integrates_a_small_batch_and_matches_naive_root() {
        let coordinator = Arc::new(MemoryCoordinatorStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let sequencer = Sequencer::new(Arc::clone(&coordinator), 1000);
        let integrator = Integrator::new(Arc::clone(&objects));

        let entries: Vec<Entry> = (0..5u8).map(entry).collect();
        sequencer.assign_entries(entries).await.unwrap();

        let did_work = run_integration_round(&sequencer, &integrator).await;
        assert!(did_work);

        let (size, root) = sequencer.current_tree().await.unwrap();
        assert_eq!(size, 5);

        let mut naive = CompactRange::new_empty(0);
        let mut no_op = |_: u8, _: u64, _: [u8; 32]| -> Result<()> { Ok(()) };
        for i in 0..5u8 {
            naive.append(default_leaf_hash(&[i]), &mut no_op).unwrap();
        }
        assert_eq!(root, naive.root_hash().unwrap());
    }

    #[tokio::test]
    async fn test_integration_is_idempotent_across_repeated_runs() {
        let coordinator = Arc::new(MemoryCoordinatorStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let sequencer = Sequencer::new(Arc::clone(&coordinator), 1000);
        let integrator = Integrator::new(Arc::clone(&objects));

        sequencer.assign_entries(vec![entry(1), entry(2), entry(3)]).await.unwrap();
        assert!(run_integration_round(&sequencer, &integrator).await);
        let (_, first_root) = sequencer.current_tree().await.unwrap();

        // Nothing pending: a second round without force_update is a no-op.
        assert!(!run_integration_round(&sequencer, &integrator).await);
        let (_, second_root) = sequencer.current_tree().await.unwrap();
        assert_eq!(first_root, second_root);
    }

    #[tokio::test]
    async fn test_grows_a_partial_tile_and_bundle_across_two_rounds() {
        let coordinator = Arc::new(MemoryCoordinatorStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let sequencer = Sequencer::new(Arc::clone(&coordinator), 10_000);
        let integrator = Integrator::new(Arc::clone(&objects));

        let first_batch: Vec<Entry> = (0..250u8).map(entry).collect();
        sequencer.assign_entries(first_batch).await.unwrap();
        assert!(run_integration_round(&sequencer, &integrator).await);

        // The level-0 tile and entry bundle for tile index 0 should be
        // partial at width 250, and no full tile should exist yet.
        assert!(objects
            .get(&path::partial_tile_path(0, 0, 250))
            .await
            .unwrap()
            .is_some());
        assert!(objects.get(&path::tile_path(0, 0)).await.unwrap().is_none());

        let second_batch: Vec<Entry> = (250..256u8).map(entry).collect();
        sequencer.assign_entries(second_batch).await.unwrap();
        assert!(run_integration_round(&sequencer, &integrator).await);

        // Now a full tile and entry bundle must exist at tile index 0, and
        // no partial tile should linger for the same coordinates being
        // read back incorrectly (old partials may remain on disk, but the
        // read path must prefer the full object).
        let full_tile_bytes = objects.get(&path::tile_path(0, 0)).await.unwrap().unwrap();
        assert_eq!(full_tile_bytes.len(), 256 * 32);
        let full_bundle_bytes = objects.get(&path::entry_bundle_path(0)).await.unwrap().unwrap();
        assert!(!full_bundle_bytes.is_empty());

        let (size, _) = sequencer.current_tree().await.unwrap();
        assert_eq!(size, 256);
    }

    #[tokio::test]
    async fn test_force_update_self_initializes_empty_log_to_empty_tree_hash() {
        let coordinator = Arc::new(MemoryCoordinatorStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let sequencer = Sequencer::new(Arc::clone(&coordinator), 10);
        let integrator = Integrator::new(objects);

        let did_work = integrator.integrate_once(&sequencer, 10, true).await.unwrap();
        assert!(did_work);
        let (size, root) = sequencer.current_tree().await.unwrap();
        assert_eq!(size, 0);
        assert_eq!(root, Sha256::digest([]).as_slice());
    }

    #[tokio::test]
    async fn test_entry_bundle_bytes_are_marshaled_concatenation() {
        let coordinator = Arc::new(MemoryCoordinatorStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let sequencer = Sequencer::new(Arc::clone(&coordinator), 100);
        let integrator = Integrator::new(Arc::clone(&objects));

        sequencer.assign_entries(vec![entry(7), entry(8)]).await.unwrap();
        run_integration_round(&sequencer, &integrator).await;

        let bytes = objects
            .get(&path::partial_entry_bundle_path(0, 2))
            .await
            .unwrap()
            .unwrap();
        let expected = [
            crate::entry::default_marshal(0, &[7]),
            crate::entry::default_marshal(1, &[8]),
        ]
        .concat();
        assert_eq!(bytes, expected);
    }
}
