//! Hash tiles: the unit of storage for interior Merkle tree node hashes.
//!
//! A hash tile at `(tile_level, tile_index)` stores up to 256 node hashes
//! at tree-level `8 * tile_level` (its own "local leaves"). Every other
//! node inside the 8-level span the tile covers is derived by repeatedly
//! pairwise-hashing those 256 entries; nothing above the local-leaf row is
//! persisted in the tile's own bytes.

use crate::entry::hash_children;
use crate::error::{Result, TesseraError};
use crate::path::{node_coords_to_tile_address, TILE_HEIGHT, TILE_WIDTH};
use crate::storage::traits::ObjectStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Identifies a single hash tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileID {
    pub tile_level: u8,
    pub tile_index: u64,
}

/// A tile's local-leaf-row hashes (at most [`TILE_WIDTH`] of them), plus
/// lazily-derived rows above it within the same tile.
#[derive(Clone, Debug)]
pub struct HashTile {
    pub id: TileID,
    /// Row 0: the tile's own local-leaf hashes, left to right.
    leaves: Vec<[u8; 32]>,
}

impl HashTile {
    pub fn new(id: TileID, leaves: Vec<[u8; 32]>) -> Self {
        debug_assert!(leaves.len() as u64 <= TILE_WIDTH);
        Self { id, leaves }
    }

    pub fn width(&self) -> u16 {
        self.leaves.len() as u16
    }

    pub fn is_full(&self) -> bool {
        self.leaves.len() as u64 == TILE_WIDTH
    }

    /// Serialize as a flat concatenation of 32-byte hashes, the on-disk
    /// tile format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.leaves.len() * 32);
        for h in &self.leaves {
            out.extend_from_slice(h);
        }
        out
    }

    pub fn from_bytes(id: TileID, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 32 != 0 {
            return Err(TesseraError::addressing(
                "tile byte length is not a multiple of 32".to_string(),
            ));
        }
        let leaves = bytes.chunks_exact(32).map(|c| c.try_into().unwrap()).collect();
        Ok(Self::new(id, leaves))
    }

    /// Build a node row at `sub_level` (0 = the tile's local leaves) by
    /// repeatedly combining adjacent pairs from row 0.
    fn row(&self, sub_level: u8) -> Vec<[u8; 32]> {
        let mut row = self.leaves.clone();
        for _ in 0..sub_level {
            row = row
                .chunks(2)
                .map(|pair| {
                    if pair.len() == 2 {
                        hash_children(&pair[0], &pair[1])
                    } else {
                        pair[0]
                    }
                })
                .collect();
        }
        row
    }

    /// The hash of the node at `sub_level` (relative to this tile's base),
    /// `local_index`, if present.
    pub fn node_hash(&self, sub_level: u8, local_index: u64) -> Option<[u8; 32]> {
        let row = self.row(sub_level);
        row.get(local_index as usize).copied()
    }
}

/// A tile still under construction, holding fewer than [`TILE_WIDTH`] local
/// leaves because the tree has not yet grown to fill it. Persisted with a
/// `.p/width` path suffix and replaced by the full tile once the tree
/// grows past the boundary.
pub type PopulatedTile = HashTile;

/// Read-through cache over an [`ObjectStore`], keyed by [`TileID`]. Shared
/// across sequencer/integrator operations to avoid re-fetching the same
/// tile for every node lookup within a single integration pass.
pub struct TileReadCache<O: ObjectStore> {
    store: Arc<O>,
    cache: RwLock<HashMap<TileID, HashTile>>,
}

impl<O: ObjectStore> TileReadCache<O> {
    pub fn new(store: Arc<O>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the hash of node `(level, index)`, given the current tree
    /// size (needed to know whether the owning tile is full or partial).
    pub async fn node_hash(&self, level: u8, index: u64, tree_size: u64) -> Result<[u8; 32]> {
        let (tile_level, tile_index, sub_level, local_index) =
            node_coords_to_tile_address(level, index);
        let id = TileID { tile_level, tile_index };

        if let Some(tile) = self.cache.read().await.get(&id) {
            if let Some(h) = tile.node_hash(sub_level, local_index) {
                return Ok(h);
            }
        }

        let tile = self.fetch(id, tree_size).await?;
        let hash = tile.node_hash(sub_level, local_index).ok_or_else(|| {
            TesseraError::inconsistent(format!(
                "node ({}, {}) not present in tile {:?}",
                level, index, id
            ))
        })?;
        self.cache.write().await.insert(id, tile);
        Ok(hash)
    }

    async fn fetch(&self, id: TileID, tree_size: u64) -> Result<HashTile> {
        let width = crate::path::tile_width_at(
            // The width of a level-0-equivalent span covered by this tile
            // at the tile's own base level.
            tree_size >> (id.tile_level as u64 * TILE_HEIGHT as u64),
            id.tile_index,
        );
        let full = width as u64 == TILE_WIDTH;
        let path = if full {
            crate::path::tile_path(id.tile_level, id.tile_index)
        } else {
            crate::path::partial_tile_path(id.tile_level, id.tile_index, width)
        };

        let bytes = self
            .store
            .get(&path)
            .await
            .map_err(TesseraError::from)?
            .ok_or_else(|| TesseraError::inconsistent(format!("missing tile object {}", path)))?;

        HashTile::from_bytes(id, &bytes)
    }

    pub async fn invalidate(&self, id: &TileID) {
        self.cache.write().await.remove(id);
    }

    /// Fetch and cache every tile backing `node_ids` that is not already
    /// warm, so that the subsequent per-node `node_hash` calls that build a
    /// prefix range are pure cache reads with no further storage I/O.
    pub async fn prewarm(&self, node_ids: &[(u8, u64)], tree_size: u64) -> Result<()> {
        let mut needed = std::collections::HashSet::new();
        for &(level, index) in node_ids {
            let (tile_level, tile_index, _, _) = node_coords_to_tile_address(level, index);
            needed.insert(TileID { tile_level, tile_index });
        }
        for id in needed {
            if self.cache.read().await.contains_key(&id) {
                continue;
            }
            let tile = self.fetch(id, tree_size).await?;
            self.cache.write().await.insert(id, tile);
        }
        Ok(())
    }
}

/// Accumulates newly computed node hashes during a single integration pass
/// and flushes them as tile objects. Node hashes for tiles the integrator
/// never touches are left untouched in the backing store.
#[derive(Default)]
pub struct TileWriteCache {
    /// Local-leaf rows under construction, keyed by tile id.
    pending: HashMap<TileID, HashMap<u64, [u8; 32]>>,
}

impl TileWriteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly computed node hash. Nodes above a tile's own local
    /// leaf row (`sub_level > 0`) are derivable and are not stored.
    pub fn set_node(&mut self, level: u8, index: u64, hash: [u8; 32]) {
        let (tile_level, tile_index, sub_level, local_index) =
            node_coords_to_tile_address(level, index);
        if sub_level != 0 {
            return;
        }
        self.pending
            .entry(TileID { tile_level, tile_index })
            .or_default()
            .insert(local_index, hash);
    }

    /// Flush every pending tile to the object store, writing full tiles
    /// unconditionally and partial tiles at their observed width. Uses
    /// `set_if_absent_or_equal` so repeated flushes of an unchanged tile
    /// (e.g. after a crash and retry) are idempotent.
    ///
    /// `old_tree_size` is the integrated size before this pass. A tile that
    /// already held content at that size (a partial tile growing wider, or
    /// a full tile whose higher-level ancestor is still being assembled) is
    /// first materialized from storage so its pre-existing local leaves
    /// survive alongside the newly set ones; `set_node` during a single
    /// pass only ever records the leaves this pass actually touched.
    pub async fn flush<O: ObjectStore>(
        &mut self,
        store: &O,
        old_tree_size: u64,
        new_tree_size: u64,
    ) -> Result<()> {
        for (id, new_entries) in self.pending.drain() {
            let new_base_level_size = new_tree_size >> (id.tile_level as u64 * TILE_HEIGHT as u64);
            let width = crate::path::tile_width_at(new_base_level_size, id.tile_index);
            if width == 0 {
                continue;
            }
            let mut leaves = vec![[0u8; 32]; width as usize];

            let old_base_level_size = old_tree_size >> (id.tile_level as u64 * TILE_HEIGHT as u64);
            let old_width = crate::path::tile_width_at(old_base_level_size, id.tile_index);
            if old_width > 0 {
                let old_path = if old_width as u64 == TILE_WIDTH {
                    crate::path::tile_path(id.tile_level, id.tile_index)
                } else {
                    crate::path::partial_tile_path(id.tile_level, id.tile_index, old_width)
                };
                let bytes = store
                    .get(&old_path)
                    .await
                    .map_err(TesseraError::from)?
                    .ok_or_else(|| {
                        TesseraError::inconsistent(format!("missing pre-existing tile object {}", old_path))
                    })?;
                let old_tile = HashTile::from_bytes(id, &bytes)?;
                for i in 0..old_tile.width() as u64 {
                    if let Some(h) = old_tile.node_hash(0, i) {
                        leaves[i as usize] = h;
                    }
                }
            }

            for (local_index, hash) in new_entries {
                if (local_index as usize) < leaves.len() {
                    leaves[local_index as usize] = hash;
                }
            }
            let tile = HashTile::new(id, leaves);
            let full = tile.is_full();
            let path = if full {
                crate::path::tile_path(id.tile_level, id.tile_index)
            } else {
                crate::path::partial_tile_path(id.tile_level, id.tile_index, width)
            };
            store
                .set_if_absent_or_equal(&path, tile.to_bytes())
                .await
                .map_err(TesseraError::from)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::default_leaf_hash;
    use crate::storage::memory::MemoryObjectStore;

    #[test]
    fn test_hash_tile_round_trips_bytes() {
        let id = TileID { tile_level: 0, tile_index: 0 };
        let leaves: Vec<_> = (0..5u8).map(|i| default_leaf_hash(&[i])).collect();
        let tile = HashTile::new(id, leaves.clone());
        let bytes = tile.to_bytes();
        let back = HashTile::from_bytes(id, &bytes).unwrap();
        assert_eq!(back.leaves, leaves);
    }

    #[test]
    fn test_hash_tile_derives_higher_rows() {
        let id = TileID { tile_level: 0, tile_index: 0 };
        let leaves: Vec<_> = (0..4u8).map(|i| default_leaf_hash(&[i])).collect();
        let tile = HashTile::new(id, leaves.clone());
        let expected_top = hash_children(
            &hash_children(&leaves[0], &leaves[1]),
            &hash_children(&leaves[2], &leaves[3]),
        );
        assert_eq!(tile.node_hash(2, 0), Some(expected_top));
    }

    #[tokio::test]
    async fn test_read_cache_fetches_and_caches() {
        let store = Arc::new(MemoryObjectStore::new());
        let id = TileID { tile_level: 0, tile_index: 0 };
        let leaves: Vec<_> = (0..10u8).map(|i| default_leaf_hash(&[i])).collect();
        let tile = HashTile::new(id, leaves.clone());
        store
            .set_if_absent_or_equal(&crate::path::partial_tile_path(0, 0, 10), tile.to_bytes())
            .await
            .unwrap();

        let cache = TileReadCache::new(store);
        let h = cache.node_hash(0, 3, 10).await.unwrap();
        assert_eq!(h, leaves[3]);
    }

    #[tokio::test]
    async fn test_write_cache_flush_is_idempotent() {
        let store = MemoryObjectStore::new();
        let mut wc = TileWriteCache::new();
        wc.set_node(0, 0, default_leaf_hash(&[0]));
        wc.set_node(0, 1, default_leaf_hash(&[1]));
        wc.flush(&store, 0, 2).await.unwrap();

        let mut wc2 = TileWriteCache::new();
        wc2.set_node(0, 0, default_leaf_hash(&[0]));
        wc2.set_node(0, 1, default_leaf_hash(&[1]));
        assert!(wc2.flush(&store, 0, 2).await.is_ok());
    }

    #[tokio::test]
    async fn test_write_cache_flush_rejects_conflicting_tile() {
        let store = MemoryObjectStore::new();
        let mut wc = TileWriteCache::new();
        wc.set_node(0, 0, default_leaf_hash(&[0]));
        wc.set_node(0, 1, default_leaf_hash(&[1]));
        wc.flush(&store, 0, 2).await.unwrap();

        let mut wc2 = TileWriteCache::new();
        wc2.set_node(0, 0, default_leaf_hash(&[9]));
        wc2.set_node(0, 1, default_leaf_hash(&[1]));
        assert!(wc2.flush(&store, 0, 2).await.is_err());
    }

    #[tokio::test]
    async fn test_write_cache_flush_seeds_existing_leaves_when_growing_a_partial_tile() {
        let store = MemoryObjectStore::new();

        // First pass: 2 leaves, tile stays partial at width 2.
        let mut wc = TileWriteCache::new();
        wc.set_node(0, 0, default_leaf_hash(&[0]));
        wc.set_node(0, 1, default_leaf_hash(&[1]));
        wc.flush(&store, 0, 2).await.unwrap();

        // Second pass: only the 2 new leaves are set, but old_tree_size=2
        // means the previous 2 leaves must be seeded in before writing.
        let mut wc2 = TileWriteCache::new();
        wc2.set_node(0, 2, default_leaf_hash(&[2]));
        wc2.set_node(0, 3, default_leaf_hash(&[3]));
        wc2.flush(&store, 2, 4).await.unwrap();

        let id = TileID { tile_level: 0, tile_index: 0 };
        let bytes = store
            .get(&crate::path::partial_tile_path(0, 0, 4))
            .await
            .unwrap()
            .unwrap();
        let tile = HashTile::from_bytes(id, &bytes).unwrap();
        for i in 0..4u8 {
            assert_eq!(tile.node_hash(0, i as u64), Some(default_leaf_hash(&[i])));
        }
    }
}
