//! Antispam follower: a background process that streams already-integrated
//! entries and maintains a durable `identity_hash -> index` map, used to
//! deduplicate logically equivalent submissions without the sequencer or
//! integrator ever needing to know what "equivalent" means for a given
//! application.
//!
//! The follower trails the integrated tree rather than racing ahead of it:
//! it only ever reads entry bundles that have already been durably
//! written, so a crash mid-sweep just means replaying a few already-seen
//! `(identity_hash, index)` pairs, which is harmless under insert-if-absent
//! semantics.

use crate::entry::default_unmarshal_stream;
use crate::error::{Result, TesseraError};
use crate::path;
use crate::storage::traits::{AntispamStore, ObjectStore};
use std::sync::Arc;
use std::time::Duration;

/// Extracts the antispam identity hash from an entry's raw (unmarshalled)
/// data, if it carries one. Entries for which this returns `None` are
/// never deduplicated.
pub type IdentityFn = Arc<dyn Fn(&[u8]) -> Option<[u8; 32]> + Send + Sync>;

/// A function returning the current integrated tree size, so the follower
/// can detect how far it lags and when it has caught up.
pub type IntegratedSizeFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<u64>> + Send>> + Send + Sync>;

use std::future::Future;
use std::pin::Pin;

/// Background process maintaining the antispam index. Call [`AntispamFollower::run`]
/// to drive it forever, or [`AntispamFollower::tick`] to run a single sweep
/// (mainly for tests).
pub struct AntispamFollower<A: AntispamStore, O: ObjectStore> {
    store: Arc<A>,
    object_store: Arc<O>,
    integrated_size: IntegratedSizeFn,
    identity_fn: IdentityFn,
    pushback_threshold: u64,
    max_batch_size: u64,
    tick_interval: Duration,
}

impl<A: AntispamStore, O: ObjectStore> AntispamFollower<A, O> {
    pub fn new(
        store: Arc<A>,
        object_store: Arc<O>,
        integrated_size: IntegratedSizeFn,
        identity_fn: IdentityFn,
        pushback_threshold: u64,
        max_batch_size: u64,
    ) -> Self {
        Self {
            store,
            object_store,
            integrated_size,
            identity_fn,
            pushback_threshold,
            max_batch_size,
            tick_interval: Duration::from_secs(1),
        }
    }

    /// Run the follower loop forever, logging and continuing past any
    /// single tick's failure.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick().await {
                tracing::warn!(target: "tessera::antispam", error = %e, "follower tick failed");
            }
        }
    }

    /// Whether the follower currently lags the integrated tree by more than
    /// the configured threshold; when true, `Add` should return pushback
    /// rather than let the antispam index grow unboundedly stale.
    pub async fn is_pushback_active(&self) -> Result<bool> {
        let integrated = (self.integrated_size)().await?;
        let position = self.store.follow_position().await?;
        Ok(integrated.saturating_sub(position) > self.pushback_threshold)
    }

    /// Sweep forward from the follower's current position toward the
    /// integrated size, up to `max_batch_size` entries, committing the
    /// accumulated identity mappings once.
    pub async fn tick(&self) -> Result<()> {
        loop {
            let integrated = (self.integrated_size)().await?;
            let position = self.store.follow_position().await?;
            if position >= integrated {
                return Ok(());
            }

            let limit = (integrated - position).min(self.max_batch_size);
            let through = position + limit;
            let mut pairs = Vec::new();

            let mut index = position;
            while index < through {
                let bundle_index = index / path::TILE_WIDTH;
                let bundle_start = bundle_index * path::TILE_WIDTH;
                let width = path::tile_width_at(integrated, bundle_index);
                let bundle_path = if width as u64 == path::TILE_WIDTH {
                    path::entry_bundle_path(bundle_index)
                } else {
                    path::partial_entry_bundle_path(bundle_index, width)
                };
                let bytes = self
                    .object_store
                    .get(&bundle_path)
                    .await
                    .map_err(TesseraError::from)?
                    .ok_or_else(|| TesseraError::inconsistent(format!("missing entry bundle {}", bundle_path)))?;
                let entries = default_unmarshal_stream(&bytes)
                    .map_err(|e| TesseraError::inconsistent(format!("malformed entry bundle {}: {}", bundle_path, e)))?;

                let local_start = (index - bundle_start) as usize;
                let local_end = (through.min(bundle_start + width as u64) - bundle_start) as usize;
                for (offset, data) in entries.iter().enumerate().take(local_end).skip(local_start) {
                    if let Some(identity_hash) = (self.identity_fn)(data) {
                        pairs.push((identity_hash, bundle_start + offset as u64));
                    }
                }
                index = bundle_start + local_end as u64;
            }

            self.store.advance(&pairs, through).await.map_err(TesseraError::from)?;

            if through >= integrated {
                return Ok(());
            }
        }
    }
}

/// Decorates an `Add` closure with first-writer-wins deduplication: checks
/// pushback mode, then the antispam index, before ever handing the entry to
/// the underlying queue.
pub struct AntispamDecorator<A: AntispamStore> {
    store: Arc<A>,
    pushback_check: Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<bool>> + Send>> + Send + Sync>,
}

impl<A: AntispamStore> AntispamDecorator<A> {
    pub fn new(
        store: Arc<A>,
        pushback_check: Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<bool>> + Send>> + Send + Sync>,
    ) -> Self {
        Self { store, pushback_check }
    }

    /// Resolve an entry's fate before it reaches the queue: `Ok(Some(index))`
    /// short-circuits with a duplicate, `Ok(None)` means the caller should
    /// proceed with a normal `Add`, and `Err` is pushback.
    pub async fn check(&self, identity_hash: Option<[u8; 32]>) -> Result<Option<crate::queue::Index>> {
        if (self.pushback_check)().await? {
            return Err(TesseraError::Storage(crate::storage::traits::StorageError::Pushback(0, 0)));
        }
        let Some(identity_hash) = identity_hash else {
            return Ok(None);
        };
        match self.store.lookup(&identity_hash).await.map_err(TesseraError::from)? {
            Some(existing) => Ok(Some(crate::queue::Index::duplicate_of(existing))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::default_marshal;
    use crate::storage::memory::{MemoryAntispamStore, MemoryObjectStore};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn identity_fn() -> IdentityFn {
        Arc::new(|data: &[u8]| if data.is_empty() { None } else { Some(crate::entry::default_leaf_hash(data)) })
    }

    async fn seed_bundle(store: &MemoryObjectStore, bundle_index: u64, entries: &[&[u8]], full: bool) {
        let mut data = Vec::new();
        for (i, e) in entries.iter().enumerate() {
            data.extend_from_slice(&default_marshal(bundle_index * path::TILE_WIDTH + i as u64, e));
        }
        let path = if full {
            path::entry_bundle_path(bundle_index)
        } else {
            path::partial_entry_bundle_path(bundle_index, entries.len() as u16)
        };
        store.set_if_absent_or_equal(&path, data).await.unwrap();
    }

    #[tokio::test]
    async fn test_tick_indexes_a_partial_bundle() {
        let antispam_store = Arc::new(MemoryAntispamStore::new());
        let object_store = Arc::new(MemoryObjectStore::new());
        seed_bundle(&object_store, 0, &[b"alpha", b"bravo"], false).await;

        let size = Arc::new(AtomicU64::new(2));
        let size_clone = Arc::clone(&size);
        let integrated: IntegratedSizeFn = Arc::new(move || {
            let size = Arc::clone(&size_clone);
            Box::pin(async move { Ok(size.load(Ordering::SeqCst)) })
        });

        let follower = AntispamFollower::new(
            Arc::clone(&antispam_store),
            object_store,
            integrated,
            identity_fn(),
            100,
            256,
        );

        follower.tick().await.unwrap();
        assert_eq!(antispam_store.follow_position().await.unwrap(), 2);
        let id = crate::entry::default_leaf_hash(b"alpha");
        assert_eq!(antispam_store.lookup(&id).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_pushback_active_when_follower_lags() {
        let antispam_store = Arc::new(MemoryAntispamStore::new());
        let object_store = Arc::new(MemoryObjectStore::new());

        let integrated: IntegratedSizeFn = Arc::new(|| Box::pin(async { Ok(1000u64) }));
        let follower = AntispamFollower::new(antispam_store, object_store, integrated, identity_fn(), 10, 256);

        assert!(follower.is_pushback_active().await.unwrap());
    }

    #[tokio::test]
    async fn test_decorator_short_circuits_known_identity() {
        let antispam_store = Arc::new(MemoryAntispamStore::new());
        antispam_store.advance(&[([9u8; 32], 42)], 43).await.unwrap();

        let decorator = AntispamDecorator::new(
            Arc::clone(&antispam_store),
            Arc::new(|| Box::pin(async { Ok(false) })),
        );

        let result = decorator.check(Some([9u8; 32])).await.unwrap();
        assert_eq!(result, Some(crate::queue::Index::duplicate_of(42)));
    }

    #[tokio::test]
    async fn test_decorator_passes_through_unknown_identity() {
        let antispam_store = Arc::new(MemoryAntispamStore::new());
        let decorator = AntispamDecorator::new(antispam_store, Arc::new(|| Box::pin(async { Ok(false) })));
        let result = decorator.check(Some([1u8; 32])).await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_decorator_returns_pushback_when_follower_lags() {
        let antispam_store = Arc::new(MemoryAntispamStore::new());
        let decorator = AntispamDecorator::new(antispam_store, Arc::new(|| Box::pin(async { Ok(true) })));
        let result = decorator.check(None).await;
        assert!(matches!(
            result,
            Err(TesseraError::Storage(crate::storage::traits::StorageError::Pushback(_, _)))
        ));
    }
}
