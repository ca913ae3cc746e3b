//! The sequencer: durable, exactly-once index assignment and the
//! transactional frontier between sequencing and integration.
//!
//! A [`Sequencer`] is a thin, typed wrapper over a [`CoordinatorStore`]. It
//! owns no state of its own beyond the back-pressure threshold; every
//! invariant (contiguity, atomicity, the integration frontier) is enforced
//! by the store's single critical section per operation.

use crate::entry::{Entry, SequencedEntry};
use crate::error::Result;
use crate::queue::{FlushFn, FlushFuture};
use crate::storage::traits::CoordinatorStore;
use std::future::Future;
use std::sync::Arc;

/// Durable index assignment and integration-progress tracking over a
/// [`CoordinatorStore`] implementation.
pub struct Sequencer<C: CoordinatorStore> {
    store: Arc<C>,
    max_outstanding: u64,
}

impl<C: CoordinatorStore> Sequencer<C> {
    /// Wrap a coordinator store. The store's schema must already have been
    /// initialized and checked via [`CoordinatorStore::init_schema`] /
    /// [`CoordinatorStore::check_compatibility`].
    pub fn new(store: Arc<C>, max_outstanding: u64) -> Self {
        Self { store, max_outstanding }
    }

    /// Allocate a contiguous block of indices to `entries`, returning the
    /// first assigned index. Fails with a pushback storage error if doing
    /// so would leave more than `max_outstanding` entries
    /// sequenced-but-not-integrated.
    pub async fn assign_entries(&self, entries: Vec<Entry>) -> Result<u64> {
        let (first_index, _sequenced) = self.store.assign_entries(&entries, self.max_outstanding).await?;
        Ok(first_index)
    }

    /// A [`FlushFn`] closure suitable for driving a [`crate::queue::SubmissionQueue`].
    pub fn flush_fn(self: &Arc<Self>) -> FlushFn {
        let this = Arc::clone(self);
        Arc::new(move |entries: Vec<Entry>| {
            let this = Arc::clone(&this);
            Box::pin(async move { this.assign_entries(entries).await }) as FlushFuture
        })
    }

    /// Drive one integration step: select up to `limit` pending batches in
    /// order, hand them to `consume`, and commit its returned root hash
    /// together with the removal of the consumed batches — all within a
    /// single transaction at the store layer. Returns `true` if any work
    /// was done (a hint that more may be pending).
    ///
    /// When `force_update` is set and nothing is pending, `consume` still
    /// runs with an empty slice, allowing an empty log to self-initialize
    /// to a well-formed checkpoint.
    pub async fn consume_entries<F, Fut>(&self, limit: usize, force_update: bool, consume: F) -> Result<bool>
    where
        F: FnOnce(u64, Vec<SequencedEntry>) -> Fut + Send + 'static,
        Fut: Future<Output = crate::storage::traits::StorageResult<[u8; 32]>> + Send + 'static,
    {
        Ok(self.store.consume_entries(limit, force_update, consume).await?)
    }

    /// A non-locking read of the current integrated tree size and root.
    pub async fn current_tree(&self) -> Result<(u64, [u8; 32])> {
        Ok(self.store.current_tree().await?)
    }

    pub fn max_outstanding(&self) -> u64 {
        self.max_outstanding
    }
}
