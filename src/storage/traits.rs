//! Storage trait definitions.
//!
//! Two independent capability sets, matching the two very different
//! consistency requirements of a tlog-tiles instance:
//!
//! - [`CoordinatorStore`]: small, frequently-written rows that need
//!   transactional, serialized mutation (index assignment, integration
//!   progress, antispam identity records). Backed by SQLite in production.
//! - [`ObjectStore`]: large, content-addressed, append-mostly blobs (tiles,
//!   entry bundles, the checkpoint). Backed by a filesystem or object
//!   storage service in production; writes are idempotent by content.
//!
//! Implementations of both traits are provided in-memory for tests.

use crate::entry::{Entry, SequencedEntry};
use async_trait::async_trait;
use std::future::Future;
use std::time::SystemTime;
use thiserror::Error;

/// The schema version this library's coordinator tables are compatible
/// with. Bumped whenever a backward-incompatible change is made to the
/// persisted schema; a mismatch at startup is fatal, never silently
/// migrated.
pub const COMPATIBILITY_VERSION: u32 = 1;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("connection error: {0}")]
    Connection(String),

    /// The sequencer has outrun the integrator by more than the configured
    /// back-pressure threshold; callers of `add` should retry later.
    #[error("pushback: {0} entries outstanding, limit {1}")]
    Pushback(u64, u64),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Coordinates exactly-once index assignment and serialized tree
/// integration. Each concrete backend (SQLite, in-memory) implements this
/// once and is shared by every [`crate::sequencer::Sequencer`] and
/// [`crate::integrator::Integrator`] built on top of it.
#[async_trait]
pub trait CoordinatorStore: Send + Sync + 'static {
    /// Create backing tables/structures if they do not already exist.
    async fn init_schema(&self) -> StorageResult<()>;

    /// Assert that the persisted `Meta.compatibility_version` matches
    /// [`COMPATIBILITY_VERSION`], initializing it on a fresh database.
    /// Returns [`StorageError::InvalidData`] against a foreign schema
    /// version; callers must treat this as fatal and refuse to serve
    /// writes.
    async fn check_compatibility(&self) -> StorageResult<()>;

    /// Atomically reserve `entries.len()` contiguous indices starting at
    /// the current sequencing frontier, marshal each entry against its
    /// real assigned index, persist the batch, and advance the frontier.
    /// Returns the first assigned index together with the realized
    /// [`SequencedEntry`] values. Fails with [`StorageError::Pushback`] if
    /// doing so would leave more than `max_outstanding` entries
    /// sequenced-but-not-integrated.
    async fn assign_entries(
        &self,
        entries: &[Entry],
        max_outstanding: u64,
    ) -> StorageResult<(u64, Vec<SequencedEntry>)>;

    /// Within a single transaction: take an exclusive lock on the
    /// integration coordinator row, select up to `limit` pending batches
    /// starting at the current integrated size, invoke `consume` with the
    /// first index and the concatenated entries, and — if it succeeds —
    /// commit the new integrated size and root hash it returns while
    /// deleting the consumed batch rows. Returns `false` without calling
    /// `consume` if there is nothing pending and `force_update` is false.
    async fn consume_entries<F, Fut>(
        &self,
        limit: usize,
        force_update: bool,
        consume: F,
    ) -> StorageResult<bool>
    where
        F: FnOnce(u64, Vec<SequencedEntry>) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<[u8; 32]>> + Send + 'static;

    /// The current integrated tree size and root hash.
    async fn current_tree(&self) -> StorageResult<(u64, [u8; 32])>;
}

/// Content-addressed object storage for tiles, entry bundles, and the
/// checkpoint.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn get(&self, path: &str) -> StorageResult<Option<Vec<u8>>>;

    async fn get_last_modified(&self, path: &str) -> StorageResult<Option<SystemTime>>;

    /// Unconditional overwrite. Used only for the checkpoint, which is
    /// mutable by design.
    async fn set(&self, path: &str, data: Vec<u8>) -> StorageResult<()>;

    /// Write `data` at `path` if the path is absent, or succeed silently if
    /// the existing content is byte-identical. Fails with
    /// [`StorageError::Conflict`] if the path holds different content —
    /// tiles and entry bundles are immutable once written, so a mismatch
    /// indicates two integrators disagreeing about history.
    async fn set_if_absent_or_equal(&self, path: &str, data: Vec<u8>) -> StorageResult<()>;
}

/// Coordinates the antispam follower's `identity_hash -> index` mapping.
/// Kept separate from [`CoordinatorStore`] because it tracks the
/// follower's own read position through the log, independent of
/// sequencing/integration progress.
#[async_trait]
pub trait AntispamStore: Send + Sync + 'static {
    async fn init_schema(&self) -> StorageResult<()>;

    /// Assert that the persisted `Meta.compatibility_version` matches
    /// [`COMPATIBILITY_VERSION`], initializing it on a fresh database.
    async fn check_compatibility(&self) -> StorageResult<()>;

    /// The first index, if any, previously recorded under this identity
    /// hash.
    async fn lookup(&self, identity_hash: &[u8; 32]) -> StorageResult<Option<u64>>;

    /// The next log index the follower has not yet processed.
    async fn follow_position(&self) -> StorageResult<u64>;

    /// Within a single transaction: insert each `(identity_hash, index)`
    /// pair that is not already present (first writer wins) and advance
    /// the follow position past `through_index`.
    async fn advance(
        &self,
        entries: &[([u8; 32], u64)],
        through_index: u64,
    ) -> StorageResult<()>;
}
