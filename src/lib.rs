//! Tessera: an append-only, tamper-evident log backend built on the
//! tlog-tiles static object layout.
//!
//! A log is served as an ordinary tree of immutable, content-addressed
//! objects (hash tiles and entry bundles) plus one small mutable object,
//! the signed checkpoint. Growth is append-only and idempotent: every
//! object write is either unconditional (the checkpoint) or
//! conflict-checked against existing content (tiles, bundles), so a crash
//! mid-integration can always be retried safely.
//!
//! ## Pipeline
//!
//! ```text
//! Add(entry) -> SubmissionQueue -> Sequencer -> Integrator -> CheckpointPublisher -> WitnessGateway
//!                     ^                                            |
//!                     +-------------------- AntispamFollower <-----+
//! ```
//!
//! - [`queue`]: coalesces concurrent `Add` calls into size/age-bounded
//!   batches.
//! - [`sequencer`]: durable, exactly-once index assignment and the
//!   transactional frontier between sequencing and integration.
//! - [`integrator`]: folds sequenced entries into the tile tree and entry
//!   bundle objects, returning the new root hash.
//! - [`checkpoint`]: the signed checkpoint note format and the publisher
//!   loop that periodically commits the integrator's progress.
//! - [`witness`]: cosigning protocol against an externally configured
//!   threshold of witnesses.
//! - [`antispam`]: best-effort, first-writer-wins deduplication of
//!   logically equivalent submissions.
//! - [`appender`]: top-level orchestration tying the above into one
//!   running log instance.

pub mod antispam;
pub mod appender;
pub mod checkpoint;
pub mod config;
pub mod entry;
pub mod error;
pub mod integrator;
pub mod logging;
pub mod path;
pub mod queue;
pub mod range;
pub mod sequencer;
pub mod storage;
pub mod tile;
pub mod witness;

pub use appender::{Appender, AppenderError};
pub use checkpoint::{Checkpoint, CheckpointPublisher, Signer, SignerError};
pub use config::{ConfigError, TesseraConfig, WitnessEndpoint, WitnessPolicy};
pub use entry::{Entry, SequencedEntry};
pub use error::{Result, TesseraError};
pub use integrator::Integrator;
pub use queue::{Index, SubmissionQueue};
pub use sequencer::Sequencer;
pub use witness::WitnessGateway;
