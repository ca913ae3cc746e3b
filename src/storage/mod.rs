//! Storage layer: coordination database and object storage abstractions,
//! each with an in-memory implementation for tests and a persistent
//! implementation for production use.

pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::{MemoryAntispamStore, MemoryCoordinatorStore, MemoryObjectStore};
pub use sqlite::{SqliteAntispamStore, SqliteCoordinatorStore};
pub use traits::{AntispamStore, CoordinatorStore, ObjectStore, StorageError, StorageResult};
