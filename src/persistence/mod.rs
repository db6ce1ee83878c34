//! Optional on-disk persistence: server cache, write log, tracked queries.

pub mod cache_policy;
pub mod manager;
pub mod storage_engine;
pub mod tracked_query;

pub use cache_policy::{
    LruCachePolicy, DEFAULT_CACHE_SIZE_BYTES, MAX_CACHE_SIZE_BYTES, MIN_CACHE_SIZE_BYTES,
};
pub use manager::{PersistenceManager, RecoveredWrite};
pub use storage_engine::{
    FileStorageEngine, InMemoryStorageEngine, PersistedWrite, PersistedWriteKind, StorageEngine,
    TrackedQueryRecord,
};
