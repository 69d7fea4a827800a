//! distcache Cache - front cache and persistence façade
//!
//! [`FileCacheManager`] serves typed values from an in-process LRU of metadata
//! records, falling back to a [`CacheBacking`] that coordinates the metadata
//! and blob stores. Values are serialized, deflated and stored by the hash of
//! the compressed bytes. [`Reaper`] runs the periodic expiration sweeps.

pub mod backing;
pub mod codec;
pub mod lru;
pub mod manager;
pub mod reaper;

// Re-exports
pub use backing::{BackingStats, CacheBacking, CacheDataBacking, CacheMapDataBacking, ExpireSummary};
pub use codec::{BincodeSerializer, EncodedValue, RawSerializer, ValueCodec, ValueSerializer};
pub use lru::LruCache;
pub use manager::{CacheStats, FileCacheManager, FrontEntry, PutOutcome};
pub use reaper::{Reaper, Sweep};
