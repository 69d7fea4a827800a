//! distcache Store - persistence core
//!
//! This crate implements the two logical tables of the cache on top of an
//! embedded redb database:
//!
//! - [`MnodeStore`]: versioned metadata records keyed by entry hash, with the
//!   replication change feed and expiration scan.
//! - [`DataStore`]: content-addressed value blobs with TTL extension driven by
//!   the metadata that references them.
//! - [`CacheMapBacking`]: the older single-table metadata layout, kept as an
//!   alternative backing strategy.

pub mod backing;
pub mod data_store;
pub mod error;
pub mod map_backing;
pub mod mnode;
pub mod mnode_store;
pub mod tables;

// Re-exports
pub use backing::Backing;
pub use data_store::{DataStore, OrphanListener, OwnerTable, SweepReport};
pub use error::{StoreError, StoreResult};
pub use map_backing::{CacheMapBacking, CacheMapEntry};
pub use mnode::{CacheData, ExpiredMnode, MnodeEntry, MnodeUpdate, MnodeValue};
pub use mnode_store::MnodeStore;
