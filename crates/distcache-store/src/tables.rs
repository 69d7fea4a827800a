//! Redb table definitions for the cache persistence core.

use distcache_common::HashKey;
use redb::TableDefinition;

// Metadata
// Key: entry hash, Value: bincode-encoded MnodeRow
pub const MNODE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("mnode");
// Key: big-endian update_time ++ entry hash, Value: unit. Backs the change feed.
pub const MNODE_BY_UPDATE_TIME: TableDefinition<&[u8], ()> =
    TableDefinition::new("mnode_by_update_time");

// Content-addressed blobs
// Key: value hash, Value: raw bytes
pub const DATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("data");
// Key: value hash, Value: expire time (ms)
pub const DATA_EXPIRES: TableDefinition<&[u8], u64> = TableDefinition::new("data_expires");

// Legacy single-table layout
// Key: entry hash, Value: bincode-encoded MapRow
pub const CACHE_MAP: TableDefinition<&[u8], &[u8]> = TableDefinition::new("cache_map");

/// Length of an update-time index key
pub const TIME_KEY_LEN: usize = 8 + distcache_common::HASH_LEN;

/// Index key ordering rows by `(update_time, key)`
pub fn time_key(update_time: u64, key: &HashKey) -> [u8; TIME_KEY_LEN] {
    let mut out = [0u8; TIME_KEY_LEN];
    out[..8].copy_from_slice(&update_time.to_be_bytes());
    out[8..].copy_from_slice(key.as_bytes());
    out
}

/// Inverse of [`time_key`]
pub fn split_time_key(bytes: &[u8]) -> Option<(u64, HashKey)> {
    if bytes.len() != TIME_KEY_LEN {
        return None;
    }
    let (time, key) = bytes.split_at(8);
    let time = u64::from_be_bytes(time.try_into().ok()?);
    let key = HashKey::from_slice(key).ok()?;
    Some((time, key))
}
