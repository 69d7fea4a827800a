//! Shared handle to the backing database.
//!
//! Every logical store operation runs inside exactly one redb transaction:
//! [`Backing::write`] commits when the closure returns `Ok` and drops (aborts)
//! the transaction when it returns `Err`. redb admits one writer at a time, so
//! a read-check-write inside one `write` call is atomic with respect to every
//! other writer on the same database.

use crate::error::StoreResult;
use crate::tables;
use distcache_common::SharedClock;
use redb::{Database, ReadTransaction, WriteTransaction};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Cloneable handle to the database and clock shared by all stores of a node
#[derive(Clone)]
pub struct Backing {
    db: Arc<Database>,
    clock: SharedClock,
}

impl Backing {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>, clock: SharedClock) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::MNODE)?;
            let _t = write_txn.open_table(tables::MNODE_BY_UPDATE_TIME)?;
            let _t = write_txn.open_table(tables::DATA)?;
            let _t = write_txn.open_table(tables::DATA_EXPIRES)?;
            let _t = write_txn.open_table(tables::CACHE_MAP)?;
        }
        write_txn.commit()?;
        debug!("opened backing database at {}", path.display());

        Ok(Self {
            db: Arc::new(db),
            clock,
        })
    }

    /// Current time in milliseconds
    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// The clock this backing stamps rows with
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Run `f` in a read transaction
    pub fn read<T>(&self, f: impl FnOnce(&ReadTransaction) -> StoreResult<T>) -> StoreResult<T> {
        let read_txn = self.db.begin_read()?;
        f(&read_txn)
    }

    /// Run `f` in a write transaction, committing on success
    pub fn write<T>(&self, f: impl FnOnce(&WriteTransaction) -> StoreResult<T>) -> StoreResult<T> {
        let write_txn = self.db.begin_write()?;
        let result = f(&write_txn)?;
        write_txn.commit()?;
        Ok(result)
    }
}

impl std::fmt::Debug for Backing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backing").finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Backing;
    use distcache_common::ManualClock;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Fresh database in a temp dir, driven by a manual clock
    pub fn open_backing(now: u64) -> (TempDir, Backing, Arc<ManualClock>) {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(now);
        let backing = Backing::open(dir.path().join("distcache.redb"), clock.clone()).unwrap();
        (dir, backing, clock)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::open_backing;
    use crate::error::StoreError;
    use crate::tables::DATA_EXPIRES;
    use redb::ReadableTable;

    #[test]
    fn test_write_commits_on_ok() {
        let (_dir, backing, _clock) = open_backing(0);
        backing
            .write(|txn| {
                txn.open_table(DATA_EXPIRES)?.insert(b"k".as_slice(), 7)?;
                Ok(())
            })
            .unwrap();

        let value = backing
            .read(|txn| Ok(txn.open_table(DATA_EXPIRES)?.get(b"k".as_slice())?.map(|g| g.value())))
            .unwrap();
        assert_eq!(value, Some(7));
    }

    #[test]
    fn test_write_discards_on_err() {
        let (_dir, backing, _clock) = open_backing(0);
        let result: Result<(), StoreError> = backing.write(|txn| {
            txn.open_table(DATA_EXPIRES)?.insert(b"k".as_slice(), 7)?;
            Err(StoreError::Io(std::io::Error::other("boom")))
        });
        assert!(result.is_err());

        let value = backing
            .read(|txn| Ok(txn.open_table(DATA_EXPIRES)?.get(b"k".as_slice())?.map(|g| g.value())))
            .unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn test_reopen_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("db.redb");
        let clock = distcache_common::ManualClock::new(0);
        {
            let backing = super::Backing::open(&path, clock.clone()).unwrap();
            backing
                .write(|txn| {
                    txn.open_table(DATA_EXPIRES)?.insert(b"k".as_slice(), 9)?;
                    Ok(())
                })
                .unwrap();
        }
        let backing = super::Backing::open(&path, clock).unwrap();
        let value = backing
            .read(|txn| Ok(txn.open_table(DATA_EXPIRES)?.get(b"k".as_slice())?.map(|g| g.value())))
            .unwrap();
        assert_eq!(value, Some(9));
    }
}
