//! Background expiration sweeps.
//!
//! Each registered target gets its own long-running task that ticks on the
//! target's interval and runs the (blocking) sweep on the blocking pool.
//! Tasks run until their handle is aborted.

use distcache_common::config::{BackingKind, StoreConfig};
use distcache_store::{CacheMapBacking, DataStore, MnodeStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// A store with an expiration pass
pub trait Sweep: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Delete expired rows, returning how many went
    fn remove_expired_data(&self) -> usize;
}

impl Sweep for MnodeStore {
    fn name(&self) -> &'static str {
        "mnode"
    }

    fn remove_expired_data(&self) -> usize {
        MnodeStore::remove_expired_data(self)
    }
}

impl Sweep for DataStore {
    fn name(&self) -> &'static str {
        "data"
    }

    fn remove_expired_data(&self) -> usize {
        DataStore::remove_expired_data(self).removed
    }
}

impl Sweep for CacheMapBacking {
    fn name(&self) -> &'static str {
        "cache-map"
    }

    fn remove_expired_data(&self) -> usize {
        CacheMapBacking::remove_expired_data(self)
    }
}

/// Collection of sweep targets and their intervals
#[derive(Default)]
pub struct Reaper {
    targets: Vec<(Arc<dyn Sweep>, Duration)>,
}

impl Reaper {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register(mut self, target: Arc<dyn Sweep>, interval: Duration) -> Self {
        self.targets.push((target, interval));
        self
    }

    /// Metadata interval for the configured layout
    pub fn metadata_interval(config: &StoreConfig) -> Duration {
        match config.backing {
            BackingKind::Split => config.mnode_reaper_interval,
            BackingKind::Legacy => config.legacy_reaper_interval,
        }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Start one sweep task per target. Must be called inside a tokio runtime.
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        self.targets
            .into_iter()
            .map(|(target, interval)| {
                info!("{} reaper every {:?}", target.name(), interval);
                tokio::spawn(sweep_loop(target, interval))
            })
            .collect()
    }
}

/// Long-running background task: sweep `target` every `interval`.
pub async fn sweep_loop(target: Arc<dyn Sweep>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let sweeping = Arc::clone(&target);
        match tokio::task::spawn_blocking(move || sweeping.remove_expired_data()).await {
            Ok(0) => {}
            Ok(removed) => debug!("{} reaper removed {} rows", target.name(), removed),
            Err(e) => error!("{} reaper sweep panicked: {}", target.name(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        sweeps: AtomicUsize,
    }

    impl Sweep for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn remove_expired_data(&self) -> usize {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            1
        }
    }

    #[tokio::test]
    async fn test_sweeps_repeat_until_aborted() {
        let target = Arc::new(Counting::default());
        let handles = Reaper::new()
            .register(target.clone(), Duration::from_millis(10))
            .spawn();
        assert_eq!(handles.len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        for handle in &handles {
            handle.abort();
        }
        let sweeps = target.sweeps.load(Ordering::SeqCst);
        assert!(sweeps >= 2, "only {sweeps} sweeps ran");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(target.sweeps.load(Ordering::SeqCst) <= sweeps + 1);
    }

    #[test]
    fn test_metadata_interval_follows_layout() {
        let mut config = StoreConfig::default();
        assert_eq!(Reaper::metadata_interval(&config), Duration::from_secs(15 * 60));
        config.backing = BackingKind::Legacy;
        assert_eq!(Reaper::metadata_interval(&config), Duration::from_secs(5 * 60));
    }

    #[tokio::test]
    async fn test_store_sweep_runs_on_blocking_pool() {
        let dir = tempfile::tempdir().unwrap();
        let clock = distcache_common::ManualClock::new(0);
        let backing =
            distcache_store::Backing::open(dir.path().join("db.redb"), clock.clone()).unwrap();
        let data = Arc::new(
            DataStore::new(backing, distcache_store::OwnerTable::Mnode)
                .with_expire_timeout(Duration::from_secs(1)),
        );
        data.save(&distcache_common::HashKey::digest(b"x"), b"x");
        clock.advance(Duration::from_secs(2));

        let handles = Reaper::new()
            .register(data.clone(), Duration::from_millis(10))
            .spawn();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handles.iter().for_each(JoinHandle::abort);
        assert_eq!(data.count(), 0);
    }
}
