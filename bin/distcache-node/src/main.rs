//! distcache node - storage node daemon and admin tool
//!
//! `run` opens the backing stores and keeps the expiration reapers going
//! until interrupted. The other subcommands inspect or maintain the same
//! database offline.

use anyhow::Result;
use clap::{Parser, Subcommand};
use distcache_cache::{CacheBacking, CacheDataBacking, CacheMapDataBacking, Reaper};
use distcache_common::config::BackingKind;
use distcache_common::{Config, HashKey, SystemClock};
use distcache_store::{Backing, CacheData, OrphanListener};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "distcache-node")]
#[command(about = "distcache storage node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/distcache/node.toml")]
    config: PathBuf,

    /// Data directory (overrides the config file)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Server id (overrides the config file)
    #[arg(long)]
    server_id: Option<String>,

    /// Use the legacy single-table layout
    #[arg(long)]
    legacy: bool,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the expiration reapers until interrupted
    Run,
    /// Print entry and blob counts
    Stats,
    /// Print one page of the change feed as JSON lines
    Changes {
        /// Feed cursor: minimum update time in milliseconds
        #[arg(long, default_value_t = 0)]
        since: u64,
        /// Rows to skip past the cursor
        #[arg(long, default_value_t = 0)]
        offset: usize,
        /// Restrict to one cache by name instead of the replicated feed
        #[arg(long)]
        cache: Option<String>,
    },
    /// Run one expiration pass and exit
    Sweep,
}

/// Change-feed row as printed by `changes`
#[derive(Serialize)]
struct FeedLine {
    key: String,
    value: Option<String>,
    version: u64,
    cache: Option<String>,
    flags: u64,
    update_time: u64,
    removed: bool,
}

impl From<&CacheData> for FeedLine {
    fn from(row: &CacheData) -> Self {
        Self {
            key: row.key.to_hex(),
            value: row.value_hash.map(|h| h.to_hex()),
            version: row.version,
            cache: row.cache_hash.map(|h| h.to_hex()),
            flags: row.flags,
            update_time: row.update_time,
            removed: row.removed,
        }
    }
}

/// Logs dangling references found by the blob sweep
struct LogOrphans;

impl OrphanListener for LogOrphans {
    fn on_orphan_value(&self, value_hash: &HashKey) {
        info!("unreferenced value {}", value_hash.short());
    }

    fn on_missing_value(&self, key: &HashKey, value_hash: &HashKey) {
        warn!("entry {} points at missing value {}", key.short(), value_hash.short());
    }
}

struct Node {
    backing: Arc<dyn CacheBacking>,
    reaper: Reaper,
}

fn open_node(config: &Config) -> Result<Node> {
    let store = Backing::open(config.database_path(), SystemClock::shared())?;
    let metadata_interval = Reaper::metadata_interval(&config.store);
    let data_interval = config.store.data_reaper_interval();

    let node = match config.store.backing {
        BackingKind::Split => {
            let split = CacheDataBacking::open(store, &config.store)?;
            let reaper = Reaper::new()
                .register(split.mnode_store().clone(), metadata_interval)
                .register(split.data_store().clone(), data_interval);
            Node {
                backing: Arc::new(split),
                reaper,
            }
        }
        BackingKind::Legacy => {
            let legacy = CacheMapDataBacking::open(store, &config.store)?;
            let reaper = Reaper::new()
                .register(legacy.map_backing().clone(), metadata_interval)
                .register(legacy.data_store().clone(), data_interval);
            Node {
                backing: Arc::new(legacy),
                reaper,
            }
        }
    };
    Ok(node)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(data_dir) = args.data_dir {
        config.node.data_dir = data_dir;
    }
    if let Some(server_id) = args.server_id {
        config.node.server_id = server_id;
    }
    if args.legacy {
        config.store.backing = BackingKind::Legacy;
    }
    let log_level = args.log_level.unwrap_or_else(|| config.logging.level.clone());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let node = open_node(&config)?;

    match args.command {
        Commands::Run => {
            info!("Starting distcache node {}", config.node.server_id);
            info!("Database: {}", config.database_path().display());
            info!("Backing layout: {:?}", config.store.backing);
            info!(
                "Replication cursor starts at {}",
                node.backing.startup_last_update_time()
            );
            node.backing.add_orphan_listener(Arc::new(LogOrphans));

            let handles = node.reaper.spawn();
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
            for handle in handles {
                handle.abort();
            }
        }
        Commands::Stats => {
            let stats = node.backing.stats();
            println!("entries:         {}", stats.entries);
            println!("blobs:           {}", stats.blobs);
            println!("server version:  {}", stats.server_version);
            println!(
                "last update:     {}",
                node.backing.startup_last_update_time()
            );
        }
        Commands::Changes {
            since,
            offset,
            cache,
        } => {
            let rows = match cache {
                Some(name) => node.backing.updates(&HashKey::for_key(&name), since, offset),
                None => node.backing.global_updates(since, offset),
            };
            for row in &rows {
                println!("{}", serde_json::to_string(&FeedLine::from(row))?);
            }
        }
        Commands::Sweep => {
            node.backing.add_orphan_listener(Arc::new(LogOrphans));
            let summary = node.backing.remove_expired_data();
            println!("expired entries: {}", summary.entries);
            println!("extended blobs:  {}", summary.data.extended);
            println!("removed blobs:   {}", summary.data.removed);
            println!("orphan blobs:    {}", summary.data.orphans.len());
            println!("missing blobs:   {}", summary.data.missing.len());
        }
    }

    Ok(())
}
