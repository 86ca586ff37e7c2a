//! Standalone sync server.
//!
//! ```text
//! codesync-server --bind 0.0.0.0:9090 --data-dir ./codesync_data
//! ```
//! Without `--data-dir` files and sessions live in memory only.

use clap::Parser;
use codesync_collab::server::{ServerConfig, SyncServer};
use codesync_collab::storage::{LazyStore, StoreBackend, StoreConfig};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "codesync-server")]
#[command(about = "File sync server with optimistic concurrency", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "CODESYNC_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; in-memory store when absent
    #[arg(long, env = "CODESYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Revisions kept per file (0 keeps all)
    #[arg(long, env = "CODESYNC_REVISION_LIMIT", default_value = "50")]
    revision_limit: usize,

    /// Acknowledge saves before they are fsynced
    #[arg(long, env = "CODESYNC_NO_SYNC")]
    no_sync: bool,

    /// Notifications buffered per project before slow clients lag
    #[arg(long, env = "CODESYNC_BROADCAST_CAPACITY", default_value = "256")]
    broadcast_capacity: usize,

    /// Seconds between idle-session sweeps
    #[arg(long, env = "CODESYNC_HEARTBEAT_SECS", default_value = "30")]
    heartbeat_secs: u64,

    /// Seconds without requests before a session leaves the roster
    #[arg(long, env = "CODESYNC_IDLE_TIMEOUT_SECS", default_value = "120")]
    idle_timeout_secs: u64,

    /// Live sessions allowed per project
    #[arg(long, env = "CODESYNC_MAX_SESSIONS", default_value = "100")]
    max_sessions: usize,

    /// Seconds a disconnected session stays resumable
    #[arg(long, env = "CODESYNC_SESSION_RETENTION_SECS", default_value = "86400")]
    session_retention_secs: u64,

    /// Log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            broadcast_capacity: self.broadcast_capacity,
            heartbeat_interval_secs: self.heartbeat_secs,
            idle_timeout_secs: self.idle_timeout_secs,
            max_sessions_per_project: self.max_sessions,
            session_retention_secs: self.session_retention_secs,
            // The store is built by `store()` and handed over directly
            storage_path: None,
        }
    }

    fn store(&self) -> LazyStore {
        match &self.data_dir {
            Some(path) => LazyStore::rocks(StoreConfig {
                path: path.clone(),
                sync_writes: !self.no_sync,
                revision_limit: self.revision_limit,
                ..StoreConfig::default()
            }),
            None => LazyStore::new(StoreBackend::Memory {
                revision_limit: self.revision_limit,
            }),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let env = env_logger::Env::default().default_filter_or(args.log_level.as_str());
    env_logger::Builder::from_env(env).init();

    match &args.data_dir {
        Some(path) => info!("Starting codesync-server, data in {}", path.display()),
        None => info!("Starting codesync-server with an in-memory store"),
    }

    let server = SyncServer::with_store(args.server_config(), Arc::new(args.store()));

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connections served, {} saves, {} conflicts",
                stats.total_connections, stats.saves, stats.conflicts
            );
            server.flush()?;
        }
    }
    Ok(())
}
