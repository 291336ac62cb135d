//! mapsync daemon (mapsyncd)
//!
//! The server process for mapsync - real-time collaborative maps.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (WebSocket on 8080, in-memory storage)
//! mapsyncd
//!
//! # Custom port
//! mapsyncd --port 9000
//!
//! # With persistence
//! mapsyncd --db /var/lib/mapsync/maps.db
//!
//! # Seed a first map on startup
//! mapsyncd --create-map "Team Plan"
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mapsync_core::{Gateway, LockManager, NodeStore, SyncResolver};
use mapsync_storage::{MemoryStore, SqliteStore};
use mapsync_transport::WebSocketServer;

/// mapsync daemon - real-time collaborative map server
#[derive(Parser, Debug)]
#[command(name = "mapsyncd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// WebSocket port to listen on
    #[arg(long, env = "MAPSYNC_PORT", default_value = "8080")]
    port: u16,

    /// Bind address
    #[arg(long, env = "MAPSYNC_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// SQLite database path for persistence (default: in-memory only)
    #[arg(long, env = "MAPSYNC_DB")]
    db: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "MAPSYNC_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Create a map with this name on startup and log its id
    #[arg(long)]
    create_map: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .init();

    // Pick the storage gateway
    let gateway: Arc<dyn Gateway> = match &args.db {
        Some(db_path) => {
            info!(path = %db_path.display(), "Initializing SQLite persistence");
            match SqliteStore::new(db_path) {
                Ok(store) => {
                    info!("SQLite persistence enabled");
                    Arc::new(store)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to initialize SQLite, running in-memory only");
                    Arc::new(MemoryStore::new())
                }
            }
        }
        None => {
            info!("Running in-memory only (no --db specified)");
            Arc::new(MemoryStore::new())
        }
    };

    let store = Arc::new(NodeStore::new(gateway.clone()));
    let locks = Arc::new(LockManager::new());
    let resolver = Arc::new(SyncResolver::new(gateway, locks.clone()));

    if let Some(name) = &args.create_map {
        let (map, root) = store.create_map(name)?;
        info!(map = %map.id, root = %root.id, name = %map.name, "Map created");
    }

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "Starting mapsync daemon");

    let server = WebSocketServer::new(store, locks, resolver, addr);
    let handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!(error = %e, "WebSocket server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    handle.abort();

    Ok(())
}
