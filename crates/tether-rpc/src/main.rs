//! Tether RPC Server - stream endpoint and daemon proxy for app clients.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tether_core::TopicRegistry;
use tether_daemon::{load_manifest, DaemonSupervisor};
use tether_rpc::{start_server, AppState, SettingsStore};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "tether-rpc")]
#[command(about = "Multiplexed stream server for Tether apps")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// JSON manifest of apps: `{ "<appId>": { "program": ..., ... } }`
    #[arg(long)]
    apps: Option<PathBuf>,

    /// Directory for persisted app settings
    #[arg(long, default_value = "tether-data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Tether RPC Server");

    let supervisor = match &args.apps {
        Some(path) => {
            let specs = load_manifest(path)?;
            info!("Loaded {} app(s) from {}", specs.len(), path.display());
            DaemonSupervisor::from_specs(specs)
        }
        None => DaemonSupervisor::new(),
    };

    std::fs::create_dir_all(&args.data_dir)?;
    info!("Settings directory: {}", args.data_dir.display());

    let registry = TopicRegistry::new();
    let settings = SettingsStore::new(&args.data_dir, registry.clone());
    settings.preload(&supervisor.app_ids()).await?;

    let state = Arc::new(AppState::new(supervisor, registry, settings));
    let handle = start_server(state.clone(), &args.host, args.port).await?;

    // Print port for the launcher to read (intentional stdout for IPC)
    println!("RPC_PORT={}", handle.port());

    info!("RPC server running on {}", handle.addr());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping daemons");
    state.supervisor.shutdown().await;
    handle.stop().await;

    Ok(())
}
