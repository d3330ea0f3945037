//! Kryształkowo Daemon - local cache for the gallery
//!
//! Serves gallery images and listing metadata from local caches and
//! handles account activation codes over a Unix socket.

use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use krysztalkowo_cache::activation::{
    spawn_sweep_loop, ActivationService, HttpMailer, MemoryCodeStore,
};
use krysztalkowo_cache::cache::{AssetCache, ControlMessage, DiskCacheStorage, FileLocalStore, MetadataCache};
use krysztalkowo_cache::clock::SystemClock;
use krysztalkowo_cache::config::DaemonConfig;
use krysztalkowo_cache::fetch::HttpFetcher;
use krysztalkowo_cache::ipc::{AppState, IpcServer};

/// CLI command
#[derive(Debug)]
enum Command {
    /// Run IPC server mode (default)
    Server,
    /// Print the number of cached assets
    CacheSize,
    /// Delete the current asset cache
    ClearCache,
    /// Print metadata cache statistics
    Stats,
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"Kryształkowo Daemon - local gallery cache

USAGE:
    krysztalkowo-daemon                  # Run IPC server (default)
    krysztalkowo-daemon cache-size
    krysztalkowo-daemon clear-cache
    krysztalkowo-daemon stats
    krysztalkowo-daemon help

COMMANDS:
    (none)       Run IPC server mode (waits for commands from gallery clients)
    cache-size   Print the number of cached images
    clear-cache  Delete the current image cache
    stats        Print gallery metadata cache statistics as JSON
    help         Show this help message

ENVIRONMENT:
    KRYSZTALKOWO_STORAGE_HOST         Image host to cache (default firebasestorage.googleapis.com)
    KRYSZTALKOWO_CACHE_DIR            Cache root directory
    KRYSZTALKOWO_SOCKET               IPC socket path (default /tmp/krysztalkowo.sock)
    KRYSZTALKOWO_CACHE_VERSION        Image cache generation (default v1)
    KRYSZTALKOWO_PERSIST              background | await
    KRYSZTALKOWO_SWEEP_INTERVAL_SECS  Activation code sweep interval
    KRYSZTALKOWO_FETCH_TIMEOUT_SECS   Network fetch timeout
    KRYSZTALKOWO_METADATA_QUOTA_BYTES Metadata store quota
    MAIL_API_URL, MAIL_FROM           Mail API endpoint and sender
    EMAIL_USER, EMAIL_PASSWORD        Mail API credentials
    RUST_LOG                          Log level (trace, debug, info, warn, error)
"#
    );
}

fn parse_args() -> Command {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Command::Server;
    }

    match args[1].as_str() {
        "server" => Command::Server,
        "cache-size" => Command::CacheSize,
        "clear-cache" => Command::ClearCache,
        "stats" => Command::Stats,
        "help" | "--help" | "-h" => Command::Help,
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            Command::Help
        }
    }
}

/// Wire the caches and the activation service from configuration
fn build_state(config: &DaemonConfig) -> Result<AppState> {
    let clock = Arc::new(SystemClock);

    let storage = DiskCacheStorage::open(config.asset_dir())
        .with_context(|| format!("Failed to open asset cache at {}", config.asset_dir().display()))?;
    let fetcher = HttpFetcher::with_timeout(config.asset.fetch_timeout)?;
    let assets = AssetCache::new(
        config.asset.clone(),
        Arc::new(storage),
        Arc::new(fetcher),
        clock.clone(),
    );

    let local_store = FileLocalStore::open(config.metadata_dir(), Some(config.metadata_quota))
        .with_context(|| {
            format!(
                "Failed to open metadata store at {}",
                config.metadata_dir().display()
            )
        })?;
    let metadata = Arc::new(MetadataCache::new(Arc::new(local_store), clock.clone()));

    let mailer = HttpMailer::new(config.mail.clone())?;
    let from_address = mailer.from_address().to_string();
    let activation = Arc::new(ActivationService::new(
        Arc::new(MemoryCodeStore::new()),
        Arc::new(mailer),
        clock,
        from_address,
    ));

    Ok(AppState {
        assets,
        metadata,
        activation,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let command = parse_args();
    if let Command::Help = command {
        print_help();
        return Ok(());
    }

    let config = match DaemonConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            print_help();
            std::process::exit(1);
        }
    };
    let state = Arc::new(build_state(&config)?);

    match command {
        Command::Server => {
            info!(
                cache = %state.assets.config().cache_name,
                cache_dir = %config.cache_dir.display(),
                "Starting Kryształkowo daemon in IPC server mode"
            );

            state.assets.activate();
            let sweep_handle =
                spawn_sweep_loop(Arc::clone(&state.activation), config.sweep_interval);

            let mut ipc_server = IpcServer::new(Arc::clone(&state), &config.socket_path);
            if let Err(e) = ipc_server.start().await {
                error!(error = %e, "Failed to start IPC server");
                return Err(e);
            }
            let ipc_server = Arc::new(ipc_server);

            info!("Daemon ready. Waiting for commands from gallery clients...");

            let running = Arc::clone(&ipc_server);
            let ipc_handle = tokio::spawn(async move {
                if let Err(e) = running.run().await {
                    error!(error = %e, "IPC server error");
                }
            });

            // Wait for Ctrl+C
            tokio::signal::ctrl_c().await?;

            info!("Received shutdown signal, stopping...");
            ipc_handle.abort();
            sweep_handle.abort();
            ipc_server.stop()?;

            info!("Shutdown complete.");
        }
        Command::CacheSize => {
            let reply = state.assets.handle_control(ControlMessage::GetCacheSize);
            match reply.count {
                Some(count) if reply.success => println!("{}", count),
                _ => {
                    eprintln!("Failed to read cache size");
                    std::process::exit(1);
                }
            }
        }
        Command::ClearCache => {
            let reply = state.assets.handle_control(ControlMessage::ClearCache);
            if !reply.success {
                eprintln!("Failed to clear cache");
                std::process::exit(1);
            }
            println!("Cache cleared");
        }
        Command::Stats => {
            let stats = state.metadata.stats();
            println!("{}", serde_json::to_string_pretty(&stats)?);
            println!("version: {}", state.metadata.version());
        }
        Command::Help => print_help(),
    }

    Ok(())
}
