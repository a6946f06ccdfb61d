//! tvrelay: buffering proxy for live TV streams.
//!
//! Viewers request a channel token over HTTP. Each upstream URL is relayed
//! by at most one transcoder, shared by every viewer of that URL, within the
//! tuner limit of its playlist. Failed streams fall over to backup URLs.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use log::{error, info, warn};

mod buffer;
mod config;
mod directory;
mod logging;
mod server;
#[cfg(test)]
mod test_helpers;
mod tuner;
mod web;

use buffer::{DiskStore, MemoryStore, ProcessLauncher, SegmentStore};
use config::{ConfigFile, StoreKind};
use server::{Server, ServerConfig};
use tuner::SessionRegistry;
use web::WebState;

const DEFAULT_LISTEN: &str = "0.0.0.0:34400";
const DEFAULT_CONFIG_FILE: &str = "tvrelay.toml";

/// tvrelay - buffering proxy for live TV streams
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Folder for buffered segments
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Segment store backend
    #[arg(long, value_enum)]
    store: Option<StoreKind>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long)]
    log_retention_days: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Explicit path > ./tvrelay.toml > defaults
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => match config::load_config(path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e.into());
            }
        },
        None => ConfigFile::default(),
    };

    // Command line takes precedence
    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| file_config.logging.log_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let log_retention_days = args
        .log_retention_days
        .or(file_config.logging.retention_days)
        .unwrap_or(7);
    let _log_guard = logging::init_logging(
        &log_dir,
        log_retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    let listen_addr = match args.listen {
        Some(addr) => addr,
        None => file_config
            .server
            .listen
            .as_deref()
            .unwrap_or(DEFAULT_LISTEN)
            .parse::<SocketAddr>()?,
    };

    let directory = match file_config.directory() {
        Ok(d) => Arc::new(d),
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e.into());
        }
    };
    if directory.channel_count() == 0 {
        warn!("No channels configured");
    }

    let buffer_config = file_config.buffer_config(args.temp_dir.clone());
    let store_kind = args.store.or(file_config.buffer.store).unwrap_or_default();
    let store: Arc<dyn SegmentStore> = match store_kind {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::Disk => Arc::new(DiskStore::new()),
    };

    let placeholder = match &file_config.buffer.placeholder {
        Some(path) => match std::fs::read(path) {
            Ok(data) if !data.is_empty() => Bytes::from(data),
            Ok(_) => {
                warn!("Placeholder {} is empty, using built-in", path);
                server::default_placeholder()
            }
            Err(e) => {
                warn!("Failed to read placeholder {}: {}, using built-in", path, e);
                server::default_placeholder()
            }
        },
        None => server::default_placeholder(),
    };

    info!("tvrelay starting...");
    info!("  Listen address: {}", listen_addr);
    info!(
        "  Playlists: {}, channels: {}",
        directory.playlist_count(),
        directory.channel_count()
    );
    info!(
        "  Buffer: {} KB, store: {:?}, temp dir: {}",
        buffer_config.buffer_size_kb,
        store_kind,
        buffer_config.temp_dir.display()
    );
    info!(
        "  First byte timeout: {}s, poll interval: {}ms",
        buffer_config.first_byte_timeout_secs, buffer_config.poll_interval_ms
    );

    let launcher = Arc::new(ProcessLauncher::new(file_config.transcoder_config()));
    let registry = SessionRegistry::new(directory.clone(), store, launcher, buffer_config);
    let state = Arc::new(WebState::new(registry, directory, placeholder));

    let server = Server::new(ServerConfig { listen_addr }, state);
    server.run().await?;

    info!("tvrelay stopped");
    Ok(())
}
