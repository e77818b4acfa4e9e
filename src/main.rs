use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_appender::non_blocking;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

mod cache;
mod cli;
mod config;
mod error;
mod fs;
mod link;
mod sonic;
mod transfer;
mod util;

pub use error::CacheError;
pub use error::TransferError;

fn main() -> Result<()> {
    let cli = cli::Cli::parse_from(cli::merged_args());
    let config = config::Config::from_cli(&cli)?;
    init_tracing(&config, cli.debug);

    let transfer =
        Arc::new(transfer::Transfer::init(&config).context("network initialisation failed")?);
    let cache_sys = if config.cache_enabled {
        Some(cache::CacheSystem::init(&config, transfer.clone())?)
    } else {
        None
    };
    let links = link::LinkSystem::init(
        &config,
        transfer.clone(),
        cache_sys.as_ref().map(|c| c.meta_dir().to_path_buf()),
    )
    .context("network initialisation failed")?;

    let filesystem = fs::HttpDirFs::new(links, cache_sys, transfer);
    let options = fs::mount_options(&cli.mount_options);
    tracing::info!("[main] mounting {} at {}", config.base_url, cli.mountpoint.display());
    fuser::mount2(filesystem, &cli.mountpoint, &options)
        .with_context(|| format!("cannot mount at {}", cli.mountpoint.display()))?;
    Ok(())
}

/// Log to stderr; with `-d` (or a non-zero HTTPDIRFS_DEBUG_LEVEL bitmask)
/// the filter drops to debug and a file sink is added next to the cache.
fn init_tracing(config: &config::Config, debug_flag: bool) {
    let env_level: u64 = std::env::var("HTTPDIRFS_DEBUG_LEVEL")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let debug = debug_flag || env_level != 0;
    let level = if debug { "httpdirfs=debug" } else { "httpdirfs=warn" };

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_filter(EnvFilter::new(level));

    if !debug {
        tracing_subscriber::registry().with(stderr_layer).init();
        return;
    }

    // Debug runs also record to a file so a hung mount can be diagnosed
    // after the fact.
    let log_dir = config
        .cache_root()
        .unwrap_or_else(|_| std::env::temp_dir())
        .join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let log_path = log_dir.join("debug.log");
    match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            let (writer, guard) = non_blocking(file);
            // Keep the writer thread alive for the lifetime of the process.
            let _ = Box::leak(Box::new(guard));
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(EnvFilter::new("httpdirfs=debug"));
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .init();
        }
        Err(e) => {
            eprintln!("warning: could not open debug log at {}: {}", log_path.display(), e);
            tracing_subscriber::registry().with(stderr_layer).init();
        }
    }
}
