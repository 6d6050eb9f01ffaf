//! buse - serve a userspace block device through /dev/nbdX.
//!
//! Usage:
//!   buse serve --device /dev/nbd0 --size 134217728
//!   buse serve --config buse.toml
//!   buse disconnect /dev/nbd0

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use buse::backend::{FileBackend, MemoryBackend};
use buse::error::{EXIT_FAILURE, EXIT_SUCCESS};
use buse::{BackendKind, BlockOperations, Config, Session};

/// Memory device size when none is configured (128 MiB).
const DEFAULT_MEMORY_SIZE: u64 = 128 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "buse", about = "Userspace block devices over the Linux NBD driver")]
struct Cli {
    /// Verbosity (-v info, -vv debug, -vvv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach a backend to an NBD device and serve it until disconnected
    Serve(ServeArgs),
    /// Disconnect an NBD device
    Disconnect {
        /// NBD device path
        device: PathBuf,
    },
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Path to config file. If omitted, uses defaults (in-memory device).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// NBD device path. Overrides config file if specified.
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Device size in bytes.
    #[arg(short, long)]
    size: Option<u64>,

    /// Block size in bytes.
    #[arg(short, long)]
    block_size: Option<u64>,

    /// Backend kind.
    #[arg(long, value_parser = parse_backend)]
    backend: Option<BackendKind>,

    /// Backing file for the file backend.
    #[arg(short, long)]
    file: Option<PathBuf>,
}

fn parse_backend(s: &str) -> Result<BackendKind, String> {
    match s {
        "memory" => Ok(BackendKind::Memory),
        "file" => Ok(BackendKind::File),
        other => Err(format!("unknown backend `{other}` (expected memory or file)")),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Disconnect { device } => nbd::disconnect_device(&device)
            .map_err(buse::Error::from)
            .with_context(|| format!("Failed to disconnect {}", device.display())),
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(e) => {
            error!(error = %format!("{e:#}"), "buse failed");
            let code = e
                .downcast_ref::<buse::Error>()
                .map(buse::Error::exit_code)
                .unwrap_or(EXIT_FAILURE);
            ExitCode::from(code)
        }
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "buse=warn,warn",
        1 => "buse=info,nbd=info,warn",
        2 => "buse=debug,nbd=debug,warn",
        _ => "buse=trace,nbd=trace,info",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut config = match args.config {
        Some(ref path) => Config::load(path)
            .map_err(buse::Error::from)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => Config::default(),
    };

    // CLI overrides
    if let Some(device) = args.device {
        config.device.path = device;
    }
    if let Some(size) = args.size {
        config.device.size_bytes = Some(size);
        config.device.size_blocks = None;
    }
    if let Some(block_size) = args.block_size {
        config.device.block_size = Some(block_size);
    }
    if let Some(kind) = args.backend {
        config.backend.kind = kind;
    }
    if let Some(file) = args.file {
        config.backend.path = Some(file);
        if args.backend.is_none() {
            config.backend.kind = BackendKind::File;
        }
    }
    config.validate().map_err(buse::Error::from)?;

    let configured_size = config.device.resolved_size_bytes();
    let (ops, size_bytes): (Arc<dyn BlockOperations>, u64) = match config.backend.kind {
        BackendKind::Memory => {
            let size = configured_size.unwrap_or(DEFAULT_MEMORY_SIZE);
            let backend = MemoryBackend::new(size)
                .map_err(buse::Error::from)
                .with_context(|| format!("Failed to allocate {size} bytes for memory device"))?;
            (Arc::new(backend), size)
        }
        BackendKind::File => {
            let path = config
                .backend
                .path
                .as_ref()
                .context("file backend requires a path")?;
            let backend = FileBackend::open(path, configured_size)
                .map_err(buse::Error::from)
                .with_context(|| format!("Failed to open backing file: {}", path.display()))?;
            let size = backend.size_bytes();
            (Arc::new(backend), size)
        }
    };

    let geometry = config.device.geometry(size_bytes);
    info!(
        device = %config.device.path.display(),
        backend = ?config.backend.kind,
        size_bytes,
        block_size = ?geometry.block_size,
        "buse starting"
    );

    Session::new(config.device.path.clone(), geometry, ops)
        .with_server_config(config.server.server_config())
        .run()
        .await
        .map_err(anyhow::Error::from)
}
