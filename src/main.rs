//! smb-manager - channel broker daemon and client probe.
//!
//! `serve` runs the broker for one vlan; `probe` asks a running broker for
//! a channel and reports what came back.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use smbcast_broker::broker::connection::descriptor_size;
use smbcast_broker::{broker, logging, BrokerConfig, BrokerConnection, TeardownPolicy};
use std::os::unix::io::{AsFd, AsRawFd};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "smb-manager")]
#[command(version)]
#[command(about = "Broker for shared-memory broadcast channels")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker
    Serve {
        /// Namespace for the socket and log (default: $USER)
        #[arg(long)]
        vlan: Option<String>,
        /// Permitted users and groups, e.g. "u:alice,g:traders"
        #[arg(long)]
        permissions: Option<String>,
        /// Board size for requests with a zero capacity hint, in bytes
        #[arg(long)]
        buffer_size: Option<u64>,
        /// Largest board a request may ask for, in bytes
        #[arg(long)]
        max_buffer_size: Option<u64>,
        /// Log file, or "-" for stdout
        #[arg(long)]
        log_file: Option<PathBuf>,
        /// Control socket path (default: derived from the vlan)
        #[arg(long)]
        socket: Option<PathBuf>,
        /// What to do with channels nobody holds: immediate or retain
        #[arg(long)]
        teardown: Option<TeardownPolicy>,
        /// JSON config file applied before environment and flags
        #[arg(long)]
        config: Option<PathBuf>,
        /// Detach from the terminal
        #[arg(long)]
        daemon: bool,
    },
    /// Ask a running broker for a channel and report the result
    Probe {
        /// Control socket path (default: derived from $USER)
        #[arg(long)]
        socket: Option<PathBuf>,
        /// Channel name
        #[arg(long, default_value = "smbcast://test.0")]
        channel: String,
        /// Capacity hint in bytes (0 for the broker default)
        #[arg(long, default_value_t = 1024)]
        capacity: u32,
    },
}

/// Options of the `serve` subcommand that override the loaded config.
struct ServeOverrides {
    vlan: Option<String>,
    permissions: Option<String>,
    buffer_size: Option<u64>,
    max_buffer_size: Option<u64>,
    log_file: Option<PathBuf>,
    socket: Option<PathBuf>,
    teardown: Option<TeardownPolicy>,
}

impl ServeOverrides {
    fn apply(self, config: &mut BrokerConfig) {
        if let Some(vlan) = self.vlan {
            config.vlan = vlan;
        }
        if let Some(permissions) = self.permissions {
            config.permissions = Some(permissions);
        }
        if let Some(size) = self.buffer_size {
            config.default_buffer_size = size;
        }
        if let Some(size) = self.max_buffer_size {
            config.max_buffer_size = size;
        }
        if let Some(log_file) = self.log_file {
            config.log_file = Some(log_file);
        }
        if let Some(socket) = self.socket {
            config.socket_path = Some(socket);
        }
        if let Some(teardown) = self.teardown {
            config.teardown = teardown;
        }
    }
}

fn serve(config_path: Option<PathBuf>, overrides: ServeOverrides, daemon: bool) -> Result<()> {
    let mut config = BrokerConfig::load(config_path.as_deref())?;
    overrides.apply(&mut config);
    config.validate(daemon)?;

    // Detach before any thread exists and before the log file is opened.
    // The working directory is kept so relative paths stay valid.
    if daemon {
        // SAFETY: no other threads are running yet.
        if unsafe { libc::daemon(1, 0) } != 0 {
            return Err(std::io::Error::last_os_error()).context("daemonize");
        }
    }

    logging::init(&config.log_target())?;
    log::info!("smb-manager v{} (pid {})", env!("CARGO_PKG_VERSION"), std::process::id());
    log::info!("[broker] log target {:?}", config.log_target());

    // Set up signal handlers
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGINT, Arc::clone(&shutdown))?;
    flag::register(SIGTERM, Arc::clone(&shutdown))?;
    flag::register(SIGHUP, Arc::clone(&shutdown))?;

    broker::run(&config, shutdown)
}

fn probe(socket: Option<PathBuf>, channel: &str, capacity: u32) -> Result<()> {
    let socket = match socket {
        Some(socket) => socket,
        None => BrokerConfig::load(None)?.socket_path(),
    };
    let mut conn = BrokerConnection::connect(&socket)?;
    let fd = conn.open_channel(channel, capacity)?;
    let size = descriptor_size(fd.as_fd())?;
    println!("{channel}: success, fd {} ({size} bytes)", fd.as_raw_fd());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            vlan,
            permissions,
            buffer_size,
            max_buffer_size,
            log_file,
            socket,
            teardown,
            config,
            daemon,
        } => {
            let overrides = ServeOverrides {
                vlan,
                permissions,
                buffer_size,
                max_buffer_size,
                log_file,
                socket,
                teardown,
            };
            serve(config, overrides, daemon)?;
        }
        Commands::Probe {
            socket,
            channel,
            capacity,
        } => {
            probe(socket, &channel, capacity)?;
        }
    }

    Ok(())
}
