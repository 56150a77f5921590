//! srvlink - diagnostic front end for the broker transport.
//!
//! Resolves configuration, bootstraps a connection and registers the main
//! thread, printing what it found. See the `srvlink` library for the
//! transport itself.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use srvlink::{bootstrap, Transport, TransportConfig, ThreadContext};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "srvlink")]
#[command(version)]
#[command(about = "Inspect and exercise the broker connection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the server directory for this host and user
    ServerDir,
    /// Print the resolved configuration as JSON
    Config,
    /// Connect to the broker, launching it if needed
    Connect {
        /// Never launch the broker; fail if its sockets are absent
        #[arg(long)]
        no_launch: bool,
    },
    /// Connect and register the main thread
    Register,
}

/// A launcher that refuses, for `connect --no-launch`.
#[derive(Debug)]
struct NoLaunch;

impl bootstrap::BrokerLauncher for NoLaunch {
    fn launch(&mut self, _config: &TransportConfig) -> Result<(), srvlink::BootstrapError> {
        Err(srvlink::BootstrapError::BrokerNotFound)
    }

    fn exited(&mut self) -> Option<std::process::ExitStatus> {
        None
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = TransportConfig::from_env();

    match cli.command {
        Commands::ServerDir => {
            let dir = bootstrap::server_dir(&config).context("Failed to resolve server directory")?;
            println!("{}", dir.display());
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Connect { no_launch } => {
            let transport = if no_launch {
                Transport::connect_with(config, &mut NoLaunch)
            } else {
                Transport::connect(config)
            }
            .context("Failed to connect to broker")?;
            let summary = serde_json::json!({
                "server_dir": transport.server_dir(),
                "fast_path": transport.fast().is_active(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Register => {
            let transport = Arc::new(Transport::connect_or_exit(config));
            let ctx = ThreadContext::init_main(Arc::clone(&transport));
            let summary = serde_json::json!({
                "pid": ctx.pid(),
                "tid": ctx.tid(),
                "server_pid": ctx.server_pid(),
                "boot": ctx.is_boot(),
                "fast_path": transport.fast().is_active(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
            log::info!("registered as tid {:04x}", ctx.tid());
        }
    }

    Ok(())
}
