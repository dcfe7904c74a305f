use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use warren::dispatch::Dispatcher;
use warren::server;

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "warren", author, version, about = "Multi-tenant Nostr relay")]
struct Cli {
    /// Directory of per-host TOML config files.
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,
    /// Path to the shared SQLite database.
    #[arg(long, default_value = "warren.db")]
    db: PathBuf,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Initialise database schemas for every configured host.
    Init,
    /// Serve WebSocket and HTTP endpoints.
    Serve {
        /// Bind address, e.g. `127.0.0.1:3334`.
        #[arg(long, default_value = "127.0.0.1:3334")]
        bind: String,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    let dispatcher = Arc::new(Dispatcher::new(cli.config_dir, &cli.db)?);
    match cli.command {
        Commands::Init => {
            for host in dispatcher.known_hosts()? {
                dispatcher.get(&host)?;
                info!(host, "initialized");
            }
        }
        Commands::Serve { bind } => {
            for host in dispatcher.known_hosts()? {
                if let Err(e) = dispatcher.get(&host) {
                    warn!(host, error = %e, "failed to load instance");
                }
            }
            let addr: SocketAddr = bind.parse()?;
            info!(%addr, "serving");
            server::serve(addr, dispatcher, std::future::pending()).await?;
        }
    }
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    run(Cli::parse()).await
}
