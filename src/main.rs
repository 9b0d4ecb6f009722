//! automation-queue - per-user automation sessions behind an HTTP API.
//!
//! Usage:
//!   automation-queue serve [--port 8080] [--config queue.toml]
//!   automation-queue print-config [--config queue.toml]

use anyhow::Context;
use automation_queue::{builtin, http_server, AppState, CommandLauncher, Config, Scheduler};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "automation-queue")]
#[command(about = "Session and admission queue for document-automation processes")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,

        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML
    PrintConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve { port, config } => {
            let config = Config::load(config.as_deref())?;
            serve(port, config).await
        }
        Commands::PrintConfig { config } => {
            let config = Config::load(config.as_deref())?;
            print!("{}", toml::to_string_pretty(&config).context("render config")?);
            Ok(())
        }
    }
}

async fn serve(port: u16, config: Config) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.work_root)
        .await
        .with_context(|| format!("create work root {}", config.work_root.display()))?;

    let launcher = Arc::new(CommandLauncher::new(config.launcher.commands()));
    let scheduler = Arc::new(Scheduler::start(&config, builtin::registry(), launcher));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown requested");
    };
    let served = http_server::run_server(addr, AppState::new(scheduler.clone()), shutdown).await;

    scheduler.shutdown().await;
    served
}
