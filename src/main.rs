use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use taktoor::agent::Agent;
use taktoor::config::Config;

/// Cycle-time monitoring agent for production line equipment.
#[derive(Parser)]
#[command(name = "taktoor", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

fn version_string() -> String {
    format!(
        "{} (commit: {}, {}/{})",
        env!("CARGO_PKG_VERSION"),
        option_env!("GIT_COMMIT").unwrap_or("unknown"),
        std::env::consts::OS,
        std::env::consts::ARCH,
    )
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = cli.command {
        println!("taktoor {}", version_string());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;
    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(version = %version_string(), "starting taktoor");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    wait_for_shutdown_signal().await;

    agent.stop().await;
    tracing::info!("taktoor stopped");

    Ok(())
}

/// Blocks until SIGINT or SIGTERM arrives.
async fn wait_for_shutdown_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sig) => sig,
        Err(e) => {
            tracing::error!(error = %e, "failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received SIGINT, shutting down");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}
