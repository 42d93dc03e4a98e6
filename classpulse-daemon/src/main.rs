//! ClassPulse daemon - classroom affect telemetry
//!
//! Supervises one capture process per device, scores and stores every
//! record, and fans records out to dashboards over a live Unix socket.
//! Capture sessions are driven through the control socket.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use classpulse_daemon::config::{DaemonConfig, CONFIG_ENV_VAR};
use classpulse_daemon::{logview, Daemon};

#[derive(Parser)]
#[command(name = "classpulse-daemon", version, about = "Classroom affect telemetry daemon")]
struct Cli {
    /// Config file (default: $CLASSPULSE_CONFIG or the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default)
    Run,

    /// Print the last lines of the fallback log
    Tail {
        #[arg(long, default_value_t = 10)]
        lines: usize,
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Pretty-print the last records of the fallback log
    ShowLast {
        #[arg(long, default_value_t = 5)]
        n: usize,
        #[arg(long)]
        path: Option<PathBuf>,
    },

    /// Per-student averages over the recent fallback log
    Summary {
        #[arg(long, default_value_t = 60)]
        minutes: i64,
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn load_config(cli: &Cli) -> Result<DaemonConfig> {
    let config = match &cli.config {
        Some(path) => DaemonConfig::load_from(path),
        None => DaemonConfig::load(),
    };
    config.context("Failed to load configuration")
}

fn log_path(config: &DaemonConfig, path: &Option<PathBuf>) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path.clone()),
        None => config.fallback_log_path(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let config = load_config(&cli)?;

    match &cli.command {
        None | Some(Commands::Run) => run(config).await,
        Some(Commands::Tail { lines, path }) => {
            for line in logview::tail_lines(&log_path(&config, path)?, *lines)? {
                println!("{}", line);
            }
            Ok(())
        }
        Some(Commands::ShowLast { n, path }) => {
            let out = logview::show_last(&log_path(&config, path)?, *n)?;
            if out.is_empty() {
                println!("No records.");
            }
            for line in out {
                println!("{}", line);
            }
            Ok(())
        }
        Some(Commands::Summary { minutes, path }) => {
            let summary = logview::summarize(&log_path(&config, path)?, *minutes, chrono::Utc::now())?;
            if summary.is_empty() {
                println!("No records in the last {} minutes.", minutes);
            } else {
                println!("Aggregated over last {} minutes:", minutes);
                for student in summary {
                    println!("{}", student);
                }
            }
            Ok(())
        }
    }
}

async fn run(config: DaemonConfig) -> Result<()> {
    info!("Starting ClassPulse daemon v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded from {} (override with {})",
        config.config_path.display(),
        CONFIG_ENV_VAR
    );

    let daemon = Daemon::start(&config).await?;

    info!("ClassPulse daemon ready");
    info!("  - Control socket: {}", daemon.control_socket_path().display());
    info!("  - Live socket: {}", daemon.live_socket_path().display());

    daemon
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}
