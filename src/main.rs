use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use freepilot::config::{CliOverrides, FreepilotConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "freepilot")]
#[command(version, about = "Turn GitHub issues into pull requests with a coding agent")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit operational logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Path to freepilot.toml (defaults to the one in the work directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the database and per-job folders
    #[arg(long, global = true)]
    pub work_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the work directory, a starter config and the job database
    Init,
    /// Create a job for an issue and run it to completion
    Run {
        /// e.g. https://github.com/owner/repo/issues/42
        issue_url: String,
    },
    /// Show a job and its progress
    Status {
        id: i64,
        #[arg(long)]
        json: bool,
    },
    /// Print the full log of a job
    Logs { id: i64 },
    /// Request cancellation of a job
    Cancel { id: i64 },
    /// Fail jobs left unfinished by a previous run
    Recover,
    /// Delete checkouts of finished jobs older than the configured age
    Cleanup {
        /// Override cleanup.max_age_secs
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
    /// Aggregate statistics over completed jobs
    Stats {
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: bool, json: bool) -> Result<()> {
    let default = if verbose { "freepilot=debug" } else { "freepilot=info" };
    let filter = match std::env::var("RUST_LOG") {
        Ok(value) if !value.trim().is_empty() => EnvFilter::try_new(value)?,
        _ => EnvFilter::new(default),
    };
    // stdout is reserved for command output.
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json)?;

    let config = FreepilotConfig::load(&CliOverrides {
        config_path: cli.config.clone(),
        work_dir: cli.work_dir.clone(),
    })?;
    tracing::debug!(work_dir = %config.work_dir.display(), "configuration loaded");

    match &cli.command {
        Commands::Init => cmd::cmd_init(&config)?,
        Commands::Run { issue_url } => cmd::cmd_run(&config, issue_url).await?,
        Commands::Status { id, json } => cmd::cmd_status(&config, *id, *json).await?,
        Commands::Logs { id } => cmd::cmd_logs(&config, *id).await?,
        Commands::Cancel { id } => cmd::cmd_cancel(&config, *id).await?,
        Commands::Recover => cmd::cmd_recover(&config).await?,
        Commands::Cleanup { max_age_secs } => cmd::cmd_cleanup(&config, *max_age_secs).await?,
        Commands::Stats { json } => cmd::cmd_stats(&config, *json).await?,
    }

    Ok(())
}
