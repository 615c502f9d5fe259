//! Housekeeping commands: `freepilot cleanup | stats`.

use std::time::Duration;

use anyhow::Result;

use freepilot::config::FreepilotConfig;
use freepilot::factory::cleanup::cleanup_old_repositories;
use freepilot::factory::stats::collect_stats;

use super::{github_client, open_store};

pub async fn cmd_cleanup(config: &FreepilotConfig, max_age_secs: Option<u64>) -> Result<()> {
    let store = open_store(config)?;
    let max_age = max_age_secs
        .map(Duration::from_secs)
        .unwrap_or(config.cleanup_max_age);
    let report = cleanup_old_repositories(&store, &config.work_dir, max_age).await?;
    println!(
        "Examined {} jobs: {} checkouts removed, {} failed",
        report.examined, report.removed, report.failed
    );
    Ok(())
}

pub async fn cmd_stats(config: &FreepilotConfig, as_json: bool) -> Result<()> {
    let store = open_store(config)?;
    let github = github_client(config)?;
    let stats = collect_stats(&store, &config.work_dir, github.as_ref()).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Completed jobs:    {}", stats.total_completed_jobs);
    println!("Earnings:          {} sats", stats.total_earnings_in_sats);
    println!("Tokens processed:  {}", stats.total_tokens_processed);
    match stats.total_merged_prs {
        Some(merged) => println!("Merged PRs:        {}", merged),
        None => println!("Merged PRs:        unknown (no GitHub token)"),
    }
    Ok(())
}
