use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;

use super::github::GitHubClient;
use super::job_log::read_job_log;
use super::progress::total_cost;
use super::store::JobStore;

static TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+) (?:input|output)").expect("invalid token pattern"));

/// Aggregate numbers over all completed jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_completed_jobs: usize,
    pub total_earnings_in_sats: u64,
    pub total_tokens_processed: u64,
    /// `None` when no GitHub client was available to ask.
    #[serde(rename = "totalMergedPRs")]
    pub total_merged_prs: Option<usize>,
}

/// Sum of `<n> input` / `<n> output` token counts in a log.
pub fn tokens_processed(logs: &str) -> u64 {
    TOKEN_PATTERN
        .captures_iter(logs)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u64>().ok())
        .fold(0u64, |total, n| total.saturating_add(n))
}

pub async fn collect_stats(
    store: &dyn JobStore,
    work_dir: &Path,
    github: Option<&GitHubClient>,
) -> Result<Stats> {
    let jobs = store
        .list_completed()
        .await
        .context("Failed to list completed jobs")?;

    let mut stats = Stats {
        total_completed_jobs: jobs.len(),
        ..Default::default()
    };

    for job in &jobs {
        let logs = match read_job_log(work_dir, job.id).await {
            Ok(logs) => logs,
            Err(e) => {
                tracing::warn!(job_id = job.id, "could not read job log: {:#}", e);
                continue;
            }
        };
        stats.total_earnings_in_sats = stats.total_earnings_in_sats.saturating_add(total_cost(&logs));
        stats.total_tokens_processed = stats
            .total_tokens_processed
            .saturating_add(tokens_processed(&logs));
    }

    if let Some(client) = github {
        // Several jobs can point at the same pull request.
        let pr_urls: BTreeSet<&str> = jobs.iter().filter_map(|j| j.pr_url.as_deref()).collect();
        let mut merged = 0;
        for url in pr_urls {
            match client.is_pull_request_merged(url).await {
                Ok(true) => merged += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(pr_url = url, "could not fetch pull request: {:#}", e),
            }
        }
        stats.total_merged_prs = Some(merged);
    } else {
        tracing::warn!("GitHub token not configured, skipping merged PR stats");
    }

    Ok(stats)
}
