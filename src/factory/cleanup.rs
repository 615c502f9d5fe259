use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use super::github::parse_issue_url;
use super::job_log::job_dir;
use super::store::JobStore;

pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Jobs old enough to be considered.
    pub examined: usize,
    /// Checkouts actually deleted from disk.
    pub removed: usize,
    /// Jobs skipped because cleanup failed.
    pub failed: usize,
}

/// Delete the cloned repositories of finished jobs older than `max_age` to
/// free disk space. The job log stays. A job whose cleanup fails is left for
/// the next pass.
pub async fn cleanup_old_repositories(
    store: &dyn JobStore,
    work_dir: &Path,
    max_age: Duration,
) -> Result<CleanupReport> {
    tracing::info!(max_age_secs = max_age.as_secs(), "starting cleanup of old repository folders");
    let jobs = store
        .list_stale(max_age)
        .await
        .context("Failed to list stale jobs")?;
    tracing::info!("found {} old jobs to clean up", jobs.len());

    let mut report = CleanupReport {
        examined: jobs.len(),
        ..Default::default()
    };

    for job in jobs {
        match cleanup_job(store, work_dir, job.id, &job.url).await {
            Ok(removed) => {
                if removed {
                    report.removed += 1;
                }
            }
            Err(e) => {
                report.failed += 1;
                tracing::error!(job_id = job.id, "failed to clean up job: {:#}", e);
            }
        }
    }

    tracing::info!(
        removed = report.removed,
        failed = report.failed,
        "completed cleanup of old repository folders"
    );
    Ok(report)
}

async fn cleanup_job(store: &dyn JobStore, work_dir: &Path, job_id: i64, url: &str) -> Result<bool> {
    let repo = parse_issue_url(url)?.repo;
    let path = job_dir(work_dir, job_id).join(&repo);

    let removed = match tokio::fs::remove_dir_all(&path).await {
        Ok(()) => {
            tracing::info!(job_id, path = %path.display(), "deleted repository folder");
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(job_id, path = %path.display(), "repository folder already gone");
            false
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to delete {}", path.display()));
        }
    };

    store.mark_cleaned_up(job_id).await?;
    Ok(removed)
}
