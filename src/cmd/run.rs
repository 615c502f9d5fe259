//! Job execution command: `freepilot run`.

use anyhow::{Context, Result};

use freepilot::config::FreepilotConfig;
use freepilot::factory::cleanup::cleanup_old_repositories;
use freepilot::factory::github::parse_issue_url;
use freepilot::factory::job_log::job_log_path;
use freepilot::factory::models::{CancelRequest, JobStatus};
use freepilot::factory::store::JobStore;

use super::{github_client, open_store, orchestrator};

pub async fn cmd_run(config: &FreepilotConfig, issue_url: &str) -> Result<()> {
    parse_issue_url(issue_url)?;
    let client = github_client(config)?
        .context("GITHUB_TOKEN is not set; add it to the environment or freepilot.toml")?;

    let store = open_store(config)?;
    if config.cleanup_before_run {
        // A failed sweep must not block new work.
        if let Err(e) =
            cleanup_old_repositories(&store, &config.work_dir, config.cleanup_max_age).await
        {
            tracing::warn!("cleanup before run failed: {:#}", e);
        }
    }

    let orchestrator = orchestrator(config, &store, Some(client));
    let job = store
        .create_job(issue_url)
        .await
        .context("Failed to create job")?;
    println!("Created job {} for {}", job.id, issue_url);
    println!(
        "Logs: {}",
        job_log_path(&config.work_dir, job.id).display()
    );

    let mut handle = orchestrator.spawn(job.id);
    loop {
        tokio::select! {
            joined = &mut handle => {
                joined.context("Job task panicked")?;
                break;
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                match orchestrator.request_cancel(job.id).await? {
                    CancelRequest::Accepted => println!("Cancelling job {}...", job.id),
                    CancelRequest::AlreadyRequested => {
                        println!("Cancellation already requested, waiting for the worker to stop")
                    }
                    CancelRequest::RejectedTerminal => {}
                }
            }
        }
    }

    let finished = store.get(job.id).await?;
    match finished.status {
        JobStatus::Completed => {
            println!("Job {} completed", job.id);
            if let Some(pr_url) = &finished.pr_url {
                println!("Pull request: {}", pr_url);
            }
            Ok(())
        }
        status => anyhow::bail!("Job {} finished with status {}", job.id, status),
    }
}
