//! Per-job commands: `freepilot status | logs | cancel | recover`.

use anyhow::Result;
use serde_json::json;

use freepilot::config::FreepilotConfig;
use freepilot::factory::job_log::read_job_log;
use freepilot::factory::models::CancelRequest;
use freepilot::factory::progress::analyze_logs;
use freepilot::factory::store::JobStore;

use super::{open_store, orchestrator};

pub async fn cmd_status(config: &FreepilotConfig, id: i64, as_json: bool) -> Result<()> {
    let store = open_store(config)?;
    let job = store.get(id).await?;
    let logs = read_job_log(&config.work_dir, id).await?;
    let progress = analyze_logs(&logs);

    if as_json {
        let value = json!({ "job": job, "progress": progress });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Job {}  {}", job.id, job.status);
    println!("  Issue:    {}", job.url);
    println!("  Step:     {}", progress.current_step);
    if !progress.completed_steps.is_empty() {
        println!("  Done:     {}", progress.completed_steps.join(", "));
    }
    if progress.total_cost > 0 {
        println!("  Cost:     {} sats", progress.total_cost);
    }
    if let Some(pr_url) = &job.pr_url {
        println!("  PR:       {}", pr_url);
    }
    if job.cancel_requested && !job.status.is_terminal() {
        println!("  Cancellation requested");
    }
    println!("  Created:  {}", job.created_at);
    println!("  Updated:  {}", job.updated_at);
    Ok(())
}

pub async fn cmd_logs(config: &FreepilotConfig, id: i64) -> Result<()> {
    let store = open_store(config)?;
    store.get(id).await?;
    print!("{}", read_job_log(&config.work_dir, id).await?);
    Ok(())
}

/// Sets the cancel flag. A job running in another `freepilot run` picks it up
/// on its next poll.
pub async fn cmd_cancel(config: &FreepilotConfig, id: i64) -> Result<()> {
    let store = open_store(config)?;
    let orchestrator = orchestrator(config, &store, None);
    match orchestrator.request_cancel(id).await? {
        CancelRequest::Accepted => println!("Cancellation requested for job {}", id),
        CancelRequest::AlreadyRequested => {
            println!("Cancellation was already requested for job {}", id)
        }
        CancelRequest::RejectedTerminal => {
            let job = store.get(id).await?;
            anyhow::bail!("Job {} already finished with status {}", id, job.status);
        }
    }
    Ok(())
}

pub async fn cmd_recover(config: &FreepilotConfig) -> Result<()> {
    let store = open_store(config)?;
    let orchestrator = orchestrator(config, &store, None);
    let report = orchestrator.recover_interrupted().await?;
    for id in &report.running {
        println!("Job {} is still running in another process, left alone", id);
    }
    if report.failed.is_empty() && report.cancelled.is_empty() {
        println!("No interrupted jobs");
        return Ok(());
    }
    for id in &report.failed {
        println!("Job {} marked FAILED", id);
    }
    for id in &report.cancelled {
        println!("Job {} marked CANCELLED", id);
    }
    Ok(())
}
