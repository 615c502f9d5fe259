//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module        | Commands handled                        |
//! |---------------|------------------------------------------|
//! | `project`     | `Init`                                   |
//! | `run`         | `Run`                                    |
//! | `job`         | `Status`, `Logs`, `Cancel`, `Recover`    |
//! | `maintenance` | `Cleanup`, `Stats`                       |

pub mod job;
pub mod maintenance;
pub mod project;
pub mod run;

pub use job::{cmd_cancel, cmd_logs, cmd_recover, cmd_status};
pub use maintenance::{cmd_cleanup, cmd_stats};
pub use project::cmd_init;
pub use run::cmd_run;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use freepilot::config::FreepilotConfig;
use freepilot::errors::GitHubError;
use freepilot::factory::agent::GooseWorker;
use freepilot::factory::db::{DbHandle, FactoryDb};
use freepilot::factory::github::{GitHubClient, GitHubPublishService, GitHubRepositoryService};
use freepilot::factory::job_log::{FileLogs, LogSink};
use freepilot::factory::models::{PreparedRepository, Published};
use freepilot::factory::pipeline::{
    Collaborators, JobOrchestrator, PublishService, RepositoryService, UnmeteredWallet,
};
use freepilot::factory::supervisor::ProcessRegistry;

/// Open the job database, creating the work directory if needed.
pub fn open_store(config: &FreepilotConfig) -> Result<DbHandle> {
    if let Some(parent) = config.database_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let db = FactoryDb::new(&config.database_path)
        .with_context(|| format!("Failed to open {}", config.database_path.display()))?;
    Ok(DbHandle::new(db))
}

/// GitHub client from the configured token, if there is one.
pub fn github_client(config: &FreepilotConfig) -> Result<Option<GitHubClient>> {
    match config.github_token.as_deref() {
        Some(token) => Ok(Some(GitHubClient::new(&config.api_base, token)?)),
        None => Ok(None),
    }
}

/// Wire an orchestrator over the store. Without a GitHub client the
/// repository and publish stages fail with [`GitHubError::MissingToken`].
pub fn orchestrator(
    config: &FreepilotConfig,
    store: &DbHandle,
    github: Option<GitHubClient>,
) -> JobOrchestrator {
    let (repository, publisher): (Arc<dyn RepositoryService>, Arc<dyn PublishService>) =
        match github {
            Some(client) => (
                Arc::new(GitHubRepositoryService::new(
                    client.clone(),
                    &config.bot_username,
                    &config.work_dir,
                )),
                Arc::new(GitHubPublishService::new(
                    client,
                    &config.bot_username,
                    &config.public_url,
                )),
            ),
            None => (Arc::new(NoGitHub), Arc::new(NoGitHub)),
        };

    let collaborators = Collaborators {
        wallet: Arc::new(UnmeteredWallet),
        repository,
        publisher,
        worker: Arc::new(GooseWorker::new(
            &config.worker_command,
            config.worker_timeout,
        )),
    };

    JobOrchestrator::new(
        Arc::new(store.clone()),
        ProcessRegistry::new(),
        collaborators,
        Arc::new(FileLogs::new(&config.work_dir)),
        config.pipeline_options(),
    )
}

struct NoGitHub;

#[async_trait]
impl RepositoryService for NoGitHub {
    async fn prepare(
        &self,
        _job_id: i64,
        _issue_url: &str,
        _log: &dyn LogSink,
    ) -> Result<PreparedRepository> {
        Err(GitHubError::MissingToken.into())
    }
}

#[async_trait]
impl PublishService for NoGitHub {
    async fn publish(
        &self,
        _job_id: i64,
        _issue_url: &str,
        _repository: &PreparedRepository,
        _log: &dyn LogSink,
    ) -> Result<Published> {
        Err(GitHubError::MissingToken.into())
    }
}
