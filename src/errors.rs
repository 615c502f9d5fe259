//! Typed error hierarchy for freepilot.
//!
//! - `PipelineError`: why a job run stopped before `COMPLETED`
//! - `WorkerFailure`: fatal outcomes of the supervised worker process
//! - `StoreError`: job store failures
//! - `GitHubError`: issue URL parsing and GitHub API failures

use thiserror::Error;

use crate::factory::models::JobStatus;

/// Errors that end a pipeline run. Each is converted to exactly one terminal
/// status write by the orchestrator and never propagated further.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Job was cancelled")]
    Cancelled,

    #[error(transparent)]
    Worker(#[from] WorkerFailure),

    #[error("{stage} stage failed: {source:#}")]
    Collaborator {
        stage: JobStatus,
        #[source]
        source: anyhow::Error,
    },

    #[error("Job {id} already reached a terminal status")]
    AlreadyTerminal { id: i64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fatal outcomes of the worker stage.
#[derive(Debug, Error)]
pub enum WorkerFailure {
    #[error("Failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Worker process exited with non-success code {code}")]
    Exit { code: i32 },

    #[error("Worker process exceeded its time budget")]
    TimedOut,
}

/// Errors from the job store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job {id} not found")]
    JobNotFound { id: i64 },

    #[error("Database error: {0:#}")]
    Database(#[source] anyhow::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,
}

/// Errors from the GitHub collaborators.
#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("Invalid issue URL '{url}': {reason}")]
    InvalidIssueUrl { url: String, reason: String },

    #[error("Invalid pull request URL '{0}'")]
    InvalidPullRequestUrl(String),

    #[error("GitHub API returned {status} for {endpoint}: {body}")]
    Api {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("GitHub token is not configured")]
    MissingToken,
}
