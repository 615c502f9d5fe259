use std::time::Duration;

use async_trait::async_trait;

use super::db::DbHandle;
use super::models::{CancelRequest, Job, JobStatus, StatusUpdate};
use crate::errors::StoreError;

/// Persistent job records shared by the orchestrator and the CLI.
///
/// Every write that can race with a cancellation request is a single
/// conditional statement, so precedence rules hold without extra locking.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, url: &str) -> Result<Job, StoreError>;

    async fn get(&self, id: i64) -> Result<Job, StoreError>;

    async fn update_status(&self, id: i64, status: JobStatus) -> Result<StatusUpdate, StoreError>;

    async fn set_cancel_requested(&self, id: i64) -> Result<CancelRequest, StoreError>;

    /// Record which process is driving the job. Returns false if the job is
    /// already terminal.
    async fn claim(&self, id: i64, owner_pid: u32) -> Result<bool, StoreError>;

    /// Write a terminal status (and optionally the PR URL). Returns the status
    /// that ends up persisted, which is `CANCELLED` whenever cancellation was
    /// requested and unchanged if the job was already terminal.
    async fn finish(
        &self,
        id: i64,
        status: JobStatus,
        pr_url: Option<String>,
    ) -> Result<JobStatus, StoreError>;

    async fn list_unfinished(&self) -> Result<Vec<Job>, StoreError>;

    async fn list_completed(&self) -> Result<Vec<Job>, StoreError>;

    async fn list_stale(&self, max_age: Duration) -> Result<Vec<Job>, StoreError>;

    async fn mark_cleaned_up(&self, id: i64) -> Result<(), StoreError>;

    /// Re-read the cancellation flag.
    async fn is_cancel_requested(&self, id: i64) -> Result<bool, StoreError> {
        Ok(self.get(id).await?.cancel_requested)
    }
}

fn store_error(err: anyhow::Error) -> StoreError {
    err.downcast::<StoreError>().unwrap_or_else(StoreError::Database)
}

#[async_trait]
impl JobStore for DbHandle {
    async fn create_job(&self, url: &str) -> Result<Job, StoreError> {
        let url = url.to_string();
        self.call(move |db| db.create_job(&url)).await.map_err(store_error)
    }

    async fn get(&self, id: i64) -> Result<Job, StoreError> {
        self.call(move |db| db.get_job(id))
            .await
            .map_err(store_error)?
            .ok_or(StoreError::JobNotFound { id })
    }

    async fn update_status(&self, id: i64, status: JobStatus) -> Result<StatusUpdate, StoreError> {
        self.call(move |db| db.update_status(id, &status))
            .await
            .map_err(store_error)
    }

    async fn set_cancel_requested(&self, id: i64) -> Result<CancelRequest, StoreError> {
        self.call(move |db| db.set_cancel_requested(id))
            .await
            .map_err(store_error)
    }

    async fn claim(&self, id: i64, owner_pid: u32) -> Result<bool, StoreError> {
        self.call(move |db| db.claim_job(id, owner_pid))
            .await
            .map_err(store_error)
    }

    async fn finish(
        &self,
        id: i64,
        status: JobStatus,
        pr_url: Option<String>,
    ) -> Result<JobStatus, StoreError> {
        self.call(move |db| db.finish_job(id, &status, pr_url.as_deref()))
            .await
            .map_err(store_error)
    }

    async fn list_unfinished(&self) -> Result<Vec<Job>, StoreError> {
        self.call(|db| db.list_unfinished_jobs()).await.map_err(store_error)
    }

    async fn list_completed(&self) -> Result<Vec<Job>, StoreError> {
        self.call(|db| db.list_completed_jobs()).await.map_err(store_error)
    }

    async fn list_stale(&self, max_age: Duration) -> Result<Vec<Job>, StoreError> {
        self.call(move |db| db.list_stale_jobs(max_age))
            .await
            .map_err(store_error)
    }

    async fn mark_cleaned_up(&self, id: i64) -> Result<(), StoreError> {
        self.call(move |db| db.mark_cleaned_up(id)).await.map_err(store_error)
    }
}
