use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;
use crate::errors::StoreError;

/// SQL fragment matching the terminal statuses.
const TERMINAL_STATUSES: &str = "('COMPLETED', 'FAILED', 'CANCELLED')";

/// Async-safe handle to the job database.
///
/// Wraps `FactoryDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FactoryDb>>,
}

impl DbHandle {
    pub fn new(db: FactoryDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FactoryDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests;
    /// never call this from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, FactoryDb>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::LockPoisoned.into())
    }
}

pub struct FactoryDb {
    conn: Connection,
}

impl FactoryDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        // `freepilot cancel` writes from a second process while a run holds the file.
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    url TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'INITIALIZING',
                    cancel_requested INTEGER NOT NULL DEFAULT 0,
                    pr_url TEXT,
                    cleaned_up INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_jobs_cleanup ON jobs(cleaned_up, created_at);
                ",
            )
            .context("Failed to create tables")?;

        // Additive migration for databases created before runs recorded their owner.
        match self.conn.execute("ALTER TABLE jobs ADD COLUMN owner_pid INTEGER", []) {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to add owner_pid column: {}", e)),
        }
        Ok(())
    }

    // ── Job CRUD ──────────────────────────────────────────────────────

    pub fn create_job(&self, url: &str) -> Result<Job> {
        self.conn
            .execute("INSERT INTO jobs (url) VALUES (?1)", params![url])
            .context("Failed to insert job")?;
        let id = self.conn.last_insert_rowid();
        self.get_job(id)?.context("Job not found after insert")
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, url, status, cancel_requested, pr_url, cleaned_up, owner_pid, created_at, updated_at
                 FROM jobs WHERE id = ?1",
                params![id],
                JobRow::from_row,
            )
            .optional()
            .context("Failed to query job")?;
        row.map(JobRow::into_job).transpose()
    }

    fn require_job(&self, id: i64) -> Result<Job> {
        self.get_job(id)?
            .ok_or_else(|| StoreError::JobNotFound { id }.into())
    }

    /// Write a non-terminal pipeline status. Refuses to touch a job that is
    /// already terminal; stages only move forward.
    pub fn update_status(&self, id: i64, status: &JobStatus) -> Result<StatusUpdate> {
        anyhow::ensure!(!status.is_terminal(), "{} is a terminal status", status);
        let current = self.require_job(id)?.status;
        if current.is_terminal() {
            return Ok(StatusUpdate::RejectedTerminal);
        }
        anyhow::ensure!(
            is_valid_transition(&current, status),
            "Invalid status transition {} -> {} for job {}",
            current,
            status,
            id
        );
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE jobs SET status = ?1, updated_at = datetime('now')
                     WHERE id = ?2 AND status NOT IN {}",
                    TERMINAL_STATUSES
                ),
                params![status.as_str(), id],
            )
            .context("Failed to update job status")?;
        if changed == 1 {
            Ok(StatusUpdate::Applied)
        } else {
            Ok(StatusUpdate::RejectedTerminal)
        }
    }

    /// Record the pid of the process driving a non-terminal job. Returns false
    /// when the job is already terminal.
    pub fn claim_job(&self, id: i64, owner_pid: u32) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE jobs SET owner_pid = ?1, updated_at = datetime('now')
                     WHERE id = ?2 AND status NOT IN {}",
                    TERMINAL_STATUSES
                ),
                params![owner_pid, id],
            )
            .context("Failed to claim job")?;
        if changed == 0 {
            self.require_job(id)?;
        }
        Ok(changed == 1)
    }

    /// Set `cancel_requested` on a non-terminal job. The flag never goes back
    /// to false.
    pub fn set_cancel_requested(&self, id: i64) -> Result<CancelRequest> {
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE jobs SET cancel_requested = 1, updated_at = datetime('now')
                     WHERE id = ?1 AND cancel_requested = 0 AND status NOT IN {}",
                    TERMINAL_STATUSES
                ),
                params![id],
            )
            .context("Failed to request cancellation")?;
        if changed == 1 {
            return Ok(CancelRequest::Accepted);
        }
        let job = self.require_job(id)?;
        if job.status.is_terminal() {
            Ok(CancelRequest::RejectedTerminal)
        } else {
            Ok(CancelRequest::AlreadyRequested)
        }
    }

    /// Write a terminal status in one statement. A set `cancel_requested` flag
    /// turns the write into `CANCELLED`; a job that is already terminal is left
    /// untouched. Returns the status that is persisted afterwards.
    pub fn finish_job(&self, id: i64, status: &JobStatus, pr_url: Option<&str>) -> Result<JobStatus> {
        anyhow::ensure!(status.is_terminal(), "{} is not a terminal status", status);
        self.conn
            .execute(
                &format!(
                    "UPDATE jobs SET
                        status = CASE WHEN cancel_requested = 1 THEN 'CANCELLED' ELSE ?1 END,
                        pr_url = COALESCE(?2, pr_url),
                        updated_at = datetime('now')
                     WHERE id = ?3 AND status NOT IN {}",
                    TERMINAL_STATUSES
                ),
                params![status.as_str(), pr_url, id],
            )
            .context("Failed to finish job")?;
        Ok(self.require_job(id)?.status)
    }

    fn list_where(&self, clause: &str, args: impl rusqlite::Params) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT id, url, status, cancel_requested, pr_url, cleaned_up, owner_pid, created_at, updated_at
                 FROM jobs WHERE {} ORDER BY id",
                clause
            ))
            .context("Failed to prepare job listing")?;
        let rows = stmt
            .query_map(args, JobRow::from_row)
            .context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            let row = row.context("Failed to read job row")?;
            jobs.push(row.into_job()?);
        }
        Ok(jobs)
    }

    pub fn list_unfinished_jobs(&self) -> Result<Vec<Job>> {
        self.list_where(&format!("status NOT IN {}", TERMINAL_STATUSES), [])
    }

    pub fn list_completed_jobs(&self) -> Result<Vec<Job>> {
        self.list_where("status = 'COMPLETED'", [])
    }

    /// Terminal jobs older than `max_age` whose checkout has not been removed.
    pub fn list_stale_jobs(&self, max_age: Duration) -> Result<Vec<Job>> {
        let modifier = format!("-{} seconds", max_age.as_secs());
        self.list_where(
            &format!(
                "cleaned_up = 0 AND created_at < datetime('now', ?1) AND status IN {}",
                TERMINAL_STATUSES
            ),
            params![modifier],
        )
    }

    pub fn mark_cleaned_up(&self, id: i64) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET cleaned_up = 1, updated_at = datetime('now') WHERE id = ?1",
                params![id],
            )
            .context("Failed to mark job cleaned up")?;
        if changed == 0 {
            return Err(StoreError::JobNotFound { id }.into());
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn backdate_job(&self, id: i64, seconds: u64) -> Result<()> {
        self.conn.execute(
            "UPDATE jobs SET created_at = datetime('now', ?1) WHERE id = ?2",
            params![format!("-{} seconds", seconds), id],
        )?;
        Ok(())
    }
}

/// Intermediate row struct for jobs.
struct JobRow {
    id: i64,
    url: String,
    status: String,
    cancel_requested: i64,
    pr_url: Option<String>,
    cleaned_up: i64,
    owner_pid: Option<u32>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            url: row.get(1)?,
            status: row.get(2)?,
            cancel_requested: row.get(3)?,
            pr_url: row.get(4)?,
            cleaned_up: row.get(5)?,
            owner_pid: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job status")?;
        Ok(Job {
            id: self.id,
            url: self.url,
            status,
            cancel_requested: self.cancel_requested != 0,
            pr_url: self.pr_url,
            cleaned_up: self.cleaned_up != 0,
            owner_pid: self.owner_pid,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const ISSUE: &str = "https://github.com/getAlby/lnfly/issues/11";

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = 'jobs'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 1);
        Ok(())
    }

    #[test]
    fn test_migrations_are_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("freepilot.db");
        let job = FactoryDb::new(&path)?.create_job(ISSUE)?;
        let reopened = FactoryDb::new(&path)?;
        assert_eq!(reopened.get_job(job.id)?.map(|j| j.url), Some(ISSUE.to_string()));
        Ok(())
    }

    #[test]
    fn test_migration_adds_owner_column_to_existing_table() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("freepilot.db");
        Connection::open(&path)?.execute_batch(
            "CREATE TABLE jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'INITIALIZING',
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                pr_url TEXT,
                cleaned_up INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            INSERT INTO jobs (url) VALUES ('https://github.com/getAlby/lnfly/issues/11');",
        )?;
        let db = FactoryDb::new(&path)?;
        let job = db.get_job(1)?.unwrap();
        assert_eq!(job.owner_pid, None);
        assert!(db.claim_job(job.id, 4242)?);
        assert_eq!(db.get_job(job.id)?.unwrap().owner_pid, Some(4242));
        Ok(())
    }

    #[test]
    fn test_claim_records_owner_until_terminal() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let job = db.create_job(ISSUE)?;
        assert_eq!(job.owner_pid, None);
        assert!(db.claim_job(job.id, 77)?);
        assert_eq!(db.get_job(job.id)?.unwrap().owner_pid, Some(77));

        db.finish_job(job.id, &JobStatus::Failed, None)?;
        assert!(!db.claim_job(job.id, 78)?);
        assert_eq!(db.get_job(job.id)?.unwrap().owner_pid, Some(77));

        let err = db.claim_job(404, 77).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::JobNotFound { id: 404 })
        ));
        Ok(())
    }

    #[test]
    fn test_create_job_starts_initializing() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let job = db.create_job(ISSUE)?;
        assert!(job.id > 0);
        assert_eq!(job.url, ISSUE);
        assert_eq!(job.status, JobStatus::Initializing);
        assert!(!job.cancel_requested);
        assert!(!job.cleaned_up);
        assert!(job.pr_url.is_none());
        assert!(!job.created_at.is_empty());
        Ok(())
    }

    #[test]
    fn test_get_missing_job_is_none() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        assert!(db.get_job(404)?.is_none());
        Ok(())
    }

    #[test]
    fn test_update_status_applies_to_running_job() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let job = db.create_job(ISSUE)?;
        assert_eq!(db.update_status(job.id, &JobStatus::CheckingWallet)?, StatusUpdate::Applied);
        assert_eq!(db.get_job(job.id)?.unwrap().status, JobStatus::CheckingWallet);
        Ok(())
    }

    #[test]
    fn test_update_status_rejected_after_terminal() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let job = db.create_job(ISSUE)?;
        db.finish_job(job.id, &JobStatus::Failed, None)?;
        assert_eq!(
            db.update_status(job.id, &JobStatus::Publishing)?,
            StatusUpdate::RejectedTerminal
        );
        assert_eq!(db.get_job(job.id)?.unwrap().status, JobStatus::Failed);
        Ok(())
    }

    #[test]
    fn test_update_status_only_moves_forward() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let job = db.create_job(ISSUE)?;
        db.update_status(job.id, &JobStatus::AgentWorking)?;
        assert!(db.update_status(job.id, &JobStatus::CheckingWallet).is_err());
        assert!(db.update_status(job.id, &JobStatus::Completed).is_err());
        assert_eq!(db.get_job(job.id)?.unwrap().status, JobStatus::AgentWorking);
        Ok(())
    }

    #[test]
    fn test_update_status_missing_job_is_not_found() {
        let db = FactoryDb::new_in_memory().unwrap();
        let err = db.update_status(9, &JobStatus::CheckingWallet).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::JobNotFound { id: 9 })
        ));
    }

    #[test]
    fn test_cancel_request_is_idempotent() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let job = db.create_job(ISSUE)?;
        assert_eq!(db.set_cancel_requested(job.id)?, CancelRequest::Accepted);
        assert_eq!(db.set_cancel_requested(job.id)?, CancelRequest::AlreadyRequested);
        assert!(db.get_job(job.id)?.unwrap().cancel_requested);
        Ok(())
    }

    #[test]
    fn test_cancel_request_rejected_for_terminal_job() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let job = db.create_job(ISSUE)?;
        db.finish_job(job.id, &JobStatus::Completed, Some("https://github.com/o/r/pull/1"))?;
        assert_eq!(db.set_cancel_requested(job.id)?, CancelRequest::RejectedTerminal);
        assert!(!db.get_job(job.id)?.unwrap().cancel_requested);
        Ok(())
    }

    #[test]
    fn test_finish_records_pr_url() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let job = db.create_job(ISSUE)?;
        let status = db.finish_job(job.id, &JobStatus::Completed, Some("https://github.com/o/r/pull/5"))?;
        assert_eq!(status, JobStatus::Completed);
        let job = db.get_job(job.id)?.unwrap();
        assert_eq!(job.pr_url.as_deref(), Some("https://github.com/o/r/pull/5"));
        Ok(())
    }

    #[test]
    fn test_finish_turns_into_cancelled_when_flag_set() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let job = db.create_job(ISSUE)?;
        db.set_cancel_requested(job.id)?;
        let status = db.finish_job(job.id, &JobStatus::Completed, Some("https://github.com/o/r/pull/5"))?;
        assert_eq!(status, JobStatus::Cancelled);
        Ok(())
    }

    #[test]
    fn test_finish_never_overwrites_terminal_status() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let job = db.create_job(ISSUE)?;
        assert_eq!(db.finish_job(job.id, &JobStatus::Cancelled, None)?, JobStatus::Cancelled);
        assert_eq!(db.finish_job(job.id, &JobStatus::Completed, None)?, JobStatus::Cancelled);
        assert_eq!(db.finish_job(job.id, &JobStatus::Failed, None)?, JobStatus::Cancelled);
        Ok(())
    }

    #[test]
    fn test_finish_rejects_non_terminal_status() {
        let db = FactoryDb::new_in_memory().unwrap();
        let job = db.create_job(ISSUE).unwrap();
        assert!(db.finish_job(job.id, &JobStatus::Publishing, None).is_err());
    }

    #[test]
    fn test_list_unfinished_and_completed() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let running = db.create_job(ISSUE)?;
        db.update_status(running.id, &JobStatus::AgentWorking)?;
        let done = db.create_job(ISSUE)?;
        db.finish_job(done.id, &JobStatus::Completed, None)?;
        let failed = db.create_job(ISSUE)?;
        db.finish_job(failed.id, &JobStatus::Failed, None)?;

        let unfinished: Vec<i64> = db.list_unfinished_jobs()?.iter().map(|j| j.id).collect();
        assert_eq!(unfinished, vec![running.id]);
        let completed: Vec<i64> = db.list_completed_jobs()?.iter().map(|j| j.id).collect();
        assert_eq!(completed, vec![done.id]);
        Ok(())
    }

    #[test]
    fn test_list_stale_jobs_filters_by_age_and_cleanup() -> Result<()> {
        let db = FactoryDb::new_in_memory()?;
        let old = db.create_job(ISSUE)?;
        db.finish_job(old.id, &JobStatus::Completed, None)?;
        db.backdate_job(old.id, 7200)?;
        let fresh = db.create_job(ISSUE)?;
        db.finish_job(fresh.id, &JobStatus::Completed, None)?;
        let old_running = db.create_job(ISSUE)?;
        db.backdate_job(old_running.id, 7200)?;

        let stale: Vec<i64> = db
            .list_stale_jobs(Duration::from_secs(3600))?
            .iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(stale, vec![old.id]);

        db.mark_cleaned_up(old.id)?;
        assert!(db.list_stale_jobs(Duration::from_secs(3600))?.is_empty());
        assert!(db.get_job(old.id)?.unwrap().cleaned_up);
        Ok(())
    }

    #[tokio::test]
    async fn test_db_handle_call_runs_on_blocking_pool() -> Result<()> {
        let handle = DbHandle::new(FactoryDb::new_in_memory()?);
        let job = handle.call(|db| db.create_job(ISSUE)).await?;
        let fetched = handle.call(move |db| db.get_job(job.id)).await?;
        assert_eq!(fetched.map(|j| j.id), Some(job.id));
        Ok(())
    }
}
