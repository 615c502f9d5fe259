use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::job_log::{LogProvider, LogSink};
use super::models::*;
use super::progress::{CANCELLED_MARKER, FAILURE_MARKER, SUCCESS_MARKER};
use super::store::JobStore;
use super::supervisor::{
    DEFAULT_GRACE_PERIOD, ProcessRegistry, ProcessSupervisor, WorkerOutcome, WorkerSpec,
    is_process_running,
};
use crate::errors::{PipelineError, StoreError};

pub const DEFAULT_CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(2);

// ── Collaborator seams ────────────────────────────────────────────────

/// Pre-flight check that the job may start (balance, payment).
#[async_trait]
pub trait WalletService: Send + Sync {
    async fn check(&self, job: &Job, log: &dyn LogSink) -> anyhow::Result<()>;
}

/// Fetches the issue and produces a local checkout for the worker.
#[async_trait]
pub trait RepositoryService: Send + Sync {
    async fn prepare(
        &self,
        job_id: i64,
        issue_url: &str,
        log: &dyn LogSink,
    ) -> anyhow::Result<PreparedRepository>;
}

/// Pushes the worker's changes and opens a pull request.
#[async_trait]
pub trait PublishService: Send + Sync {
    async fn publish(
        &self,
        job_id: i64,
        issue_url: &str,
        repository: &PreparedRepository,
        log: &dyn LogSink,
    ) -> anyhow::Result<Published>;
}

/// Builds the worker command line for a prepared checkout.
pub trait WorkerFactory: Send + Sync {
    fn build(&self, job_id: i64, repository: &PreparedRepository) -> WorkerSpec;
}

/// Wallet that approves every job. Used when no payment backend is attached.
pub struct UnmeteredWallet;

#[async_trait]
impl WalletService for UnmeteredWallet {
    async fn check(&self, job: &Job, _log: &dyn LogSink) -> anyhow::Result<()> {
        tracing::debug!(job_id = job.id, "no wallet configured, skipping balance check");
        Ok(())
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub wallet: Arc<dyn WalletService>,
    pub repository: Arc<dyn RepositoryService>,
    pub publisher: Arc<dyn PublishService>,
    pub worker: Arc<dyn WorkerFactory>,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    /// Time a worker gets to exit after the graceful stop signal.
    pub grace_period: Duration,
    /// How often the store flag is re-read while the worker runs.
    pub cancel_poll_interval: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            cancel_poll_interval: DEFAULT_CANCEL_POLL_INTERVAL,
        }
    }
}

/// Jobs touched by [`JobOrchestrator::recover_interrupted`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RecoveryReport {
    pub failed: Vec<i64>,
    pub cancelled: Vec<i64>,
    /// Jobs left alone because the process that claimed them is still running.
    pub running: Vec<i64>,
}

// ── Orchestrator ──────────────────────────────────────────────────────

/// Drives jobs through `CHECKING_WALLET → PREPARING_REPOSITORY →
/// AGENT_WORKING → PUBLISHING` and writes exactly one terminal status per run.
#[derive(Clone)]
pub struct JobOrchestrator {
    store: Arc<dyn JobStore>,
    registry: ProcessRegistry,
    collaborators: Collaborators,
    logs: Arc<dyn LogProvider>,
    options: PipelineOptions,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: ProcessRegistry,
        collaborators: Collaborators,
        logs: Arc<dyn LogProvider>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            registry,
            collaborators,
            logs,
            options,
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Run the pipeline for a job on its own task.
    pub fn spawn(&self, job_id: i64) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run(job_id).await })
    }

    /// Run the pipeline for a job to a terminal status. Stage failures are
    /// recorded on the job, never returned.
    pub async fn run(&self, job_id: i64) {
        tracing::info!(job_id, "starting job");
        let log = match self.logs.open(job_id).await {
            Ok(log) => log,
            Err(e) => {
                tracing::error!(job_id, "cannot open job log: {:#}", e);
                if let Err(e) = self.store.finish(job_id, JobStatus::Failed, None).await {
                    tracing::error!(job_id, "failed to record job failure: {}", e);
                }
                return;
            }
        };

        let cancel = CancellationToken::new();
        let result = self.run_stages(job_id, &log, &cancel).await;
        self.conclude(job_id, log.as_ref(), result).await;
    }

    async fn run_stages(
        &self,
        job_id: i64,
        log: &Arc<dyn LogSink>,
        cancel: &CancellationToken,
    ) -> Result<Published, PipelineError> {
        let job = self.store.get(job_id).await?;
        if job.status.is_terminal() {
            return Err(PipelineError::AlreadyTerminal { id: job_id });
        }
        if !self.store.claim(job_id, std::process::id()).await? {
            return Err(PipelineError::AlreadyTerminal { id: job_id });
        }

        self.enter_stage(job_id, JobStatus::CheckingWallet).await?;
        self.collaborators
            .wallet
            .check(&job, log.as_ref())
            .await
            .map_err(|source| PipelineError::Collaborator {
                stage: JobStatus::CheckingWallet,
                source,
            })?;

        self.enter_stage(job_id, JobStatus::PreparingRepository).await?;
        log.info("Preparing repository").await;
        let prepared = self
            .collaborators
            .repository
            .prepare(job_id, &job.url, log.as_ref())
            .await
            .map_err(|source| PipelineError::Collaborator {
                stage: JobStatus::PreparingRepository,
                source,
            })?;

        self.enter_stage(job_id, JobStatus::AgentWorking).await?;
        log.info("Launching agent").await;
        let worker = self.collaborators.worker.build(job_id, &prepared);
        self.run_worker(job_id, &worker, log.clone(), cancel)
            .await
            .into_result()?;

        self.enter_stage(job_id, JobStatus::Publishing).await?;
        self.collaborators
            .publisher
            .publish(job_id, &job.url, &prepared, log.as_ref())
            .await
            .map_err(|source| PipelineError::Collaborator {
                stage: JobStatus::Publishing,
                source,
            })
    }

    /// Cancellation checkpoint followed by the stage's status write.
    async fn enter_stage(&self, job_id: i64, stage: JobStatus) -> Result<(), PipelineError> {
        if self.store.is_cancel_requested(job_id).await? {
            return Err(PipelineError::Cancelled);
        }
        match self.store.update_status(job_id, stage).await? {
            StatusUpdate::Applied => {
                tracing::info!(job_id, stage = %stage, "entered stage");
                Ok(())
            }
            StatusUpdate::RejectedTerminal => Err(PipelineError::AlreadyTerminal { id: job_id }),
        }
    }

    async fn run_worker(
        &self,
        job_id: i64,
        worker: &WorkerSpec,
        log: Arc<dyn LogSink>,
        cancel: &CancellationToken,
    ) -> WorkerOutcome {
        let supervisor =
            ProcessSupervisor::new(job_id, self.registry.clone(), log, self.options.grace_period);

        // A request that landed before registration is only visible in the store.
        let store = self.store.clone();
        let recheck = async move { flag_is_set(store.as_ref(), job_id).await };

        let poller = tokio::spawn(poll_cancel_flag(
            self.store.clone(),
            job_id,
            cancel.clone(),
            self.options.cancel_poll_interval,
        ));
        let outcome = supervisor.execute(worker, cancel, recheck).await;
        poller.abort();
        outcome
    }

    /// Persist the run's single terminal status and write the matching marker.
    async fn conclude(&self, job_id: i64, log: &dyn LogSink, result: Result<Published, PipelineError>) {
        let (status, pr_url, cause) = match result {
            Ok(published) => (JobStatus::Completed, Some(published.pr_url), None),
            Err(PipelineError::AlreadyTerminal { .. }) => {
                tracing::info!(job_id, "job already finished, nothing to do");
                return;
            }
            Err(PipelineError::Cancelled) => (JobStatus::Cancelled, None, None),
            Err(e) => (JobStatus::Failed, None, Some(e)),
        };

        let recorded_pr = pr_url.clone();
        let persisted = match self.store.finish(job_id, status, pr_url).await {
            Ok(persisted) => persisted,
            Err(e) => {
                tracing::error!(job_id, "failed to record terminal status {}: {}", status, e);
                log.error(&format!("{}: could not record result: {}", FAILURE_MARKER, e))
                    .await;
                return;
            }
        };

        match (persisted, cause) {
            (JobStatus::Completed, _) if status == JobStatus::Completed => {
                if let Some(pr_url) = &recorded_pr {
                    log.info_with("pull request ready", serde_json::json!({ "prUrl": pr_url }))
                        .await;
                }
                log.info(SUCCESS_MARKER).await;
                tracing::info!(job_id, pr_url = ?recorded_pr, "job completed");
            }
            (JobStatus::Cancelled, _) => {
                log.info(CANCELLED_MARKER).await;
                tracing::info!(job_id, "job cancelled");
            }
            (JobStatus::Failed, Some(cause)) => {
                log.error(&format!("{}: {}", FAILURE_MARKER, cause)).await;
                tracing::warn!(job_id, "job failed: {}", cause);
            }
            // Someone else wrote the terminal status first; their marker stands.
            (other, _) => {
                log.warn(&format!("run ended as {} but the job was already {}", status, other))
                    .await;
                tracing::warn!(
                    job_id,
                    run = %status,
                    persisted = %other,
                    "job was closed by another process"
                );
            }
        }
    }

    /// Request cancellation of a job: set the store flag, then stop its live
    /// worker if this process owns one. Safe to call repeatedly.
    pub async fn request_cancel(&self, job_id: i64) -> Result<CancelRequest, StoreError> {
        let request = self.store.set_cancel_requested(job_id).await?;
        match request {
            CancelRequest::RejectedTerminal => {
                tracing::info!(job_id, "cancel rejected, job already finished");
            }
            CancelRequest::Accepted | CancelRequest::AlreadyRequested => {
                if self.registry.cancel(job_id) {
                    tracing::info!(job_id, "signalled live worker");
                }
            }
        }
        Ok(request)
    }

    /// Close out jobs left non-terminal by a process that is gone. Jobs whose
    /// owner is still running (in this process or another) are left alone.
    pub async fn recover_interrupted(&self) -> Result<RecoveryReport, StoreError> {
        let mut report = RecoveryReport::default();
        for job in self.store.list_unfinished().await? {
            if self.registry.contains(job.id) {
                continue;
            }
            if let Some(pid) = job.owner_pid.filter(|pid| is_process_running(*pid)) {
                tracing::info!(job_id = job.id, pid, "job is still owned by a running process");
                report.running.push(job.id);
                continue;
            }
            let persisted = self.store.finish(job.id, JobStatus::Failed, None).await?;
            let marker = match persisted {
                JobStatus::Cancelled => {
                    report.cancelled.push(job.id);
                    CANCELLED_MARKER.to_string()
                }
                _ => {
                    report.failed.push(job.id);
                    format!("{}: interrupted while {}", FAILURE_MARKER, job.status)
                }
            };
            match self.logs.open(job.id).await {
                Ok(log) => log.warn(&marker).await,
                Err(e) => tracing::warn!(job_id = job.id, "cannot open job log: {:#}", e),
            }
            tracing::info!(job_id = job.id, status = %persisted, "recovered interrupted job");
        }
        Ok(report)
    }
}

async fn flag_is_set(store: &dyn JobStore, job_id: i64) -> bool {
    match store.is_cancel_requested(job_id).await {
        Ok(flag) => flag,
        Err(e) => {
            tracing::warn!(job_id, "cancel flag re-read failed: {}", e);
            false
        }
    }
}

/// Re-read the store flag until it is set or the token is cancelled. Picks up
/// requests made from another process.
async fn poll_cancel_flag(
    store: Arc<dyn JobStore>,
    job_id: i64,
    cancel: CancellationToken,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if flag_is_set(store.as_ref(), job_id).await {
            tracing::info!(job_id, "cancel flag observed while worker running");
            cancel.cancel();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::db::{DbHandle, FactoryDb};
    use crate::factory::job_log::MemoryLogs;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ISSUE: &str = "https://github.com/getAlby/lnfly/issues/11";
    const PR: &str = "https://github.com/getAlby/lnfly/pull/12";

    #[derive(Default)]
    struct Calls {
        wallet: AtomicUsize,
        prepare: AtomicUsize,
        publish: AtomicUsize,
        /// Status of the job seen by each collaborator call.
        seen: Mutex<Vec<JobStatus>>,
    }

    /// Hook run inside a collaborator call, e.g. to request cancellation.
    type Hook = Box<dyn Fn(i64) + Send + Sync>;

    struct MockWallet {
        store: DbHandle,
        calls: Arc<Calls>,
        fail: bool,
    }

    #[async_trait]
    impl WalletService for MockWallet {
        async fn check(&self, job: &Job, _log: &dyn LogSink) -> anyhow::Result<()> {
            self.calls.wallet.fetch_add(1, Ordering::SeqCst);
            let status = self.store.get(job.id).await?.status;
            self.calls.seen.lock().unwrap().push(status);
            if self.fail {
                anyhow::bail!("insufficient balance");
            }
            Ok(())
        }
    }

    struct MockRepository {
        store: DbHandle,
        calls: Arc<Calls>,
        checkout: PathBuf,
        fail: bool,
        hook: Option<Hook>,
    }

    #[async_trait]
    impl RepositoryService for MockRepository {
        async fn prepare(
            &self,
            job_id: i64,
            _issue_url: &str,
            log: &dyn LogSink,
        ) -> anyhow::Result<PreparedRepository> {
            self.calls.prepare.fetch_add(1, Ordering::SeqCst);
            let status = self.store.get(job_id).await?.status;
            self.calls.seen.lock().unwrap().push(status);
            if let Some(hook) = &self.hook {
                hook(job_id);
            }
            if self.fail {
                anyhow::bail!("clone process exited with non-success code: 128");
            }
            log.info("cloning forked repository").await;
            Ok(PreparedRepository {
                checkout_path: self.checkout.clone(),
                issue_text: "Fix the bug\n\nIt crashes".into(),
                owner: "getAlby".into(),
                repo: "lnfly".into(),
                issue_number: 11,
            })
        }
    }

    struct MockPublisher {
        store: DbHandle,
        calls: Arc<Calls>,
        hook: Option<Hook>,
    }

    #[async_trait]
    impl PublishService for MockPublisher {
        async fn publish(
            &self,
            job_id: i64,
            _issue_url: &str,
            _repository: &PreparedRepository,
            log: &dyn LogSink,
        ) -> anyhow::Result<Published> {
            self.calls.publish.fetch_add(1, Ordering::SeqCst);
            let status = self.store.get(job_id).await?.status;
            self.calls.seen.lock().unwrap().push(status);
            if let Some(hook) = &self.hook {
                hook(job_id);
            }
            log.info("successfully created pull request").await;
            Ok(Published { pr_url: PR.into() })
        }
    }

    struct Harness {
        orchestrator: JobOrchestrator,
        store: DbHandle,
        logs: Arc<MemoryLogs>,
        calls: Arc<Calls>,
        _dir: tempfile::TempDir,
    }

    #[derive(Default)]
    struct Setup {
        wallet_fails: bool,
        prepare_fails: bool,
        prepare_hook: Option<Hook>,
        publish_hook: Option<Hook>,
        program: Option<&'static str>,
        script: Option<&'static str>,
        worker_timeout: Option<Duration>,
    }

    struct ScriptWorker {
        program: &'static str,
        script: &'static str,
        timeout: Duration,
    }

    impl WorkerFactory for ScriptWorker {
        fn build(&self, _job_id: i64, repository: &PreparedRepository) -> WorkerSpec {
            WorkerSpec {
                program: self.program.into(),
                args: vec!["-c".into(), self.script.into()],
                env: vec![],
                cwd: repository.checkout_path.clone(),
                timeout: Some(self.timeout),
            }
        }
    }

    /// Build a harness; `setup` receives the store so hooks can write to it.
    fn harness_with(setup: impl FnOnce(&DbHandle) -> Setup) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = DbHandle::new(FactoryDb::new_in_memory().unwrap());
        let setup = setup(&store);
        let calls = Arc::new(Calls::default());
        let logs = Arc::new(MemoryLogs::default());
        let collaborators = Collaborators {
            wallet: Arc::new(MockWallet {
                store: store.clone(),
                calls: calls.clone(),
                fail: setup.wallet_fails,
            }),
            repository: Arc::new(MockRepository {
                store: store.clone(),
                calls: calls.clone(),
                checkout: dir.path().to_path_buf(),
                fail: setup.prepare_fails,
                hook: setup.prepare_hook,
            }),
            publisher: Arc::new(MockPublisher {
                store: store.clone(),
                calls: calls.clone(),
                hook: setup.publish_hook,
            }),
            worker: Arc::new(ScriptWorker {
                program: setup.program.unwrap_or("sh"),
                script: setup.script.unwrap_or("echo working; exit 0"),
                timeout: setup.worker_timeout.unwrap_or(Duration::from_secs(20)),
            }),
        };
        let orchestrator = JobOrchestrator::new(
            Arc::new(store.clone()),
            ProcessRegistry::new(),
            collaborators,
            logs.clone(),
            PipelineOptions {
                grace_period: Duration::from_millis(500),
                cancel_poll_interval: Duration::from_millis(50),
            },
        );
        Harness {
            orchestrator,
            store,
            logs,
            calls,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(|_| Setup::default())
    }

    /// Hook that sets the store flag directly, as another process would.
    fn flag_in_store(store: &DbHandle) -> Hook {
        let store = store.clone();
        Box::new(move |job_id| {
            store.lock_sync().unwrap().set_cancel_requested(job_id).unwrap();
        })
    }

    async fn wait_for_worker(registry: &ProcessRegistry, job_id: i64) {
        for _ in 0..250 {
            if registry.contains(job_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("worker for job {} never registered", job_id);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_happy_path_completes_with_pr_url() {
        let h = harness();
        let job = h.store.create_job(ISSUE).await.unwrap();
        h.orchestrator.run(job.id).await;

        let job = h.store.get(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.pr_url.as_deref(), Some(PR));
        assert_eq!(
            *h.calls.seen.lock().unwrap(),
            vec![
                JobStatus::CheckingWallet,
                JobStatus::PreparingRepository,
                JobStatus::Publishing
            ]
        );

        let text = h.logs.log(job.id).text();
        let prepare = text.find("Preparing repository").unwrap();
        let launch = text.find("Launching agent").unwrap();
        let spawn = text.find("Spawning sh process").unwrap();
        let done = text.find(SUCCESS_MARKER).unwrap();
        assert!(prepare < launch && launch < spawn && spawn < done);
        assert!(text.contains("working"));
        assert!(h.orchestrator.registry().is_empty());
    }

    #[tokio::test]
    async fn test_wallet_failure_fails_job_without_preparing() {
        let h = harness_with(|_| Setup {
            wallet_fails: true,
            ..Default::default()
        });
        let job = h.store.create_job(ISSUE).await.unwrap();
        h.orchestrator.run(job.id).await;

        assert_eq!(h.store.get(job.id).await.unwrap().status, JobStatus::Failed);
        assert_eq!(h.calls.prepare.load(Ordering::SeqCst), 0);
        let text = h.logs.log(job.id).text();
        assert!(
            text.contains("job failed: CHECKING_WALLET stage failed: insufficient balance"),
            "got: {}",
            text
        );
    }

    #[tokio::test]
    async fn test_prepare_failure_fails_job_before_worker() {
        let h = harness_with(|_| Setup {
            prepare_fails: true,
            ..Default::default()
        });
        let job = h.store.create_job(ISSUE).await.unwrap();
        h.orchestrator.run(job.id).await;

        assert_eq!(h.store.get(job.id).await.unwrap().status, JobStatus::Failed);
        let text = h.logs.log(job.id).text();
        assert!(!text.contains("Launching agent"));
        assert!(text.contains("job failed"));
        assert_eq!(h.calls.publish.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_start_runs_no_stage() {
        let h = harness();
        let job = h.store.create_job(ISSUE).await.unwrap();
        assert_eq!(
            h.orchestrator.request_cancel(job.id).await.unwrap(),
            CancelRequest::Accepted
        );
        h.orchestrator.run(job.id).await;

        assert_eq!(h.store.get(job.id).await.unwrap().status, JobStatus::Cancelled);
        assert_eq!(h.calls.wallet.load(Ordering::SeqCst), 0);
        assert!(h.logs.log(job.id).text().contains(CANCELLED_MARKER));
    }

    #[tokio::test]
    async fn test_cancel_during_prepare_stops_at_next_checkpoint() {
        let h = harness_with(|store| Setup {
            prepare_hook: Some(flag_in_store(store)),
            ..Default::default()
        });
        let job = h.store.create_job(ISSUE).await.unwrap();
        h.orchestrator.run(job.id).await;

        assert_eq!(h.store.get(job.id).await.unwrap().status, JobStatus::Cancelled);
        let text = h.logs.log(job.id).text();
        assert!(!text.contains("Launching agent"));
        assert!(!text.contains("Spawning"));
        assert!(text.contains(CANCELLED_MARKER));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_request_cancel_stops_running_worker() {
        let h = harness_with(|_| Setup {
            script: Some("echo started; sleep 30"),
            ..Default::default()
        });
        let job = h.store.create_job(ISSUE).await.unwrap();
        let started = std::time::Instant::now();
        let handle = h.orchestrator.spawn(job.id);
        wait_for_worker(h.orchestrator.registry(), job.id).await;

        assert_eq!(
            h.orchestrator.request_cancel(job.id).await.unwrap(),
            CancelRequest::Accepted
        );
        handle.await.unwrap();

        assert_eq!(h.store.get(job.id).await.unwrap().status, JobStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(h.calls.publish.load(Ordering::SeqCst), 0);
        assert!(h.orchestrator.registry().is_empty());
        assert!(h.logs.log(job.id).text().contains(CANCELLED_MARKER));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_flag_set_by_another_process_is_polled() {
        let h = harness_with(|_| Setup {
            script: Some("sleep 30"),
            ..Default::default()
        });
        let job = h.store.create_job(ISSUE).await.unwrap();
        let handle = h.orchestrator.spawn(job.id);
        wait_for_worker(h.orchestrator.registry(), job.id).await;

        // Bypass the orchestrator: only the store learns about the request.
        h.store.set_cancel_requested(job.id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("worker was not stopped")
            .unwrap();

        assert_eq!(h.store.get(job.id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_exit_failure_fails_job() {
        let h = harness_with(|_| Setup {
            script: Some("echo nope >&2; exit 2"),
            ..Default::default()
        });
        let job = h.store.create_job(ISSUE).await.unwrap();
        h.orchestrator.run(job.id).await;

        assert_eq!(h.store.get(job.id).await.unwrap().status, JobStatus::Failed);
        assert_eq!(h.calls.publish.load(Ordering::SeqCst), 0);
        let text = h.logs.log(job.id).text();
        assert!(text.contains("job failed: Worker process exited with non-success code 2"));
        assert!(text.contains("nope"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_timeout_fails_job() {
        let h = harness_with(|_| Setup {
            script: Some("sleep 30"),
            worker_timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let job = h.store.create_job(ISSUE).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), h.orchestrator.run(job.id))
            .await
            .expect("timed-out worker was not stopped");

        assert_eq!(h.store.get(job.id).await.unwrap().status, JobStatus::Failed);
        assert_eq!(h.calls.publish.load(Ordering::SeqCst), 0);
        assert!(h.orchestrator.registry().is_empty());
        let text = h.logs.log(job.id).text();
        assert!(
            text.contains("job failed: Worker process exceeded its time budget"),
            "got: {}",
            text
        );
    }

    #[tokio::test]
    async fn test_worker_spawn_failure_fails_job() {
        let h = harness_with(|_| Setup {
            program: Some("freepilot-missing-worker"),
            ..Default::default()
        });
        let job = h.store.create_job(ISSUE).await.unwrap();
        h.orchestrator.run(job.id).await;

        assert_eq!(h.store.get(job.id).await.unwrap().status, JobStatus::Failed);
        assert!(h.logs.log(job.id).text().contains("Failed to spawn worker process"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_during_publish_wins_but_keeps_pr_url() {
        let h = harness_with(|store| Setup {
            publish_hook: Some(flag_in_store(store)),
            ..Default::default()
        });
        let job = h.store.create_job(ISSUE).await.unwrap();
        h.orchestrator.run(job.id).await;

        let job = h.store.get(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.pr_url.as_deref(), Some(PR));
        let text = h.logs.log(job.id).text();
        assert!(text.contains(CANCELLED_MARKER));
        assert!(!text.contains(SUCCESS_MARKER));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_job_closed_elsewhere_keeps_its_result() {
        let h = harness_with(|store| {
            let store = store.clone();
            Setup {
                publish_hook: Some(Box::new(move |job_id| {
                    store
                        .lock_sync()
                        .unwrap()
                        .finish_job(job_id, &JobStatus::Failed, None)
                        .unwrap();
                })),
                ..Default::default()
            }
        });
        let job = h.store.create_job(ISSUE).await.unwrap();
        h.orchestrator.run(job.id).await;

        let job = h.store.get(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.pr_url.is_none());
        let text = h.logs.log(job.id).text();
        assert!(!text.contains(SUCCESS_MARKER));
        assert!(!text.contains(FAILURE_MARKER), "got: {}", text);
        assert!(text.contains("run ended as COMPLETED but the job was already FAILED"));
    }

    #[tokio::test]
    async fn test_request_cancel_is_idempotent_and_rejects_terminal() {
        let h = harness();
        let job = h.store.create_job(ISSUE).await.unwrap();
        assert_eq!(
            h.orchestrator.request_cancel(job.id).await.unwrap(),
            CancelRequest::Accepted
        );
        assert_eq!(
            h.orchestrator.request_cancel(job.id).await.unwrap(),
            CancelRequest::AlreadyRequested
        );

        let done = h.store.create_job(ISSUE).await.unwrap();
        h.store
            .finish(done.id, JobStatus::Completed, Some(PR.into()))
            .await
            .unwrap();
        assert_eq!(
            h.orchestrator.request_cancel(done.id).await.unwrap(),
            CancelRequest::RejectedTerminal
        );
        assert_eq!(h.store.get(done.id).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_request_cancel_for_missing_job_is_not_found() {
        let h = harness();
        let err = h.orchestrator.request_cancel(77).await.unwrap_err();
        assert!(matches!(err, StoreError::JobNotFound { id: 77 }));
    }

    #[tokio::test]
    async fn test_run_on_terminal_job_changes_nothing() {
        let h = harness();
        let job = h.store.create_job(ISSUE).await.unwrap();
        h.store.finish(job.id, JobStatus::Failed, None).await.unwrap();
        h.orchestrator.run(job.id).await;

        assert_eq!(h.store.get(job.id).await.unwrap().status, JobStatus::Failed);
        assert_eq!(h.calls.wallet.load(Ordering::SeqCst), 0);
        assert!(h.logs.log(job.id).text().is_empty());
    }

    #[tokio::test]
    async fn test_recover_interrupted_closes_orphaned_jobs() {
        let h = harness();
        let working = h.store.create_job(ISSUE).await.unwrap();
        h.store
            .update_status(working.id, JobStatus::AgentWorking)
            .await
            .unwrap();
        let cancelling = h.store.create_job(ISSUE).await.unwrap();
        h.store.set_cancel_requested(cancelling.id).await.unwrap();
        let finished = h.store.create_job(ISSUE).await.unwrap();
        h.store
            .finish(finished.id, JobStatus::Completed, Some(PR.into()))
            .await
            .unwrap();

        let report = h.orchestrator.recover_interrupted().await.unwrap();
        assert_eq!(report.failed, vec![working.id]);
        assert_eq!(report.cancelled, vec![cancelling.id]);
        assert_eq!(h.store.get(working.id).await.unwrap().status, JobStatus::Failed);
        assert_eq!(h.store.get(cancelling.id).await.unwrap().status, JobStatus::Cancelled);
        assert_eq!(h.store.get(finished.id).await.unwrap().status, JobStatus::Completed);
        assert!(
            h.logs
                .log(working.id)
                .text()
                .contains("job failed: interrupted while AGENT_WORKING")
        );
    }

    #[tokio::test]
    async fn test_run_claims_job_for_this_process() {
        let h = harness_with(|_| Setup {
            wallet_fails: true,
            ..Default::default()
        });
        let job = h.store.create_job(ISSUE).await.unwrap();
        assert_eq!(job.owner_pid, None);
        h.orchestrator.run(job.id).await;
        assert_eq!(
            h.store.get(job.id).await.unwrap().owner_pid,
            Some(std::process::id())
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_recover_from_another_orchestrator_leaves_live_job_running() {
        let h = harness_with(|_| Setup {
            script: Some("sleep 30"),
            ..Default::default()
        });
        let job = h.store.create_job(ISSUE).await.unwrap();
        let handle = h.orchestrator.spawn(job.id);
        wait_for_worker(h.orchestrator.registry(), job.id).await;

        // Same store, separate registry: what `freepilot recover` sees from
        // another terminal.
        let other = JobOrchestrator {
            registry: ProcessRegistry::new(),
            ..h.orchestrator.clone()
        };
        let report = other.recover_interrupted().await.unwrap();
        assert_eq!(report.running, vec![job.id]);
        assert!(report.failed.is_empty() && report.cancelled.is_empty());
        assert_eq!(h.store.get(job.id).await.unwrap().status, JobStatus::AgentWorking);
        assert!(h.orchestrator.registry().contains(job.id));

        h.orchestrator.request_cancel(job.id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("worker was not stopped")
            .unwrap();
        assert_eq!(h.store.get(job.id).await.unwrap().status, JobStatus::Cancelled);
        assert!(!h.logs.log(job.id).text().contains("interrupted while"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_recover_closes_job_whose_owner_exited() {
        let h = harness();
        let job = h.store.create_job(ISSUE).await.unwrap();
        h.store.update_status(job.id, JobStatus::AgentWorking).await.unwrap();

        let mut owner = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = owner.id();
        owner.wait().unwrap();
        assert!(h.store.claim(job.id, dead_pid).await.unwrap());

        let report = h.orchestrator.recover_interrupted().await.unwrap();
        assert_eq!(report.failed, vec![job.id]);
        assert!(report.running.is_empty());
        assert_eq!(h.store.get(job.id).await.unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn test_default_options() {
        let options = PipelineOptions::default();
        assert_eq!(options.grace_period, Duration::from_secs(5));
        assert_eq!(options.cancel_poll_interval, Duration::from_secs(2));
    }
}
