//! Worker process supervision.
//!
//! A [`ProcessSupervisor`] owns exactly one worker process per `execute` call:
//! it spawns the command, streams its output into the job log, and stops it on
//! cancellation or timeout with a graceful-then-forceful escalation. Live
//! processes are tracked in a [`ProcessRegistry`] so a cancellation request can
//! reach the run that owns them.

use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use dashmap::DashMap;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::job_log::LogSink;
use crate::errors::{PipelineError, WorkerFailure};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long output pumps may keep draining after the process is gone. A
/// grandchild that inherited the pipes must not hold the run open.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8192;

/// Upper bound on an unfinished escape sequence held back between reads.
const MAX_HELD_ESCAPE: usize = 256;

/// CSI, OSC (BEL or ST terminated), DCS/SOS/PM/APC strings, charset
/// designations and the remaining two-byte escapes. Alternation order matters.
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\x1B(?:\[[0-?]*[ -/]*[@-~]|\][^\x07\x1B]*(?:\x07|\x1B\\)|[PX^_][^\x1B]*\x1B\\|[ -/]+[0-~]|[0-~])",
    )
    .expect("invalid ANSI pattern")
});

/// An escape sequence cut off at the end of the text.
static PARTIAL_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1B(?:\[[0-?]*[ -/]*|\][^\x07\x1B]*\x1B?|[PX^_][^\x1B]*\x1B?|[ -/]+)?\z")
        .expect("invalid partial ANSI pattern")
});

/// Remove ANSI control sequences (colors, cursor movement, window titles,
/// hyperlinks, charset switches).
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Turns raw pipe reads into log text. Bytes of a UTF-8 character split across
/// reads are held until the rest arrives; with `strip` set, so is an escape
/// sequence split across reads.
#[derive(Debug)]
struct OutputDecoder {
    strip: bool,
    pending: Vec<u8>,
}

impl OutputDecoder {
    fn new(strip: bool) -> Self {
        Self {
            strip,
            pending: Vec::new(),
        }
    }

    /// Text that is complete after this read, if any.
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let split = complete_utf8_len(&self.pending);
        let rest = self.pending.split_off(split);
        let mut text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;

        if self.strip {
            if let Some(start) = PARTIAL_ESCAPE.find(&text).map(|m| m.start()) {
                if text.len() - start <= MAX_HELD_ESCAPE {
                    let mut held = text.split_off(start).into_bytes();
                    held.append(&mut self.pending);
                    self.pending = held;
                }
            }
            text = strip_ansi(&text);
        }
        (!text.is_empty()).then_some(text)
    }

    /// Whatever is still held once the pipe is closed.
    fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        let text = if self.strip { strip_ansi(&text) } else { text };
        (!text.is_empty()).then_some(text)
    }
}

/// Length of `bytes` without a trailing, still incomplete UTF-8 character.
fn complete_utf8_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { len - back } else { len };
    }
    len
}

/// A fully resolved worker command line.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    pub timeout: Option<Duration>,
}

/// How a supervised run ended. Exactly one per `execute` call.
#[derive(Debug)]
pub enum WorkerOutcome {
    Success,
    ExitFailure { code: i32 },
    Cancelled,
    TimedOut,
    SpawnFailure { cause: std::io::Error },
}

impl WorkerOutcome {
    pub fn into_result(self) -> Result<(), PipelineError> {
        match self {
            Self::Success => Ok(()),
            Self::Cancelled => Err(PipelineError::Cancelled),
            Self::ExitFailure { code } => Err(WorkerFailure::Exit { code }.into()),
            Self::TimedOut => Err(WorkerFailure::TimedOut.into()),
            Self::SpawnFailure { cause } => Err(WorkerFailure::Spawn(cause).into()),
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RegisteredProcess {
    pub token: CancellationToken,
    pub pid: Option<u32>,
    generation: u64,
}

/// Job id → live worker process. Cloning shares the same map.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<DashMap<i64, RegisteredProcess>>,
    next_generation: Arc<AtomicU64>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a live process. The entry is removed when the returned guard is
    /// dropped, whichever way the run ends.
    pub fn register(&self, job_id: i64, token: CancellationToken, pid: Option<u32>) -> Registration {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.inner.insert(
            job_id,
            RegisteredProcess {
                token,
                pid,
                generation,
            },
        );
        Registration {
            registry: self.clone(),
            job_id,
            generation,
        }
    }

    /// Cancel the live process of a job, if any. Returns whether one was found.
    pub fn cancel(&self, job_id: i64) -> bool {
        // Clone the token out so no shard lock is held while cancelling.
        let token = self.inner.get(&job_id).map(|entry| entry.token.clone());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, job_id: i64) -> bool {
        self.inner.contains_key(&job_id)
    }

    pub fn pid(&self, job_id: i64) -> Option<u32> {
        self.inner.get(&job_id).and_then(|entry| entry.pid)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Guard returned by [`ProcessRegistry::register`].
pub struct Registration {
    registry: ProcessRegistry,
    job_id: i64,
    generation: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let generation = self.generation;
        self.registry
            .inner
            .remove_if(&self.job_id, |_, entry| entry.generation == generation);
    }
}

// ── Supervisor ────────────────────────────────────────────────────────

enum Stop {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut,
}

pub struct ProcessSupervisor {
    job_id: i64,
    registry: ProcessRegistry,
    log: Arc<dyn LogSink>,
    grace_period: Duration,
    force_kills: AtomicU32,
}

impl ProcessSupervisor {
    pub fn new(
        job_id: i64,
        registry: ProcessRegistry,
        log: Arc<dyn LogSink>,
        grace_period: Duration,
    ) -> Self {
        Self {
            job_id,
            registry,
            log,
            grace_period,
            force_kills: AtomicU32::new(0),
        }
    }

    /// Number of forceful kills sent by this supervisor.
    pub fn force_kill_count(&self) -> u32 {
        self.force_kills.load(Ordering::SeqCst)
    }

    /// Run the worker to completion, cancellation or timeout.
    ///
    /// `after_register` is awaited right after the process is registered; if
    /// it resolves to `true` the run is cancelled. Callers use it to re-read a
    /// cancellation flag that may have been set before registration.
    pub async fn execute<F>(
        &self,
        worker: &WorkerSpec,
        cancel: &CancellationToken,
        after_register: F,
    ) -> WorkerOutcome
    where
        F: Future<Output = bool>,
    {
        if cancel.is_cancelled() {
            tracing::info!(job_id = self.job_id, "cancelled before worker spawn");
            return WorkerOutcome::Cancelled;
        }

        self.log
            .info(&format!("Spawning {} process", worker.program))
            .await;

        let mut cmd = Command::new(&worker.program);
        cmd.args(&worker.args)
            .envs(worker.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&worker.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(cause) => {
                self.log
                    .error(&format!("Failed to spawn {}: {}", worker.program, cause))
                    .await;
                tracing::error!(job_id = self.job_id, program = %worker.program, "spawn failed: {}", cause);
                return WorkerOutcome::SpawnFailure { cause };
            }
        };
        let pid = child.id();
        tracing::info!(job_id = self.job_id, pid, program = %worker.program, "worker process started");

        let _registration = self.registry.register(self.job_id, cancel.clone(), pid);
        if after_register.await {
            cancel.cancel();
        }

        let pumps = [
            child
                .stdout
                .take()
                .map(|out| spawn_pump(out, self.log.clone(), true)),
            child
                .stderr
                .take()
                .map(|err| spawn_pump(err, self.log.clone(), false)),
        ];

        let deadline = async {
            match worker.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        // Checked in order so a pending cancellation wins over a ready exit.
        let stop = tokio::select! {
            biased;
            _ = cancel.cancelled() => Stop::Cancelled,
            _ = &mut deadline => Stop::TimedOut,
            status = child.wait() => Stop::Exited(status),
        };

        let outcome = match stop {
            Stop::Exited(Ok(status)) => classify_exit(status),
            Stop::Exited(Err(e)) => {
                tracing::error!(job_id = self.job_id, "failed to wait for worker: {}", e);
                WorkerOutcome::ExitFailure { code: -1 }
            }
            Stop::Cancelled => {
                self.log.info("Stopping worker process: cancellation requested").await;
                self.terminate(&mut child).await;
                WorkerOutcome::Cancelled
            }
            Stop::TimedOut => {
                self.log.error("Worker process exceeded its time budget").await;
                self.terminate(&mut child).await;
                WorkerOutcome::TimedOut
            }
        };

        for pump in pumps.into_iter().flatten() {
            drain(pump).await;
        }

        if let WorkerOutcome::ExitFailure { code } = &outcome {
            self.log
                .error(&format!("{} process exited with non-success code {}", worker.program, code))
                .await;
        }
        tracing::info!(job_id = self.job_id, outcome = ?outcome, "worker finished");
        outcome
    }

    /// Graceful stop, then one forceful kill if the grace period runs out.
    async fn terminate(&self, child: &mut Child) {
        if !is_alive(child) {
            return;
        }
        send_signal(child, Signal::Terminate);

        if tokio::time::timeout(self.grace_period, child.wait()).await.is_ok() {
            return;
        }
        if is_alive(child) {
            tracing::warn!(job_id = self.job_id, "worker ignored termination, killing it");
            send_signal(child, Signal::Kill);
            self.force_kills.fetch_add(1, Ordering::SeqCst);
            self.log.warn("Worker process did not stop in time; killed").await;
        }
        if let Err(e) = child.wait().await {
            tracing::warn!(job_id = self.job_id, "failed to reap worker: {}", e);
        }
    }
}

fn is_alive(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

#[derive(Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn send_signal(child: &mut Child, signal: Signal) {
    let Some(pid) = child.id() else {
        return;
    };
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // The worker leads its own process group; signal the whole group.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signo) };
    if rc != 0 {
        tracing::debug!(pid, signo, "signal delivery failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn send_signal(child: &mut Child, _signal: Signal) {
    if let Err(e) = child.start_kill() {
        tracing::debug!("failed to kill worker: {}", e);
    }
}

/// Whether a process with this pid still exists. `EPERM` means it exists
/// under another user.
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Liveness cannot be checked here; treat the owner as running.
#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    true
}

fn classify_exit(status: ExitStatus) -> WorkerOutcome {
    if status.success() {
        return WorkerOutcome::Success;
    }
    if let Some(code) = status.code() {
        return WorkerOutcome::ExitFailure { code };
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return WorkerOutcome::ExitFailure { code: 128 + signal };
        }
    }
    WorkerOutcome::ExitFailure { code: -1 }
}

/// Forward a pipe to the log chunk by chunk as data arrives. Stdout is
/// stripped of control sequences and logged at info; stderr is logged verbatim
/// at error. Neither splits a character across two records.
fn spawn_pump<R>(mut reader: R, log: Arc<dyn LogSink>, is_stdout: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        let mut decoder = OutputDecoder::new(is_stdout);
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("worker pipe read failed: {}", e);
                    break;
                }
            };
            if let Some(text) = decoder.push(&buf[..n]) {
                emit(log.as_ref(), is_stdout, &text).await;
            }
        }
        if let Some(text) = decoder.finish() {
            emit(log.as_ref(), is_stdout, &text).await;
        }
    })
}

async fn emit(log: &dyn LogSink, is_stdout: bool, text: &str) {
    if is_stdout {
        log.info(text).await;
    } else {
        log.error(text).await;
    }
}

async fn drain(mut pump: JoinHandle<()>) {
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut pump).await.is_err() {
        pump.abort();
    }
}
