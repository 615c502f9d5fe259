//! Job factory: turns a GitHub issue into a pull request by driving a coding
//! agent through a fixed pipeline.
//!
//! ## Module Map
//!
//! ```text
//!  freepilot run ──> pipeline.rs  (JobOrchestrator)
//!                      │  CHECKING_WALLET      WalletService
//!                      │  PREPARING_REPOSITORY RepositoryService ── github.rs
//!                      │  AGENT_WORKING        WorkerFactory ── agent.rs
//!                      │        │
//!                      │        v
//!                      │  supervisor.rs  (ProcessSupervisor, ProcessRegistry)
//!                      │        │ stdout/stderr ──> job_log.rs (log.txt)
//!                      │  PUBLISHING           PublishService ── github.rs
//!                      v
//!                   store.rs  (JobStore) ── db.rs (SQLite)
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                          |
//! |------------|---------------------------------------------------------|
//! | `models`   | `Job`, `JobStatus` and stage transition rules           |
//! | `progress` | Log markers and `analyze_logs()` progress summaries     |
//! | `cleanup`  | Deletes checkouts of finished jobs past a max age       |
//! | `stats`    | Earnings, token and merged-PR totals over completed jobs|
//!
//! ## Cancellation
//!
//! `JobOrchestrator::request_cancel` sets the persisted flag, then cancels the
//! live worker through the registry. The flag is checked before every stage
//! and re-read right after the worker registers, and polled while it runs, so
//! a request from another process still stops the job.

pub mod agent;
pub mod cleanup;
pub mod db;
pub mod github;
pub mod job_log;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod stats;
pub mod store;
pub mod supervisor;
