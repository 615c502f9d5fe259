use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Pipeline state of a job. Serialized with the exact strings exposed to
/// external callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Initializing,
    CheckingWallet,
    PreparingRepository,
    AgentWorking,
    Publishing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::CheckingWallet => "CHECKING_WALLET",
            Self::PreparingRepository => "PREPARING_REPOSITORY",
            Self::AgentWorking => "AGENT_WORKING",
            Self::Publishing => "PUBLISHING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Position along the pipeline; terminal states share the last slot.
    pub fn stage_index(&self) -> usize {
        match self {
            Self::Initializing => 0,
            Self::CheckingWallet => 1,
            Self::PreparingRepository => 2,
            Self::AgentWorking => 3,
            Self::Publishing => 4,
            Self::Completed | Self::Failed | Self::Cancelled => 5,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIALIZING" => Ok(Self::Initializing),
            "CHECKING_WALLET" => Ok(Self::CheckingWallet),
            "PREPARING_REPOSITORY" => Ok(Self::PreparingRepository),
            "AGENT_WORKING" => Ok(Self::AgentWorking),
            "PUBLISHING" => Ok(Self::Publishing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Validate that a job status transition is allowed: forward along the
/// pipeline, or from any non-terminal state into a terminal one.
pub fn is_valid_transition(from: &JobStatus, to: &JobStatus) -> bool {
    if from.is_terminal() {
        return false;
    }
    if to.is_terminal() {
        return true;
    }
    to.stage_index() > from.stage_index()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: i64,
    pub url: String,
    pub status: JobStatus,
    pub cancel_requested: bool,
    pub pr_url: Option<String>,
    pub cleaned_up: bool,
    /// Pid of the process running the pipeline, once it has started.
    pub owner_pid: Option<u32>,
    pub created_at: String,
    pub updated_at: String,
}

/// Coarse, human-readable progress derived from a job log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    pub current_step: String,
    pub completed_steps: Vec<String>,
    pub total_cost: u64,
}

/// Result of the repository preparation stage.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRepository {
    pub checkout_path: PathBuf,
    pub issue_text: String,
    pub owner: String,
    pub repo: String,
    pub issue_number: u64,
}

/// Artifact of the publish stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub pr_url: String,
}

/// Outcome of a conditional status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Applied,
    RejectedTerminal,
}

/// Outcome of a cancellation request against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelRequest {
    Accepted,
    AlreadyRequested,
    RejectedTerminal,
}
