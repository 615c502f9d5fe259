use std::time::Duration;

use super::models::PreparedRepository;
use super::pipeline::WorkerFactory;
use super::supervisor::WorkerSpec;

pub const DEFAULT_WORKER_COMMAND: &str = "goose";
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Instructions handed to the coding agent, followed by the issue text.
pub fn build_prompt(job_id: i64, issue_text: &str) -> String {
    format!(
        "Follow the following steps in order:\n\
         \n\
         1. *Locally* checkout a new branch to address the issue. Prefix it with feat/ for \
         features or chore/ or fix/ etc based on the type of change. Suffix the branch with -{job_id}\n\
         2. *Locally* address the issue by making the relevant file changes. Don't show me the \
         code and don't try to run the app.\n\
         3. *Locally* commit the changes on the current branch with a meaningful description.\n\
         \n\
         The issue content is below:\n\
         \n\
         {issue_text}\n"
    )
}

/// Runs `goose run` with the developer toolkit in the job's checkout.
#[derive(Debug, Clone)]
pub struct GooseWorker {
    command: String,
    timeout: Option<Duration>,
}

impl GooseWorker {
    pub fn new(command: &str, timeout: Option<Duration>) -> Self {
        Self {
            command: command.to_string(),
            timeout,
        }
    }
}

impl Default for GooseWorker {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_COMMAND, Some(DEFAULT_WORKER_TIMEOUT))
    }
}

impl WorkerFactory for GooseWorker {
    fn build(&self, job_id: i64, repository: &PreparedRepository) -> WorkerSpec {
        let prompt = build_prompt(job_id, &repository.issue_text);
        tracing::debug!(job_id, program = %self.command, cwd = %repository.checkout_path.display(), "building worker command");
        WorkerSpec {
            program: self.command.clone(),
            args: vec![
                "run".to_string(),
                "--with-builtin=developer".to_string(),
                "-t".to_string(),
                prompt,
            ],
            env: vec![("GOOSE_MODE".to_string(), "auto".to_string())],
            cwd: repository.checkout_path.clone(),
            timeout: self.timeout,
        }
    }
}
