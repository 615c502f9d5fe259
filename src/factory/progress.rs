//! Log-based progress inference.
//!
//! `analyze_logs` maps the full text of a job log to a [`ProgressSummary`].
//! It keeps no state between calls, so it can be recomputed on every poll and
//! after a restart.

use std::sync::LazyLock;

use regex::Regex;

use super::models::ProgressSummary;

/// Written by the orchestrator when a job completes.
pub const SUCCESS_MARKER: &str = "Job completed! 🎉";
/// Written by the orchestrator when a job fails.
pub const FAILURE_MARKER: &str = "job failed";
/// Written by the orchestrator when a job is cancelled.
pub const CANCELLED_MARKER: &str = "Job was cancelled";

const INITIAL_STEP: &str = "Initializing";
const FINALIZING_STEP: &str = "Finalizing";
const COMPLETED_STEP: &str = "Completed";
const FAILED_STEP: &str = "Failed";
const CANCELLED_STEP: &str = "Cancelled";

/// One row of the step table.
pub struct StepRule {
    pub pattern: Regex,
    pub label: &'static str,
    pub priority: u32,
}

fn rule(pattern: &str, label: &'static str, priority: u32) -> StepRule {
    StepRule {
        // Patterns are literals from the table below; a bad one is a programming error.
        pattern: Regex::new(&format!("(?i){}", pattern)).expect("invalid step pattern"),
        label,
        priority,
    }
}

/// Step table, priorities strictly increasing in pipeline order.
pub static STEP_RULES: LazyLock<Vec<StepRule>> = LazyLock::new(|| {
    vec![
        rule("Preparing repository", "Checking out repository", 1),
        rule("extracted repository from issue URL", "Analyzing issue URL", 2),
        rule("forking repository", "Forking repository", 3),
        rule("cloning forked repository", "Cloning repository", 4),
        rule("Launching agent", "Looking at the code", 5),
        rule(r"Spawning \S+ process", "Understanding the issue", 6),
        rule("starting session.*provider:", "Starting code analysis", 7),
        rule("I'll help you.*follow.*steps", "Planning solution", 8),
        rule("checkout.*new branch", "Creating development branch", 9),
        rule("git checkout -b", "Setting up development environment", 10),
        rule("Step 2.*address.*issue", "Coding solution", 11),
        rule("Step 3.*commit.*changes", "Reviewing and committing changes", 12),
        rule("git commit", "Committing changes", 13),
        rule("getting branch name", "Preparing pull request", 14),
        rule("pushing branch", "Pushing changes", 15),
        rule("creating pull request", "Opening pull request", 16),
        rule("successfully created pull request", "Pull request created", 17),
    ]
});

static COST_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*sats").expect("invalid cost pattern"));

/// Sum of every integer immediately followed by the `sats` unit. Repeated
/// echoes of the same charge are summed again.
pub fn total_cost(logs: &str) -> u64 {
    COST_PATTERN
        .captures_iter(logs)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u64>().ok())
        .fold(0u64, |total, amount| total.saturating_add(amount))
}

/// Derive a progress summary from the accumulated log text.
pub fn analyze_logs(logs: &str) -> ProgressSummary {
    let rules = &*STEP_RULES;

    // First matching rule per line.
    let mut observed: Vec<&StepRule> = Vec::new();
    for line in logs.lines() {
        if let Some(rule) = rules.iter().find(|r| r.pattern.is_match(line))
            && !observed.iter().any(|o| o.label == rule.label)
        {
            observed.push(rule);
        }
    }
    observed.sort_by_key(|r| r.priority);

    let mut completed_steps: Vec<String> = observed.iter().map(|r| r.label.to_string()).collect();

    let final_rule = rules.last();
    let mut current_step = match observed.last() {
        None => INITIAL_STEP.to_string(),
        Some(last) if final_rule.is_some_and(|f| last.priority >= f.priority) => {
            COMPLETED_STEP.to_string()
        }
        Some(last) => rules
            .iter()
            .find(|r| r.priority > last.priority)
            .map(|r| r.label.to_string())
            .unwrap_or_else(|| FINALIZING_STEP.to_string()),
    };

    if logs.contains(SUCCESS_MARKER) {
        current_step = COMPLETED_STEP.to_string();
        if let Some(final_rule) = final_rule
            && !completed_steps.iter().any(|s| s == final_rule.label)
        {
            completed_steps.push(final_rule.label.to_string());
        }
    } else if logs.contains(FAILURE_MARKER) {
        current_step = FAILED_STEP.to_string();
    } else if logs.contains(CANCELLED_MARKER) {
        current_step = CANCELLED_STEP.to_string();
    }

    ProgressSummary {
        current_step,
        completed_steps,
        total_cost: total_cost(logs),
    }
}
