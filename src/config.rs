use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::factory::agent::{DEFAULT_WORKER_COMMAND, DEFAULT_WORKER_TIMEOUT};
use crate::factory::cleanup::DEFAULT_MAX_AGE;
use crate::factory::github::DEFAULT_API_BASE;
use crate::factory::pipeline::{DEFAULT_CANCEL_POLL_INTERVAL, PipelineOptions};
use crate::factory::supervisor::DEFAULT_GRACE_PERIOD;

pub const CONFIG_FILE_NAME: &str = "freepilot.toml";
pub const DATABASE_FILE_NAME: &str = "freepilot.db";
pub const DEFAULT_BOT_USERNAME: &str = "freepilot-bot";
pub const DEFAULT_PUBLIC_URL: &str = "https://freepilot.albylabs.com";

/// Runtime configuration for freepilot.
///
/// Layered, later sources winning: built-in defaults, then `freepilot.toml`
/// (explicit `--config` path or the one in the work directory), then
/// environment variables, then CLI flags.
#[derive(Debug, Clone, PartialEq)]
pub struct FreepilotConfig {
    pub work_dir: PathBuf,
    pub database_path: PathBuf,
    pub worker_command: String,
    /// `None` disables the worker time limit.
    pub worker_timeout: Option<Duration>,
    pub grace_period: Duration,
    pub cancel_poll_interval: Duration,
    pub cleanup_max_age: Duration,
    /// Run stale checkout cleanup before each `run`.
    pub cleanup_before_run: bool,
    pub github_token: Option<String>,
    pub bot_username: String,
    pub api_base: String,
    pub public_url: String,
}

impl Default for FreepilotConfig {
    fn default() -> Self {
        let work_dir = PathBuf::from(".");
        Self {
            database_path: work_dir.join(DATABASE_FILE_NAME),
            work_dir,
            worker_command: DEFAULT_WORKER_COMMAND.to_string(),
            worker_timeout: Some(DEFAULT_WORKER_TIMEOUT),
            grace_period: DEFAULT_GRACE_PERIOD,
            cancel_poll_interval: DEFAULT_CANCEL_POLL_INTERVAL,
            cleanup_max_age: DEFAULT_MAX_AGE,
            cleanup_before_run: true,
            github_token: None,
            bot_username: DEFAULT_BOT_USERNAME.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            public_url: DEFAULT_PUBLIC_URL.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    paths: Option<PathsSection>,
    worker: Option<WorkerSection>,
    pipeline: Option<PipelineSection>,
    github: Option<GitHubSection>,
    cleanup: Option<CleanupSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PathsSection {
    work_dir: Option<PathBuf>,
    database: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkerSection {
    command: Option<String>,
    /// 0 disables the limit.
    timeout_secs: Option<u64>,
    grace_period_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineSection {
    cancel_poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GitHubSection {
    token: Option<String>,
    bot_username: Option<String>,
    api_base: Option<String>,
    public_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CleanupSection {
    max_age_secs: Option<u64>,
    before_run: Option<bool>,
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
}

impl FreepilotConfig {
    /// Load configuration from the process environment and the config file.
    pub fn load(cli: &CliOverrides) -> Result<Self> {
        Self::load_with_env(cli, |key| std::env::var(key).ok())
    }

    /// Like [`FreepilotConfig::load`] with an explicit environment lookup.
    pub fn load_with_env(cli: &CliOverrides, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let base_dir = cli
            .work_dir
            .clone()
            .or_else(|| env("WORK_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));

        let mut config = Self {
            work_dir: base_dir.clone(),
            ..Self::default()
        };
        let mut database: Option<PathBuf> = None;

        let config_path = match &cli.config_path {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file {} does not exist", path.display());
                }
                Some(path.clone())
            }
            None => Some(base_dir.join(CONFIG_FILE_NAME)).filter(|p| p.exists()),
        };
        if let Some(path) = config_path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let toml: ConfigToml = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            database = config.apply_file(toml);
            tracing::debug!(path = %path.display(), "loaded config file");
        }

        config.apply_env(&env);

        if let Some(work_dir) = &cli.work_dir {
            config.work_dir = work_dir.clone();
        }

        config.database_path = match database {
            Some(path) if path.is_absolute() => path,
            Some(path) => config.work_dir.join(path),
            None => config.work_dir.join(DATABASE_FILE_NAME),
        };

        config.validate()?;
        Ok(config)
    }

    /// Apply file values; returns the configured database path, if any.
    fn apply_file(&mut self, toml: ConfigToml) -> Option<PathBuf> {
        let mut database = None;
        if let Some(paths) = toml.paths {
            if let Some(work_dir) = paths.work_dir {
                self.work_dir = work_dir;
            }
            database = paths.database;
        }
        if let Some(worker) = toml.worker {
            if let Some(command) = worker.command {
                self.worker_command = command;
            }
            if let Some(secs) = worker.timeout_secs {
                self.worker_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            if let Some(secs) = worker.grace_period_secs {
                self.grace_period = Duration::from_secs(secs);
            }
        }
        if let Some(pipeline) = toml.pipeline
            && let Some(ms) = pipeline.cancel_poll_interval_ms
        {
            self.cancel_poll_interval = Duration::from_millis(ms);
        }
        if let Some(github) = toml.github {
            if let Some(token) = github.token {
                self.github_token = Some(token);
            }
            if let Some(bot) = github.bot_username {
                self.bot_username = bot;
            }
            if let Some(api_base) = github.api_base {
                self.api_base = api_base;
            }
            if let Some(public_url) = github.public_url {
                self.public_url = public_url;
            }
        }
        if let Some(cleanup) = toml.cleanup {
            if let Some(secs) = cleanup.max_age_secs {
                self.cleanup_max_age = Duration::from_secs(secs);
            }
            if let Some(before_run) = cleanup.before_run {
                self.cleanup_before_run = before_run;
            }
        }
        database
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        if let Some(dir) = non_empty("WORK_DIR") {
            self.work_dir = PathBuf::from(dir);
        }
        if let Some(token) = non_empty("GITHUB_TOKEN") {
            self.github_token = Some(token);
        }
        if let Some(bot) = non_empty("GITHUB_BOT_USERNAME") {
            self.bot_username = bot;
        }
        if let Some(cmd) = non_empty("GOOSE_CMD") {
            self.worker_command = cmd;
        }
        if let Some(url) = non_empty("FREEPILOT_PUBLIC_URL") {
            self.public_url = url;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.worker_command.trim().is_empty() {
            anyhow::bail!("worker.command must not be empty");
        }
        if self.bot_username.trim().is_empty() {
            anyhow::bail!("github.bot_username must not be empty");
        }
        if self.cancel_poll_interval.is_zero() {
            anyhow::bail!("pipeline.cancel_poll_interval_ms must be greater than 0");
        }
        Ok(())
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            grace_period: self.grace_period,
            cancel_poll_interval: self.cancel_poll_interval,
        }
    }

    pub fn config_file_in(dir: &Path) -> PathBuf {
        dir.join(CONFIG_FILE_NAME)
    }
}

/// Starter `freepilot.toml` written by `freepilot init`.
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# freepilot configuration. Every key is optional.

[worker]
command = "goose"
timeout_secs = 600
grace_period_secs = 5

[pipeline]
cancel_poll_interval_ms = 2000

[github]
bot_username = "freepilot-bot"
api_base = "https://api.github.com"
public_url = "https://freepilot.albylabs.com"

[cleanup]
max_age_secs = 3600
before_run = true
"#;
