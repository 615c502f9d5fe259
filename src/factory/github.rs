use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::job_log::{LogSink, job_dir};
use super::models::{PreparedRepository, Published};
use super::pipeline::{PublishService, RepositoryService};
use crate::errors::GitHubError;

pub const DEFAULT_API_BASE: &str = "https://api.github.com";

const USER_AGENT: &str = "freepilot";
const PR_TITLE_PREFIX: &str = "[Freepilot]";

static PULL_REQUEST_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"github\.com/([^/]+)/([^/]+)/pull/(\d+)").expect("invalid pull request pattern")
});

/// Repository and issue number named by an issue URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRef {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

/// Parse `https://github.com/<owner>/<repo>/issues/<n>`. Trailing query,
/// fragment or path segments after the number are ignored.
pub fn parse_issue_url(url: &str) -> Result<IssueRef, GitHubError> {
    let invalid = |reason: &str| GitHubError::InvalidIssueUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let idx = url.find("/issues/").ok_or_else(|| invalid("missing /issues/ segment"))?;
    let repo_url = url[..idx].trim_end_matches('/');
    let mut parts = repo_url.rsplit('/');
    let repo = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| invalid("missing repository"))?;
    let owner = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| invalid("missing owner"))?;

    let rest = &url[idx + "/issues/".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let number = digits
        .parse::<u64>()
        .map_err(|_| invalid("issue number is not a positive integer"))?;

    Ok(IssueRef {
        owner: owner.to_string(),
        repo: repo.to_string(),
        number,
    })
}

/// Owner, repository and number of a pull request URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestRef {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

pub fn parse_pull_request_url(url: &str) -> Result<PullRequestRef, GitHubError> {
    let caps = PULL_REQUEST_URL
        .captures(url)
        .ok_or_else(|| GitHubError::InvalidPullRequestUrl(url.to_string()))?;
    let number = caps[3]
        .parse()
        .map_err(|_| GitHubError::InvalidPullRequestUrl(url.to_string()))?;
    Ok(PullRequestRef {
        owner: caps[1].to_string(),
        repo: caps[2].to_string(),
        number,
    })
}

/// Title derived from the worker's branch name:
/// `fix/empty-title-42` becomes `[Freepilot] fix: empty title`.
pub fn pull_request_title(branch: &str) -> String {
    // Drop the `-<job id>` suffix the worker adds.
    let base = match branch.rfind('-') {
        Some(idx) => &branch[..idx],
        None => branch,
    };
    let title = base.replacen('/', ": ", 1).replace('-', " ");
    format!("{} {}", PR_TITLE_PREFIX, title)
}

pub fn pull_request_body(issue_url: &str, branch_logs: &str, public_url: &str, job_id: i64) -> String {
    format!(
        "Fixes {}\n\n{}\n\nView job on Freepilot: {}/jobs/{}",
        issue_url,
        branch_logs,
        public_url.trim_end_matches('/'),
        job_id
    )
}

// ── REST client ───────────────────────────────────────────────────────

/// A GitHub repository (subset of fields we care about).
#[derive(Debug, Deserialize)]
pub struct GitHubRepo {
    pub name: String,
    pub default_branch: String,
}

/// A GitHub issue (subset of fields).
#[derive(Debug, Deserialize)]
pub struct GitHubIssue {
    pub title: String,
    pub body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    html_url: String,
    #[serde(default)]
    merged: bool,
}

#[derive(Debug, Deserialize)]
struct MergeUpstreamResponse {
    message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NewPullRequest {
    pub title: String,
    pub head: String,
    pub base: String,
    pub body: String,
    pub maintainer_can_modify: bool,
}

#[derive(Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl GitHubClient {
    pub fn new(api_base: &str, token: &str) -> Result<Self, GitHubError> {
        if token.trim().is_empty() {
            return Err(GitHubError::MissingToken);
        }
        Ok(Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_base, path))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
    }

    async fn send<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder, endpoint: &str) -> Result<T> {
        let resp = req
            .send()
            .await
            .with_context(|| format!("Failed to send request to GitHub {}", endpoint))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GitHubError::Api {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            }
            .into());
        }
        resp.json::<T>()
            .await
            .with_context(|| format!("Failed to parse GitHub response from {}", endpoint))
    }

    pub async fn create_fork(&self, owner: &str, repo: &str) -> Result<()> {
        let endpoint = format!("/repos/{}/{}/forks", owner, repo);
        let _: serde_json::Value = self
            .send(
                self.request(reqwest::Method::POST, &endpoint).json(&json!({})),
                &endpoint,
            )
            .await?;
        Ok(())
    }

    pub async fn get_repository(&self, owner: &str, repo: &str) -> Result<GitHubRepo> {
        let endpoint = format!("/repos/{}/{}", owner, repo);
        self.send(self.request(reqwest::Method::GET, &endpoint), &endpoint)
            .await
    }

    /// Sync a fork's branch with its upstream. Returns GitHub's status message.
    pub async fn merge_upstream(&self, owner: &str, repo: &str, branch: &str) -> Result<Option<String>> {
        let endpoint = format!("/repos/{}/{}/merge-upstream", owner, repo);
        let resp: MergeUpstreamResponse = self
            .send(
                self.request(reqwest::Method::POST, &endpoint)
                    .json(&json!({ "branch": branch })),
                &endpoint,
            )
            .await?;
        Ok(resp.message)
    }

    pub async fn get_issue(&self, owner: &str, repo: &str, number: u64) -> Result<GitHubIssue> {
        let endpoint = format!("/repos/{}/{}/issues/{}", owner, repo, number);
        self.send(self.request(reqwest::Method::GET, &endpoint), &endpoint)
            .await
    }

    /// Open a pull request and return its HTML URL.
    pub async fn create_pull_request(&self, owner: &str, repo: &str, pr: &NewPullRequest) -> Result<String> {
        let endpoint = format!("/repos/{}/{}/pulls", owner, repo);
        let resp: PullRequestResponse = self
            .send(self.request(reqwest::Method::POST, &endpoint).json(pr), &endpoint)
            .await?;
        Ok(resp.html_url)
    }

    pub async fn is_pull_request_merged(&self, pr_url: &str) -> Result<bool> {
        let pr = parse_pull_request_url(pr_url)?;
        let endpoint = format!("/repos/{}/{}/pulls/{}", pr.owner, pr.repo, pr.number);
        let resp: PullRequestResponse = self
            .send(self.request(reqwest::Method::GET, &endpoint), &endpoint)
            .await?;
        Ok(resp.merged)
    }
}

/// Run git in `cwd` and return its stdout.
async fn git(args: &[&str], cwd: &Path) -> Result<String> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("Failed to run git {}", args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "git {} exited with non-success code {}: {}",
            args.first().copied().unwrap_or_default(),
            output.status.code().unwrap_or(-1),
            stderr.trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

// ── Collaborators ─────────────────────────────────────────────────────

/// Forks the upstream repository into the bot account, syncs it and clones it
/// into the job directory.
pub struct GitHubRepositoryService {
    client: GitHubClient,
    bot_username: String,
    work_dir: PathBuf,
}

impl GitHubRepositoryService {
    pub fn new(client: GitHubClient, bot_username: &str, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            bot_username: bot_username.to_string(),
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl RepositoryService for GitHubRepositoryService {
    async fn prepare(&self, job_id: i64, issue_url: &str, log: &dyn LogSink) -> Result<PreparedRepository> {
        let issue = parse_issue_url(issue_url)?;
        log.info_with(
            "extracted repository from issue URL",
            json!({ "repo": issue.repo, "owner": issue.owner, "issueNumber": issue.number }),
        )
        .await;

        log.info_with(
            "forking repository",
            json!({ "repo": issue.repo, "owner": issue.owner }),
        )
        .await;
        // An existing fork makes this fail; the sync below decides.
        if let Err(e) = self.client.create_fork(&issue.owner, &issue.repo).await {
            log.error(&format!("Failed to fork repo: {:#}", e)).await;
        }

        log.info("getting upstream repository data").await;
        let upstream = self.client.get_repository(&issue.owner, &issue.repo).await?;

        log.info("ensuring fork is up to date").await;
        match self
            .client
            .merge_upstream(&self.bot_username, &issue.repo, &upstream.default_branch)
            .await
        {
            Ok(message) => log.info_with("Synced fork", json!({ "message": message })).await,
            Err(e) => {
                log.error(&format!("Failed to update fork: {:#}", e)).await;
                return Err(e.context("Failed to update fork"));
            }
        }

        log.info_with(
            "cloning forked repository",
            json!({ "repo": issue.repo, "owner": self.bot_username }),
        )
        .await;
        let dir = job_dir(&self.work_dir, job_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let clone_url = format!("git@github.com:{}/{}.git", self.bot_username, issue.repo);
        git(&["clone", &clone_url], &dir).await?;

        let fetched = self
            .client
            .get_issue(&issue.owner, &issue.repo, issue.number)
            .await?;
        let body = fetched.body.unwrap_or_default();
        if body.trim().is_empty() {
            log.warn("The issue has no description. Add a description for better results.")
                .await;
        }

        Ok(PreparedRepository {
            checkout_path: dir.join(&issue.repo),
            issue_text: format!("{}\n\n{}", fetched.title, body),
            owner: issue.owner,
            repo: issue.repo,
            issue_number: issue.number,
        })
    }
}

/// Pushes the worker's branch to the fork and opens a pull request upstream.
pub struct GitHubPublishService {
    client: GitHubClient,
    bot_username: String,
    public_url: String,
}

impl GitHubPublishService {
    pub fn new(client: GitHubClient, bot_username: &str, public_url: &str) -> Self {
        Self {
            client,
            bot_username: bot_username.to_string(),
            public_url: public_url.to_string(),
        }
    }
}

#[async_trait]
impl PublishService for GitHubPublishService {
    async fn publish(
        &self,
        job_id: i64,
        issue_url: &str,
        repository: &PreparedRepository,
        log: &dyn LogSink,
    ) -> Result<Published> {
        let cwd = repository.checkout_path.as_path();

        log.info("getting branch name").await;
        let branch = git(&["rev-parse", "--abbrev-ref", "HEAD"], cwd)
            .await?
            .trim()
            .to_string();
        log.info_with("got branch name", json!({ "branchName": branch }))
            .await;

        log.info("pushing branch").await;
        git(&["push", "-u", "origin", "HEAD"], cwd).await?;

        log.info("getting upstream repository data").await;
        let upstream = self
            .client
            .get_repository(&repository.owner, &repository.repo)
            .await?;

        log.info("getting branch logs").await;
        let range = format!("{}..HEAD", upstream.default_branch);
        let branch_logs = git(&["--no-pager", "log", &range], cwd).await?;

        let pr = NewPullRequest {
            title: pull_request_title(&branch),
            head: format!("{}:{}", self.bot_username, branch),
            base: upstream.default_branch.clone(),
            body: pull_request_body(issue_url, &branch_logs, &self.public_url, job_id),
            maintainer_can_modify: true,
        };
        log.info_with(
            "creating pull request",
            json!({ "title": pr.title, "head": pr.head, "base": pr.base }),
        )
        .await;

        match self
            .client
            .create_pull_request(&repository.owner, &repository.repo, &pr)
            .await
        {
            Ok(pr_url) => {
                log.info("successfully created pull request").await;
                Ok(Published { pr_url })
            }
            Err(e) => {
                log.error("failed to create pull request").await;
                Err(e)
            }
        }
    }
}
