//! Forge REST/GraphQL sessions and pull-request operations.
//!
//! Hand-rolled typed response structs over `reqwest`; only the fields the
//! pipeline reads are modeled. Two sessions exist with different
//! privilege levels: the standard session for read/list/comment/status,
//! and an elevated session that is only ever used to execute merges.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::Config;

const USER_AGENT: &str = "stoker";

/// Commit status states the pipeline reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusState {
    Success,
    Failure,
}

impl StatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusState::Success => "success",
            StatusState::Failure => "failure",
        }
    }
}

/// A forge account (subset of fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub login: String,
}

/// The repository a PR head lives in. `None` upstream when the fork has
/// been deleted out from under the PR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadRepo {
    pub name: String,
    pub owner: Account,
}

/// A PR head: branch, commit, and the repo it lives in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrHead {
    pub sha: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub repo: Option<HeadRepo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
}

/// A pull request (subset of fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub node_id: String,
    pub state: String,
    pub title: String,
    pub draft: bool,
    pub user: Account,
    pub head: PrHead,
    #[serde(default)]
    pub labels: Vec<Label>,
    pub html_url: String,
}

/// A file changed by a pull request.
#[derive(Debug, Clone, Deserialize)]
pub struct PullFile {
    pub filename: String,
}

/// An issue comment.
#[derive(Debug, Clone, Deserialize)]
pub struct IssueComment {
    pub id: u64,
    pub body: String,
    pub html_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitStatus {
    pub state: String,
    pub context: String,
}

/// Combined commit status rollup for a SHA.
#[derive(Debug, Clone, Deserialize)]
pub struct CombinedStatus {
    pub state: String,
    pub statuses: Vec<CommitStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckRun {
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckRunList {
    pub check_runs: Vec<CheckRun>,
}

/// Immutable snapshot of the live PR state, captured once per finalizer
/// run. Nothing re-reads remote state implicitly after this point;
/// refreshes happen only by constructing a new snapshot.
#[derive(Debug, Clone)]
pub struct PrSnapshot {
    pub number: u64,
    pub node_id: String,
    pub state: String,
    pub title: String,
    pub author: String,
    pub head_sha: String,
    pub head_ref: String,
    pub head_owner: Option<String>,
    pub head_repo: Option<String>,
}

impl PrSnapshot {
    pub fn capture(pr: &PullRequest) -> Self {
        Self {
            number: pr.number,
            node_id: pr.node_id.clone(),
            state: pr.state.clone(),
            title: pr.title.clone(),
            author: pr.user.login.clone(),
            head_sha: pr.head.sha.clone(),
            head_ref: pr.head.ref_name.clone(),
            head_owner: pr.head.repo.as_ref().map(|r| r.owner.login.clone()),
            head_repo: pr.head.repo.as_ref().map(|r| r.name.clone()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == "closed"
    }
}

/// One authenticated API session.
pub struct ApiSession {
    client: reqwest::Client,
    api_root: String,
    token: String,
}

impl ApiSession {
    /// Standard-privilege session.
    pub fn standard(config: &Config) -> Result<Self> {
        Self::with_token(config, config.token()?)
    }

    /// Elevated-privilege session; merging requires permissions the
    /// standard session may not hold.
    pub fn elevated(config: &Config) -> Result<Self> {
        Self::with_token(config, config.admin_token()?)
    }

    fn with_token(config: &Config, token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_root: config.api_root.clone(),
            token: token.to_string(),
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
    }

    fn send_json(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
    }

    /// Fetch one pull request.
    pub async fn get_pull(&self, owner_repo: &str, number: u64) -> Result<PullRequest> {
        let url = format!("{}/repos/{}/pulls/{}", self.api_root, owner_repo, number);
        self.get(&url)
            .send()
            .await
            .context("Failed to send pull request query")?
            .error_for_status()
            .context("Pull request query returned error status")?
            .json()
            .await
            .context("Failed to parse pull request response")
    }

    /// List all open pull requests, paginating through every page.
    pub async fn list_open_pulls(&self, owner_repo: &str) -> Result<Vec<PullRequest>> {
        let url = format!("{}/repos/{}/pulls", self.api_root, owner_repo);
        let mut all = Vec::new();
        let mut page = 1u32;

        loop {
            let batch: Vec<PullRequest> = self
                .get(&url)
                .query(&[
                    ("state", "open"),
                    ("per_page", "100"),
                    ("page", &page.to_string()),
                ])
                .send()
                .await
                .context("Failed to send pull list query")?
                .error_for_status()
                .context("Pull list query returned error status")?
                .json()
                .await
                .context("Failed to parse pull list response")?;

            let count = batch.len();
            all.extend(batch);
            if count < 100 {
                break;
            }
            page += 1;
        }

        Ok(all)
    }

    /// List the files changed by a pull request.
    pub async fn pull_files(&self, owner_repo: &str, number: u64) -> Result<Vec<PullFile>> {
        let url = format!(
            "{}/repos/{}/pulls/{}/files",
            self.api_root, owner_repo, number
        );
        let mut all = Vec::new();
        let mut page = 1u32;

        loop {
            let batch: Vec<PullFile> = self
                .get(&url)
                .query(&[("per_page", "100"), ("page", &page.to_string())])
                .send()
                .await
                .context("Failed to send pull files query")?
                .error_for_status()
                .context("Pull files query returned error status")?
                .json()
                .await
                .context("Failed to parse pull files response")?;

            let count = batch.len();
            all.extend(batch);
            if count < 100 {
                break;
            }
            page += 1;
        }

        Ok(all)
    }

    /// List comments on a pull request (issue comments).
    pub async fn list_comments(&self, owner_repo: &str, number: u64) -> Result<Vec<IssueComment>> {
        let url = format!(
            "{}/repos/{}/issues/{}/comments",
            self.api_root, owner_repo, number
        );
        let mut all = Vec::new();
        let mut page = 1u32;

        loop {
            let batch: Vec<IssueComment> = self
                .get(&url)
                .query(&[("per_page", "100"), ("page", &page.to_string())])
                .send()
                .await
                .context("Failed to send comment list query")?
                .error_for_status()
                .context("Comment list query returned error status")?
                .json()
                .await
                .context("Failed to parse comment list response")?;

            let count = batch.len();
            all.extend(batch);
            if count < 100 {
                break;
            }
            page += 1;
        }

        Ok(all)
    }

    /// Post a new comment.
    pub async fn post_comment(
        &self,
        owner_repo: &str,
        number: u64,
        body: &str,
    ) -> Result<IssueComment> {
        let url = format!(
            "{}/repos/{}/issues/{}/comments",
            self.api_root, owner_repo, number
        );
        self.send_json(self.client.post(&url))
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await
            .context("Failed to post comment")?
            .error_for_status()
            .context("Comment creation returned error status")?
            .json()
            .await
            .context("Failed to parse comment response")
    }

    /// Edit an existing comment.
    pub async fn update_comment(
        &self,
        owner_repo: &str,
        comment_id: u64,
        body: &str,
    ) -> Result<IssueComment> {
        let url = format!(
            "{}/repos/{}/issues/comments/{}",
            self.api_root, owner_repo, comment_id
        );
        self.send_json(self.client.patch(&url))
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await
            .context("Failed to update comment")?
            .error_for_status()
            .context("Comment update returned error status")?
            .json()
            .await
            .context("Failed to parse comment response")
    }

    /// Post or edit the comment containing `marker`: at most one bot
    /// comment per action exists on a PR, no matter how many times the
    /// pipeline runs.
    pub async fn upsert_comment(
        &self,
        owner_repo: &str,
        number: u64,
        marker: &str,
        body: &str,
    ) -> Result<IssueComment> {
        let existing = self
            .list_comments(owner_repo, number)
            .await?
            .into_iter()
            .find(|c| c.body.contains(marker));

        match existing {
            Some(comment) => self.update_comment(owner_repo, comment.id, body).await,
            None => self.post_comment(owner_repo, number, body).await,
        }
    }

    /// Set a commit status on a SHA.
    pub async fn set_status(
        &self,
        owner_repo: &str,
        sha: &str,
        state: StatusState,
        status_context: &str,
        description: &str,
        target_url: Option<&str>,
    ) -> Result<()> {
        let url = format!("{}/repos/{}/statuses/{}", self.api_root, owner_repo, sha);
        let mut payload = serde_json::json!({
            "state": state.as_str(),
            "context": status_context,
            "description": description,
        });
        if let Some(target) = target_url {
            payload["target_url"] = serde_json::Value::String(target.to_string());
        }
        self.send_json(self.client.post(&url))
            .json(&payload)
            .send()
            .await
            .context("Failed to set commit status")?
            .error_for_status()
            .context("Status creation returned error status")?;
        Ok(())
    }

    /// Close a pull request.
    pub async fn close_pull(&self, owner_repo: &str, number: u64) -> Result<()> {
        let url = format!("{}/repos/{}/pulls/{}", self.api_root, owner_repo, number);
        self.send_json(self.client.patch(&url))
            .json(&serde_json::json!({ "state": "closed" }))
            .send()
            .await
            .context("Failed to close pull request")?
            .error_for_status()
            .context("Pull close returned error status")?;
        Ok(())
    }

    /// Update a pull request's title.
    pub async fn update_title(&self, owner_repo: &str, number: u64, title: &str) -> Result<()> {
        let url = format!("{}/repos/{}/pulls/{}", self.api_root, owner_repo, number);
        self.send_json(self.client.patch(&url))
            .json(&serde_json::json!({ "title": title }))
            .send()
            .await
            .context("Failed to update pull request title")?
            .error_for_status()
            .context("Title update returned error status")?;
        Ok(())
    }

    /// Promote a draft PR to ready-for-review. REST has no endpoint for
    /// this; it is the one GraphQL mutation the pipeline uses.
    pub async fn mark_ready_for_review(&self, node_id: &str) -> Result<()> {
        let url = format!("{}/graphql", self.api_root);
        let payload = serde_json::json!({
            "query": "mutation($id: ID!) { markPullRequestReadyForReview(input: {pullRequestId: $id}) { pullRequest { isDraft } } }",
            "variables": { "id": node_id },
        });
        let response: serde_json::Value = self
            .send_json(self.client.post(&url))
            .json(&payload)
            .send()
            .await
            .context("Failed to send ready-for-review mutation")?
            .error_for_status()
            .context("Ready-for-review mutation returned error status")?
            .json()
            .await
            .context("Failed to parse ready-for-review response")?;

        if let Some(errors) = response.get("errors") {
            anyhow::bail!("Ready-for-review mutation failed: {errors}");
        }
        Ok(())
    }

    /// Squash-merge a pull request.
    pub async fn merge_pull(&self, owner_repo: &str, number: u64, commit_title: &str) -> Result<()> {
        let url = format!(
            "{}/repos/{}/pulls/{}/merge",
            self.api_root, owner_repo, number
        );
        self.send_json(self.client.put(&url))
            .json(&serde_json::json!({
                "merge_method": "squash",
                "commit_title": commit_title,
            }))
            .send()
            .await
            .context("Failed to send merge request")?
            .error_for_status()
            .context("Merge returned error status")?;
        Ok(())
    }

    /// Combined commit-status rollup for a SHA.
    pub async fn combined_status(&self, owner_repo: &str, sha: &str) -> Result<CombinedStatus> {
        let url = format!(
            "{}/repos/{}/commits/{}/status",
            self.api_root, owner_repo, sha
        );
        self.get(&url)
            .send()
            .await
            .context("Failed to send combined status query")?
            .error_for_status()
            .context("Combined status query returned error status")?
            .json()
            .await
            .context("Failed to parse combined status response")
    }

    /// Check runs recorded against a SHA.
    pub async fn check_runs(&self, owner_repo: &str, sha: &str) -> Result<CheckRunList> {
        let url = format!(
            "{}/repos/{}/commits/{}/check-runs",
            self.api_root, owner_repo, sha
        );
        self.get(&url)
            .send()
            .await
            .context("Failed to send check runs query")?
            .error_for_status()
            .context("Check runs query returned error status")?
            .json()
            .await
            .context("Failed to parse check runs response")
    }
}
