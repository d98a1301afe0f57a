//! Automerge trigger — `stoker automerge`.
//!
//! Standalone entry point: given a commit SHA, find the open PR whose
//! head matches and merge it if policy allows. Listing and evaluation
//! use the standard session; the merge itself runs on an elevated
//! session, since merging requires permissions the default session may
//! not hold. A SHA with no matching open PR is a recoverable no-op, not
//! an error; the commit may belong to a branch with no open PR.

use anyhow::Result;
use tracing::{error, info};

use stoker::api::{ApiSession, CheckRunList, CombinedStatus, PullRequest};
use stoker::config::Config;
use stoker::util::{notice, warning};

/// Label that flags a PR for automatic merging.
pub const AUTOMERGE_LABEL: &str = "automerge";
/// Title prefix that flags a bot-opened PR for automatic merging.
pub const AUTOMERGE_TITLE_PREFIX: &str = "[bot-automerge]";

/// Why a PR cannot be automerged, or `None` if it is eligible.
fn ineligibility_reason(pr: &PullRequest) -> Option<String> {
    if pr.state != "open" {
        return Some(format!("PR is {}", pr.state));
    }
    if pr.draft {
        return Some("PR is a draft".to_string());
    }
    let flagged = pr.labels.iter().any(|label| label.name == AUTOMERGE_LABEL)
        || pr.title.starts_with(AUTOMERGE_TITLE_PREFIX);
    if !flagged {
        return Some("PR is not flagged for automerge".to_string());
    }
    None
}

/// Commit statuses pass when there are none, or the rollup is green.
fn statuses_green(combined: &CombinedStatus) -> bool {
    combined.statuses.is_empty() || combined.state == "success"
}

/// Check runs pass when every run has completed with a non-failing
/// conclusion. A pending run means "not yet mergeable", not "failed".
fn check_runs_green(checks: &CheckRunList) -> bool {
    checks.check_runs.iter().all(|check| {
        check.status == "completed"
            && matches!(
                check.conclusion.as_deref(),
                Some("success") | Some("neutral") | Some("skipped")
            )
    })
}

/// Squash-merge commit title.
fn merge_title(pr: &PullRequest) -> String {
    format!("{} (#{})", pr.title, pr.number)
}

async fn evaluate_and_merge(
    config: &Config,
    session: &ApiSession,
    full_repo: &str,
    sha: &str,
    pr: &PullRequest,
) -> Result<()> {
    if let Some(reason) = ineligibility_reason(pr) {
        info!("skipping automerge for {full_repo}#{}: {reason}", pr.number);
        return Ok(());
    }

    let combined = session.combined_status(full_repo, sha).await?;
    let checks = session.check_runs(full_repo, sha).await?;
    if !statuses_green(&combined) || !check_runs_green(&checks) {
        info!(
            "skipping automerge for {full_repo}#{}: checks are not green yet",
            pr.number
        );
        return Ok(());
    }

    let elevated = ApiSession::elevated(config)?;
    elevated
        .merge_pull(full_repo, pr.number, &merge_title(pr))
        .await?;
    info!("merged {full_repo}#{}", pr.number);
    Ok(())
}

pub async fn cmd_automerge(config: &Config, repo: &str, sha: &str) -> Result<()> {
    let full_repo = config.full_repo(repo)?;
    let action_desc = format!("task `automerge` for {full_repo}@{sha}");
    info!("{action_desc}");
    notice("stoker job information", &action_desc);

    let session = ApiSession::standard(config)?;
    let mut found_pr = false;
    for pr in session.list_open_pulls(&full_repo).await? {
        if pr.head.sha == sha {
            found_pr = true;
            evaluate_and_merge(config, &session, &full_repo, sha, &pr).await?;
        }
    }

    if !found_pr {
        let message = format!("No PR found for {full_repo}@{sha}");
        error!("{message}");
        warning("No PR Found for Automerge", &message);
    }
    Ok(())
}
