//! Trusted finalization — `stoker finalize-task`.
//!
//! The only code allowed to mutate the pull request. Loads the Task
//! Result produced by the sandboxed phase, re-fetches live PR state,
//! replays the patch onto a fresh clone of the contributor's branch, and
//! drives the reconciliation engine. The PR may have changed arbitrarily
//! since the runner's snapshot; everything here keys off the state
//! captured once at the top of the run.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use stoker::api::{ApiSession, PrSnapshot, StatusState};
use stoker::config::Config;
use stoker::gitops::FeedstockClone;
use stoker::lint::{
    LINT_COMMENT_MARKER, build_findings_comment, lint_failure_comment, recipes_for_linting,
    scoped_lint_error,
};
use stoker::recon::{ReconcileAction, push_changes};
use stoker::task::{
    BOT_RERENDER_TITLE, LintOutcome, RerenderOutcome, TaskOutcome, TaskResult, VersionOutcome,
    version_update_message,
};

/// Substituted when a patch arrives without a commit message. That
/// combination is an upstream contract violation, but it must not block
/// the pipeline.
const DEFAULT_COMMIT_MESSAGE: &str = "chore: automated feedstock maintenance";

const RERENDER_STATUS_CONTEXT: &str = "stoker/rerender";
const LINT_STATUS_CONTEXT: &str = "stoker/lint";

/// The commit message actually used, with the default substituted when a
/// patch exists but the runner supplied none.
fn effective_commit_message(has_patch: bool, commit_message: Option<&str>) -> Option<String> {
    match commit_message {
        Some(message) => Some(message.to_string()),
        None if has_patch => {
            warn!(
                "The task provided a patch but no commit message; \
                 proceeding with a default commit message"
            );
            Some(DEFAULT_COMMIT_MESSAGE.to_string())
        }
        None => None,
    }
}

/// Combined action error for a version-update task. An unrelated
/// rerender failure on an unchanged version is not reported.
fn version_action_error(out: &VersionOutcome) -> bool {
    if out.version_error {
        true
    } else if out.version_changed {
        out.rerender_error
    } else {
        false
    }
}

/// A fresh clone of the contributor's branch with the Task Result's
/// patch applied and committed. The scratch directory lives exactly as
/// long as the finalizer run.
struct PreparedClone {
    clone: FeedstockClone,
    _scratch: TempDir,
}

/// Clone the contributor's branch and replay the patch. Cloning happens
/// even with no patch: a message-only (empty) commit is still a commit.
fn prepare_commit(
    config: &Config,
    snapshot: &PrSnapshot,
    patch: Option<&str>,
    commit_message: Option<&str>,
) -> Result<PreparedClone> {
    let pr_owner = snapshot
        .head_owner
        .as_deref()
        .context("PR head repository no longer exists; cannot finalize")?;
    let pr_repo = snapshot
        .head_repo
        .as_deref()
        .context("PR head repository no longer exists; cannot finalize")?;

    let scratch = TempDir::new().context("Failed to create scratch directory")?;
    let clone = FeedstockClone::clone_branch(
        &config.clone_url(pr_owner, pr_repo),
        &scratch.path().join(pr_repo),
        &snapshot.head_ref,
    )?;

    if let Some(patch) = patch {
        clone.apply_patch(patch)?;
        clone.stage_all()?;
    }

    if let Some(message) = effective_commit_message(patch.is_some(), commit_message) {
        clone.commit(&message)?;
    }

    Ok(PreparedClone {
        clone,
        _scratch: scratch,
    })
}

async fn finalize_rerender(
    config: &Config,
    session: &ApiSession,
    snapshot: &PrSnapshot,
    full_repo: &str,
    sha_for_status: &str,
    out: &RerenderOutcome,
) -> Result<()> {
    let prepared = prepare_commit(
        config,
        snapshot,
        out.patch.as_deref(),
        out.commit_message.as_deref(),
    )?;

    let action = ReconcileAction {
        action: "rerender",
        slug: "rerender",
        help_message: " or you can try rerendering locally with the feedstock tooling",
        close_pr_if_no_changes_or_errors: false,
    };
    let run_link = config.run_link();
    let comment_push_error = push_changes(
        session,
        config.token()?,
        &prepared.clone,
        snapshot,
        full_repo,
        run_link.as_deref(),
        &action,
        out.rerender_error,
        out.changed,
        out.info_message.clone(),
    )
    .await?;

    let status = if comment_push_error {
        StatusState::Failure
    } else {
        StatusState::Success
    };
    session
        .set_status(
            full_repo,
            sha_for_status,
            status,
            RERENDER_STATUS_CONTEXT,
            "feedstock rerendering",
            run_link.as_deref(),
        )
        .await?;

    // Draft bot-rerender PRs auto-promote once rerendering confirms clean.
    if !comment_push_error
        && snapshot.title == BOT_RERENDER_TITLE
        && snapshot.author == config.bot_user
        && let Err(err) = session.mark_ready_for_review(&snapshot.node_id).await
    {
        warn!("failed to mark {full_repo}#{} ready for review: {err:#}", snapshot.number);
    }

    if comment_push_error {
        bail!(
            "Error in rerender for {full_repo}#{}; check the logs of the run-task job for details",
            snapshot.number
        );
    }
    Ok(())
}

async fn finalize_version_update(
    config: &Config,
    session: &ApiSession,
    snapshot: &PrSnapshot,
    full_repo: &str,
    out: &VersionOutcome,
) -> Result<()> {
    let prepared = prepare_commit(
        config,
        snapshot,
        out.patch.as_deref(),
        out.commit_message.as_deref(),
    )?;

    let mut title_error = false;
    if !out.version_error
        && out.version_changed
        && let Some(version) = &out.new_version
    {
        info!(
            "Updating PR title for {full_repo}#{} with version={version}",
            snapshot.number
        );
        if let Err(err) = session
            .update_title(full_repo, snapshot.number, &version_update_message(version))
            .await
        {
            warn!("failed to update PR title: {err:#}");
            title_error = true;
        }
    }

    let action = ReconcileAction {
        action: "update the version and rerender",
        slug: "version-update",
        help_message: "",
        // "Nothing to update" should not leave a stale PR open.
        close_pr_if_no_changes_or_errors: true,
    };
    let comment_push_error = push_changes(
        session,
        config.token()?,
        &prepared.clone,
        snapshot,
        full_repo,
        config.run_link().as_deref(),
        &action,
        version_action_error(out),
        out.version_changed,
        out.info_message.clone(),
    )
    .await?;

    // Version-update PRs are never left in draft.
    if !comment_push_error
        && let Err(err) = session.mark_ready_for_review(&snapshot.node_id).await
    {
        warn!("failed to mark {full_repo}#{} ready for review: {err:#}", snapshot.number);
    }

    if title_error || comment_push_error {
        bail!(
            "Error in version update for {full_repo}#{}: title_error={title_error} \
             comment_push_error={comment_push_error}; \
             check the logs of the run-task job for details",
            snapshot.number
        );
    }
    Ok(())
}

async fn finalize_lint(
    config: &Config,
    session: &ApiSession,
    snapshot: &PrSnapshot,
    full_repo: &str,
    sha_for_status: &str,
    out: &LintOutcome,
) -> Result<()> {
    let run_link = config.run_link();

    let (lint_error, body, status, description) =
        match (&out.lints, &out.hints, &out.errors) {
            (Some(lints), Some(hints), Some(errors)) => {
                // The runner's global flag is advisory; the authoritative
                // decision is scoped to the recipes this PR actually
                // touches.
                let changed_files: Vec<String> = session
                    .pull_files(full_repo, snapshot.number)
                    .await?
                    .into_iter()
                    .map(|f| f.filename)
                    .collect();
                let scope: BTreeSet<String> =
                    recipes_for_linting(&changed_files, lints, hints);
                let lint_error = out.lint_error || scoped_lint_error(errors, &scope);

                if lint_error {
                    (
                        true,
                        lint_failure_comment(run_link.as_deref()),
                        StatusState::Failure,
                        "recipe linting failed",
                    )
                } else {
                    let (body, verdict) =
                        build_findings_comment(lints, hints, &scope, run_link.as_deref());
                    (false, body, verdict.status(), verdict.description())
                }
            }
            // All-null findings: the tool fell over before producing
            // anything.
            _ => (
                true,
                lint_failure_comment(run_link.as_deref()),
                StatusState::Failure,
                "recipe linting failed",
            ),
        };

    let comment = session
        .upsert_comment(full_repo, snapshot.number, LINT_COMMENT_MARKER, &body)
        .await?;
    session
        .set_status(
            full_repo,
            sha_for_status,
            status,
            LINT_STATUS_CONTEXT,
            description,
            Some(&comment.html_url),
        )
        .await?;

    info!("linter status: {}", status.as_str());
    debug!("linter message:\n{body}");

    if lint_error {
        bail!(
            "Error in linting for {full_repo}#{}; check the logs of the run-task job for details",
            snapshot.number
        );
    }
    Ok(())
}

pub async fn cmd_finalize_task(config: &Config, task_data_dir: &Path) -> Result<()> {
    let result = TaskResult::load(task_data_dir)?;
    let full_repo = config.full_repo(&result.repo)?;
    info!(
        "finalizing task `{}` for {full_repo}#{}",
        result.task, result.pr_number
    );
    debug!("task results: {:#?}", result.task_results);

    let session = ApiSession::standard(config)?;
    let pr = session.get_pull(&full_repo, result.pr_number).await?;
    let snapshot = PrSnapshot::capture(&pr);

    if snapshot.is_closed() {
        // Closed PRs are immutable targets: a task landing on one is
        // meaningless and could resurrect it unexpectedly.
        error!(
            "Closed PRs cannot be linted, rerendered, or have their versions updated; exiting"
        );
        return Ok(());
    }

    let sha_for_status = result
        .sha
        .clone()
        .unwrap_or_else(|| snapshot.head_sha.clone());

    match &result.task_results {
        TaskOutcome::Rerender(out) => {
            finalize_rerender(config, &session, &snapshot, &full_repo, &sha_for_status, out).await
        }
        TaskOutcome::VersionUpdate(out) => {
            finalize_version_update(config, &session, &snapshot, &full_repo, out).await
        }
        TaskOutcome::Lint(out) => {
            finalize_lint(config, &session, &snapshot, &full_repo, &sha_for_status, out).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version_outcome() -> VersionOutcome {
        VersionOutcome {
            version_changed: false,
            version_error: false,
            new_version: None,
            rerender_changed: false,
            rerender_error: false,
            info_message: None,
            commit_message: None,
            patch: None,
        }
    }

    #[test]
    fn test_version_error_always_reported() {
        let out = VersionOutcome {
            version_error: true,
            ..version_outcome()
        };
        assert!(version_action_error(&out));
    }

    #[test]
    fn test_rerender_error_reported_only_when_version_changed() {
        let out = VersionOutcome {
            version_changed: true,
            rerender_error: true,
            ..version_outcome()
        };
        assert!(version_action_error(&out));

        let out = VersionOutcome {
            version_changed: false,
            ..version_outcome()
        };
        // An unrelated rerender failure on an unchanged version is not
        // reported (the artifact forbids that combination anyway).
        assert!(!version_action_error(&out));
    }

    #[test]
    fn test_clean_version_update_has_no_action_error() {
        let out = VersionOutcome {
            version_changed: true,
            new_version: Some("2.0".into()),
            ..version_outcome()
        };
        assert!(!version_action_error(&out));
    }

    #[test]
    fn test_effective_commit_message_substitutes_default_for_patch() {
        assert_eq!(
            effective_commit_message(true, None).as_deref(),
            Some(DEFAULT_COMMIT_MESSAGE)
        );
    }

    #[test]
    fn test_effective_commit_message_keeps_supplied_message() {
        assert_eq!(
            effective_commit_message(true, Some("MNT: rerender")).as_deref(),
            Some("MNT: rerender")
        );
    }

    #[test]
    fn test_effective_commit_message_none_without_patch() {
        assert_eq!(effective_commit_message(false, None), None);
    }
}
