//! Reconciliation: deciding and executing push/comment/close against a
//! live pull request from a task's outcome.
//!
//! All mutation decisions are derived, never stored: given `(changed,
//! errored, info message)` plus the action's policy knobs, the engine
//! pushes the prepared commit, upserts exactly one bot comment, and
//! optionally closes a PR that has nothing left to do. Push failures are
//! reported as data so callers can combine them with the action's own
//! error state; comment and close failures propagate, since a PR left
//! without its status comment is an inconsistency worth failing loudly.

use anyhow::Result;
use chrono::Utc;
use textwrap::dedent;
use tracing::{info, warn};

use crate::api::{ApiSession, PrSnapshot};
use crate::gitops::FeedstockClone;

/// Policy for one reconciliation pass.
pub struct ReconcileAction<'a> {
    /// Human-readable verb phrase, e.g. `"rerender"`.
    pub action: &'a str,
    /// Stable slug used in the hidden comment marker.
    pub slug: &'a str,
    /// Extra help appended to the failure sentence, e.g. a pointer to
    /// running the tool locally.
    pub help_message: &'a str,
    /// Close the PR when there is neither a change nor an error.
    pub close_pr_if_no_changes_or_errors: bool,
}

/// Hidden marker identifying this action's bot comment.
pub fn comment_marker(slug: &str) -> String {
    format!("<!-- stoker:{slug} -->")
}

/// Troubleshooting guidance appended to the info message when the
/// action itself failed.
pub fn troubleshooting_suffix() -> String {
    dedent(
        "
        The following suggestions might help debug the issue:
        * Is the recipe file in this feedstock valid?
        * If the feedstock carries its own build-variant configuration,
          make sure it is compatible with the current global pinnings.
        * Is the fork used for this PR owned by a user account? Automated
          pushes only work for user-owned forks.
        ",
    )
}

/// Should this pass close the PR?
pub fn should_close(close_if_no_op: bool, changed: bool, errored: bool) -> bool {
    close_if_no_op && !changed && !errored
}

/// Build the status comment body for one reconciliation pass.
pub fn build_comment_body(
    action: &str,
    errored: bool,
    changed: bool,
    info_message: Option<&str>,
    help_message: &str,
    closing: bool,
    run_link: Option<&str>,
    marker: &str,
) -> String {
    let mut body = String::from(
        "Hi! This is the friendly automated feedstock maintenance service.\n\n",
    );

    if errored {
        body.push_str(&format!(
            "I tried to {action} for you, but it looks like there was a problem. \
             Check the CI logs of the task job for details{help_message}.\n",
        ));
    } else if changed {
        body.push_str(&format!(
            "I just wanted to let you know that I tried to {action} for you and \
             pushed the changes to this PR.\n",
        ));
    } else {
        body.push_str(&format!(
            "I tried to {action} for you, but it looks like there was nothing to do.\n",
        ));
    }

    if let Some(info) = info_message.filter(|m| !m.is_empty()) {
        body.push_str(&format!("\n{info}\n"));
    }

    if closing {
        body.push_str("\nI'm closing this PR since there is nothing left to do.\n");
    }

    body.push('\n');
    if let Some(link) = run_link {
        body.push_str(&format!(
            "<sub>Generated by workflow run [{link}]({link}) at {}.</sub>\n",
            Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        ));
    }
    body.push_str(marker);
    body.push('\n');
    body
}

/// Push the prepared commit if anything changed, upsert the single bot
/// comment, and close the PR when the action's policy says a no-op PR
/// should not stay open. Returns the push-level error, independent of
/// the action's own error state.
#[allow(clippy::too_many_arguments)]
async fn comment_and_push_if_changed(
    session: &ApiSession,
    push_token: &str,
    clone: &FeedstockClone,
    snapshot: &PrSnapshot,
    owner_repo: &str,
    run_link: Option<&str>,
    action: &ReconcileAction<'_>,
    action_error: bool,
    changed: bool,
    info_message: Option<&str>,
) -> Result<bool> {
    let mut push_error = false;

    if changed {
        if let Err(err) = clone.push(&snapshot.head_ref, push_token) {
            warn!(
                "failed to push to {}:{}: {err:#}",
                owner_repo, snapshot.head_ref
            );
            push_error = true;
        } else {
            info!("pushed changes to {}:{}", owner_repo, snapshot.head_ref);
        }
    }

    let errored = action_error || push_error;
    let closing = should_close(
        action.close_pr_if_no_changes_or_errors,
        changed,
        errored,
    );
    let marker = comment_marker(action.slug);
    let body = build_comment_body(
        action.action,
        errored,
        changed,
        info_message,
        action.help_message,
        closing,
        run_link,
        &marker,
    );
    session
        .upsert_comment(owner_repo, snapshot.number, &marker, &body)
        .await?;

    if closing {
        info!("closing {}#{}: nothing to do", owner_repo, snapshot.number);
        session.close_pull(owner_repo, snapshot.number).await?;
    }

    Ok(push_error)
}

/// Shared push/comment wiring for rerender and version-update tasks.
///
/// Appends the troubleshooting suffix to the info message when the
/// action failed, drives the push/comment/close primitive, and returns
/// the final error state for the task: `action_error OR push_error`.
#[allow(clippy::too_many_arguments)]
pub async fn push_changes(
    session: &ApiSession,
    push_token: &str,
    clone: &FeedstockClone,
    snapshot: &PrSnapshot,
    owner_repo: &str,
    run_link: Option<&str>,
    action: &ReconcileAction<'_>,
    action_error: bool,
    changed: bool,
    info_message: Option<String>,
) -> Result<bool> {
    let info_message = if action_error {
        let mut info = info_message.unwrap_or_default();
        info.push('\n');
        info.push_str(&troubleshooting_suffix());
        Some(info)
    } else {
        info_message
    };

    let push_error = comment_and_push_if_changed(
        session,
        push_token,
        clone,
        snapshot,
        owner_repo,
        run_link,
        action,
        action_error,
        changed,
        info_message.as_deref(),
    )
    .await?;

    Ok(action_error || push_error)
}
