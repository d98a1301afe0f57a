//! Sandboxed task execution — `stoker run-task`.
//!
//! Runs entirely on repository-supplied build logic and therefore never
//! touches the forge API: its only output is the Task Result artifact,
//! picked up later by the trusted `finalize-task` phase. The working
//! copy is scrubbed before exit so no sandbox residue survives the job.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use stoker::config::Config;
use stoker::gitops::FeedstockClone;
use stoker::ops::{ContainerOps, FeedstockOps};
use stoker::task::{
    LintOutcome, RerenderOutcome, TaskKind, TaskOutcome, TaskResult, VersionOutcome,
    RERENDER_COMMIT_PREFIX, version_update_message,
};
use stoker::util::{notice, LogGroup};

/// Normalize the sentinel "no version requested" inputs to auto-detect.
pub fn normalize_requested_version(raw: Option<&str>) -> Option<String> {
    let version = raw?.trim();
    if version.is_empty() {
        return None;
    }
    let lower = version.to_lowercase();
    if lower == "null" || lower == "none" {
        None
    } else {
        Some(version.to_string())
    }
}

/// Fold a chained rerender's commit message into the version bump's, so
/// exactly one commit message describes both changes.
pub fn combine_commit_messages(version_message: &str, rerender_message: &str) -> String {
    let stripped = rerender_message
        .strip_prefix(RERENDER_COMMIT_PREFIX)
        .unwrap_or(rerender_message);
    format!("{version_message} & {stripped}")
}

/// Drive one opaque tool operation and capture its outcome.
async fn execute<O: FeedstockOps + Sync>(
    ops: &O,
    task: TaskKind,
    clone: &FeedstockClone,
    prev_head: &str,
    full_repo: &str,
    requested_version: Option<&str>,
) -> Result<TaskOutcome> {
    match task {
        TaskKind::Rerender => {
            let out = ops.rerender(clone.dir()).await;
            let patch = if out.changed {
                clone.patch_relative_to(prev_head)?
            } else {
                None
            };
            Ok(TaskOutcome::Rerender(RerenderOutcome {
                changed: out.changed,
                rerender_error: out.error,
                info_message: out.info_message,
                commit_message: out.commit_message,
                patch,
            }))
        }
        TaskKind::VersionUpdate => {
            let requested = normalize_requested_version(requested_version);
            info!("version update requested version: {requested:?}");

            let version = ops
                .update_version(clone.dir(), full_repo, requested.as_deref())
                .await;

            if !version.changed {
                // A rerender is never attempted on an unchanged version;
                // the chained fields stay at their "nothing happened"
                // defaults.
                return Ok(TaskOutcome::VersionUpdate(VersionOutcome {
                    version_changed: false,
                    version_error: version.error,
                    new_version: version.new_version,
                    rerender_changed: false,
                    rerender_error: false,
                    info_message: None,
                    commit_message: None,
                    patch: None,
                }));
            }

            let mut commit_message =
                version_update_message(version.new_version.as_deref().unwrap_or("unknown"));

            let rerender = ops.rerender(clone.dir()).await;
            if rerender.changed
                && let Some(message) = &rerender.commit_message
            {
                commit_message = combine_commit_messages(&commit_message, message);
            }
            let patch = clone.patch_relative_to(prev_head)?;

            Ok(TaskOutcome::VersionUpdate(VersionOutcome {
                version_changed: true,
                version_error: version.error,
                new_version: version.new_version,
                rerender_changed: rerender.changed,
                rerender_error: rerender.error,
                info_message: rerender.info_message,
                commit_message: Some(commit_message),
                patch,
            }))
        }
        TaskKind::Lint => match ops.lint(clone.dir()).await {
            Ok(findings) => Ok(TaskOutcome::Lint(LintOutcome {
                lint_error: false,
                lints: Some(findings.lints),
                hints: Some(findings.hints),
                errors: Some(findings.errors),
            })),
            Err(err) => {
                // A malformed recipe is an expected, recoverable outcome;
                // it must never crash the runner.
                warn!("LINTING ERROR: {err}");
                warn!("LINTING ERROR CHAIN: {err:?}");
                Ok(TaskOutcome::Lint(LintOutcome {
                    lint_error: true,
                    lints: None,
                    hints: None,
                    errors: None,
                }))
            }
        },
    }
}

pub async fn cmd_run_task(
    config: &Config,
    task: TaskKind,
    repo: &str,
    pr_number: u64,
    task_data_dir: &Path,
    requested_version: Option<&str>,
    sha: Option<&str>,
) -> Result<()> {
    let full_repo = config.full_repo(repo)?;
    let action_desc = format!("task `{task}` for {full_repo}#{pr_number}");
    info!("{action_desc}");
    notice("stoker job information", &action_desc);

    std::fs::create_dir_all(task_data_dir)
        .with_context(|| format!("Failed to create {}", task_data_dir.display()))?;

    let feedstock_dir = task_data_dir.join(repo);
    let clone = FeedstockClone::clone(&config.clone_url(config.org()?, repo), &feedstock_dir)?;
    clone.checkout_pr_head(pr_number)?;
    let prev_head = clone.head_sha()?;

    let ops = ContainerOps::new(config.container_image()?);
    {
        let _group = LogGroup::open("container image pull");
        if let Err(err) = ops.pull_image().await {
            // An interrupted pull must not silently skip the task; the
            // tool invocation below surfaces the real error if the image
            // is truly unusable.
            warn!("image pull failed, continuing: {err:#}");
        }
    }

    let outcome = execute(
        &ops,
        task,
        &clone,
        &prev_head,
        &full_repo,
        requested_version,
    )
    .await?;

    let result = TaskResult {
        task,
        repo: repo.to_string(),
        pr_number,
        sha: sha.map(str::to_string),
        task_results: outcome,
    };
    let path = result.write(task_data_dir)?;
    info!("task result written to {}", path.display());

    clone.scrub()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use git2::{IndexAddOption, Repository, Signature};
    use tempfile::tempdir;

    use stoker::errors::OpsError;
    use stoker::ops::{LintFindings, RerenderOut, VersionOut};

    #[test]
    fn test_normalize_requested_version_sentinels() {
        assert_eq!(normalize_requested_version(None), None);
        assert_eq!(normalize_requested_version(Some("")), None);
        assert_eq!(normalize_requested_version(Some("   ")), None);
        assert_eq!(normalize_requested_version(Some("null")), None);
        assert_eq!(normalize_requested_version(Some("NULL")), None);
        assert_eq!(normalize_requested_version(Some("None")), None);
        assert_eq!(
            normalize_requested_version(Some("1.2.3")),
            Some("1.2.3".to_string())
        );
    }

    #[test]
    fn test_combine_commit_messages_strips_rerender_prefix() {
        assert_eq!(
            combine_commit_messages("ENH: updated version to 1.2.3", "MNT: rerender"),
            "ENH: updated version to 1.2.3 & rerender"
        );
    }

    #[test]
    fn test_combine_commit_messages_without_prefix() {
        assert_eq!(
            combine_commit_messages("ENH: updated version to 1.2.3", "regenerate"),
            "ENH: updated version to 1.2.3 & regenerate"
        );
    }

    /// Scripted stand-in for the container tool. Each operation can
    /// drop a file into the working copy to simulate content changes.
    struct StubOps {
        rerender_out: RerenderOut,
        rerender_writes: Option<(&'static str, &'static str)>,
        version_out: VersionOut,
        version_writes: Option<(&'static str, &'static str)>,
        lint_out: Mutex<Option<Result<LintFindings, OpsError>>>,
    }

    impl StubOps {
        fn noop() -> Self {
            Self {
                rerender_out: RerenderOut {
                    changed: false,
                    error: false,
                    info_message: None,
                    commit_message: None,
                },
                rerender_writes: None,
                version_out: VersionOut {
                    changed: false,
                    error: false,
                    new_version: None,
                },
                version_writes: None,
                lint_out: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl FeedstockOps for StubOps {
        async fn rerender(&self, workdir: &Path) -> RerenderOut {
            if let Some((name, content)) = self.rerender_writes {
                fs::write(workdir.join(name), content).unwrap();
            }
            self.rerender_out.clone()
        }

        async fn update_version(
            &self,
            workdir: &Path,
            _full_repo: &str,
            _input_version: Option<&str>,
        ) -> VersionOut {
            if let Some((name, content)) = self.version_writes {
                fs::write(workdir.join(name), content).unwrap();
            }
            self.version_out.clone()
        }

        async fn lint(&self, _workdir: &Path) -> Result<LintFindings, OpsError> {
            self.lint_out
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(OpsError::ToolFailed {
                    code: Some(1),
                    stderr: "unscripted".into(),
                }))
        }
    }

    fn seeded_clone() -> (tempfile::TempDir, tempfile::TempDir, FeedstockClone, String) {
        let origin_dir = tempdir().unwrap();
        let origin = Repository::init(origin_dir.path()).unwrap();
        let mut config = origin.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        fs::write(origin_dir.path().join("recipe.yaml"), "version: 1\n").unwrap();
        let mut index = origin.index().unwrap();
        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = origin.find_tree(tree_id).unwrap();
        let sig = Signature::now("test", "test@test.com").unwrap();
        origin
            .commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
            .unwrap();
        drop(tree);
        drop(origin);

        let work = tempdir().unwrap();
        let clone = FeedstockClone::clone(
            origin_dir.path().to_str().unwrap(),
            &work.path().join("fs"),
        )
        .unwrap();
        let prev_head = clone.head_sha().unwrap();
        (origin_dir, work, clone, prev_head)
    }

    #[tokio::test]
    async fn test_execute_rerender_captures_patch() {
        let (_origin, _work, clone, prev_head) = seeded_clone();
        let ops = StubOps {
            rerender_out: RerenderOut {
                changed: true,
                error: false,
                info_message: None,
                commit_message: Some("MNT: rerender".into()),
            },
            rerender_writes: Some(("ci.yaml", "generated: true\n")),
            ..StubOps::noop()
        };

        let outcome = execute(&ops, TaskKind::Rerender, &clone, &prev_head, "acme/x", None)
            .await
            .unwrap();
        match outcome {
            TaskOutcome::Rerender(out) => {
                assert!(out.changed);
                assert!(!out.rerender_error);
                assert!(out.patch.unwrap().contains("generated: true"));
            }
            _ => panic!("Expected rerender outcome"),
        }
    }

    #[tokio::test]
    async fn test_execute_rerender_unchanged_has_no_patch() {
        let (_origin, _work, clone, prev_head) = seeded_clone();
        let ops = StubOps::noop();
        let outcome = execute(&ops, TaskKind::Rerender, &clone, &prev_head, "acme/x", None)
            .await
            .unwrap();
        match outcome {
            TaskOutcome::Rerender(out) => {
                assert!(!out.changed);
                assert_eq!(out.patch, None);
            }
            _ => panic!("Expected rerender outcome"),
        }
    }

    #[tokio::test]
    async fn test_execute_version_unchanged_forces_rerender_defaults() {
        let (_origin, _work, clone, prev_head) = seeded_clone();
        let ops = StubOps {
            version_out: VersionOut {
                changed: false,
                error: false,
                new_version: Some("1.0".into()),
            },
            // Even a scripted rerender change must not leak through: the
            // chain is never attempted on an unchanged version.
            rerender_out: RerenderOut {
                changed: true,
                error: true,
                info_message: Some("should not appear".into()),
                commit_message: Some("MNT: rerender".into()),
            },
            ..StubOps::noop()
        };

        let outcome = execute(
            &ops,
            TaskKind::VersionUpdate,
            &clone,
            &prev_head,
            "acme/x",
            Some("none"),
        )
        .await
        .unwrap();
        match outcome {
            TaskOutcome::VersionUpdate(out) => {
                assert!(!out.version_changed);
                assert!(!out.rerender_changed);
                assert!(!out.rerender_error);
                assert_eq!(out.info_message, None);
                assert_eq!(out.commit_message, None);
                assert_eq!(out.patch, None);
            }
            _ => panic!("Expected version outcome"),
        }
    }

    #[tokio::test]
    async fn test_execute_version_changed_chains_rerender_and_merges_message() {
        let (_origin, _work, clone, prev_head) = seeded_clone();
        let ops = StubOps {
            version_out: VersionOut {
                changed: true,
                error: false,
                new_version: Some("2.0".into()),
            },
            version_writes: Some(("recipe.yaml", "version: 2\n")),
            rerender_out: RerenderOut {
                changed: true,
                error: false,
                info_message: None,
                commit_message: Some("MNT: rerender".into()),
            },
            rerender_writes: Some(("ci.yaml", "generated: true\n")),
            ..StubOps::noop()
        };

        let outcome = execute(
            &ops,
            TaskKind::VersionUpdate,
            &clone,
            &prev_head,
            "acme/x",
            None,
        )
        .await
        .unwrap();
        match outcome {
            TaskOutcome::VersionUpdate(out) => {
                assert!(out.version_changed);
                assert!(out.rerender_changed);
                assert_eq!(
                    out.commit_message.as_deref(),
                    Some("ENH: updated version to 2.0 & rerender")
                );
                let patch = out.patch.unwrap();
                assert!(patch.contains("version: 2"));
                assert!(patch.contains("generated: true"));
            }
            _ => panic!("Expected version outcome"),
        }
    }

    #[tokio::test]
    async fn test_execute_lint_failure_becomes_data() {
        let (_origin, _work, clone, prev_head) = seeded_clone();
        let ops = StubOps::noop();
        let outcome = execute(&ops, TaskKind::Lint, &clone, &prev_head, "acme/x", None)
            .await
            .unwrap();
        match outcome {
            TaskOutcome::Lint(out) => {
                assert!(out.lint_error);
                assert_eq!(out.lints, None);
                assert_eq!(out.hints, None);
                assert_eq!(out.errors, None);
            }
            _ => panic!("Expected lint outcome"),
        }
    }

    #[tokio::test]
    async fn test_execute_lint_success_captures_findings() {
        let (_origin, _work, clone, prev_head) = seeded_clone();
        let ops = StubOps::noop();
        *ops.lint_out.lock().unwrap() = Some(Ok(LintFindings {
            lints: [("recipe".to_string(), vec!["missing license".to_string()])]
                .into_iter()
                .collect(),
            hints: Default::default(),
            errors: [("recipe".to_string(), false)].into_iter().collect(),
        }));

        let outcome = execute(&ops, TaskKind::Lint, &clone, &prev_head, "acme/x", None)
            .await
            .unwrap();
        match outcome {
            TaskOutcome::Lint(out) => {
                assert!(!out.lint_error);
                assert_eq!(out.lints.unwrap()["recipe"], vec!["missing license"]);
                assert_eq!(out.errors.unwrap()["recipe"], false);
            }
            _ => panic!("Expected lint outcome"),
        }
    }
}
