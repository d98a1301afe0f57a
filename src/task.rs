//! Task identity and the Task Result artifact.
//!
//! The Task Result is the only thing that crosses the trust boundary
//! between the sandboxed runner and the trusted finalizer. It is written
//! once (`create_new`, so a second writer fails instead of clobbering),
//! read once, and treated as untrusted on the way in: strict
//! deserialization plus invariant validation, never execution.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::ArtifactError;

/// File name of the artifact inside the shared task-data directory.
pub const ARTIFACT_FILE: &str = "task_result.json";

/// Commit message prefix the rerender tool puts on its own commits.
/// Stripped when a rerender message is folded into a version-bump message.
pub const RERENDER_COMMIT_PREFIX: &str = "MNT: ";

/// Title of bot-authored rerender PRs; used for draft auto-promotion.
pub const BOT_RERENDER_TITLE: &str = "MNT: rerender";

/// Commit message (and PR title) recorded for a version bump.
pub fn version_update_message(version: &str) -> String {
    format!("ENH: updated version to {version}")
}

/// One task kind per maintenance operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum TaskKind {
    Rerender,
    VersionUpdate,
    Lint,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskKind::Rerender => "rerender",
            TaskKind::VersionUpdate => "version_update",
            TaskKind::Lint => "lint",
        };
        f.write_str(name)
    }
}

/// Per-recipe lint findings (recipe path → messages).
pub type FindingsMap = BTreeMap<String, Vec<String>>;
/// Per-recipe error flags (recipe path → errored).
pub type ErrorMap = BTreeMap<String, bool>;

/// Outcome of a rerender task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RerenderOutcome {
    pub changed: bool,
    pub rerender_error: bool,
    pub info_message: Option<String>,
    pub commit_message: Option<String>,
    pub patch: Option<String>,
}

/// Outcome of a version-update task, including the chained rerender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VersionOutcome {
    pub version_changed: bool,
    pub version_error: bool,
    pub new_version: Option<String>,
    pub rerender_changed: bool,
    pub rerender_error: bool,
    pub info_message: Option<String>,
    pub commit_message: Option<String>,
    pub patch: Option<String>,
}

/// Outcome of a lint task. All-null findings with `lint_error` set means
/// the tool itself failed before producing any findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LintOutcome {
    pub lint_error: bool,
    pub lints: Option<FindingsMap>,
    pub hints: Option<FindingsMap>,
    pub errors: Option<ErrorMap>,
}

/// Kind-specific task results. Untagged: the variants' required fields
/// are disjoint, and each payload struct rejects unknown fields, so a
/// payload can only ever match the variant it was written as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskOutcome {
    Rerender(RerenderOutcome),
    VersionUpdate(VersionOutcome),
    Lint(LintOutcome),
}

impl TaskOutcome {
    fn kind(&self) -> TaskKind {
        match self {
            TaskOutcome::Rerender(_) => TaskKind::Rerender,
            TaskOutcome::VersionUpdate(_) => TaskKind::VersionUpdate,
            TaskOutcome::Lint(_) => TaskKind::Lint,
        }
    }
}

/// The serialized record handed from the sandboxed phase to the trusted
/// phase. `sha` is the commit the dispatching workflow wants statuses
/// keyed to; it is echoed, never derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskResult {
    pub task: TaskKind,
    pub repo: String,
    pub pr_number: u64,
    pub sha: Option<String>,
    pub task_results: TaskOutcome,
}

impl TaskResult {
    /// Check the cross-field invariants the schema alone cannot express.
    pub fn validate(&self) -> Result<(), ArtifactError> {
        if self.task != self.task_results.kind() {
            return Err(ArtifactError::KindMismatch {
                task: self.task.to_string(),
                outcome: self.task_results.kind().to_string(),
            });
        }

        match &self.task_results {
            TaskOutcome::Rerender(out) => {
                if out.patch.is_some() && !out.changed {
                    return Err(ArtifactError::PatchWithoutChange);
                }
                if out.commit_message.is_some() && out.patch.is_none() {
                    return Err(ArtifactError::MessageWithoutCommit);
                }
            }
            TaskOutcome::VersionUpdate(out) => {
                if out.patch.is_some() && !out.version_changed {
                    return Err(ArtifactError::PatchWithoutChange);
                }
                // The version bump records its message before the chained
                // rerender runs, so a message without a patch is legal --
                // but only once the version actually changed.
                if out.commit_message.is_some() && !out.version_changed {
                    return Err(ArtifactError::MessageWithoutCommit);
                }
                if !out.version_changed
                    && (out.rerender_changed
                        || out.rerender_error
                        || out.info_message.is_some()
                        || out.commit_message.is_some()
                        || out.patch.is_some())
                {
                    return Err(ArtifactError::RerenderOnUnchangedVersion);
                }
            }
            TaskOutcome::Lint(out) => {
                let present = [
                    out.lints.is_some(),
                    out.hints.is_some(),
                    out.errors.is_some(),
                ];
                if present.iter().any(|p| *p) && !present.iter().all(|p| *p) {
                    return Err(ArtifactError::PartialFindings);
                }
                if out.lints.is_none() && !out.lint_error {
                    return Err(ArtifactError::MissingFindingsWithoutError);
                }
            }
        }

        Ok(())
    }

    /// Serialize into `<dir>/task_result.json`. Fails if the artifact
    /// already exists: the store is single-writer by contract.
    pub fn write(&self, dir: &Path) -> Result<PathBuf, ArtifactError> {
        self.validate()?;
        let path = dir.join(ARTIFACT_FILE);
        let file = fs::File::create_new(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::AlreadyExists {
                ArtifactError::AlreadyExists { path: path.clone() }
            } else {
                ArtifactError::Io {
                    path: path.clone(),
                    source,
                }
            }
        })?;
        serde_json::to_writer(file, self).map_err(ArtifactError::Malformed)?;
        Ok(path)
    }

    /// Load and validate the artifact from `<dir>/task_result.json`.
    pub fn load(dir: &Path) -> Result<Self, ArtifactError> {
        let path = dir.join(ARTIFACT_FILE);
        let raw = fs::read_to_string(&path).map_err(|source| ArtifactError::Io {
            path: path.clone(),
            source,
        })?;
        let result: TaskResult = serde_json::from_str(&raw).map_err(ArtifactError::Malformed)?;
        result.validate()?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rerender_result() -> TaskResult {
        TaskResult {
            task: TaskKind::Rerender,
            repo: "zlib-feedstock".into(),
            pr_number: 42,
            sha: Some("deadbeef".into()),
            task_results: TaskOutcome::Rerender(RerenderOutcome {
                changed: true,
                rerender_error: false,
                info_message: None,
                commit_message: Some("MNT: rerender".into()),
                patch: Some("--- a/x\n+++ b/x\n".into()),
            }),
        }
    }

    #[test]
    fn test_round_trip_preserves_variant() {
        let result = rerender_result();
        let json = serde_json::to_string(&result).unwrap();
        let back: TaskResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
        assert!(matches!(back.task_results, TaskOutcome::Rerender(_)));
    }

    #[test]
    fn test_version_payload_parses_as_version_variant() {
        let json = serde_json::json!({
            "task": "version_update",
            "repo": "zlib-feedstock",
            "pr_number": 7,
            "sha": null,
            "task_results": {
                "version_changed": true,
                "version_error": false,
                "new_version": "1.3.1",
                "rerender_changed": true,
                "rerender_error": false,
                "info_message": null,
                "commit_message": "ENH: updated version to 1.3.1 & rerender",
                "patch": "diff"
            }
        });
        let result: TaskResult = serde_json::from_value(json).unwrap();
        assert!(matches!(result.task_results, TaskOutcome::VersionUpdate(_)));
        assert!(result.validate().is_ok());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let json = serde_json::json!({
            "task": "lint",
            "repo": "x",
            "pr_number": 1,
            "sha": null,
            "task_results": {
                "lint_error": true,
                "lints": null,
                "hints": null,
                "errors": null,
                "extra": "nope"
            }
        });
        assert!(serde_json::from_value::<TaskResult>(json).is_err());
    }

    #[test]
    fn test_kind_outcome_mismatch_rejected() {
        let mut result = rerender_result();
        result.task = TaskKind::Lint;
        assert!(matches!(
            result.validate(),
            Err(ArtifactError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_patch_without_change_rejected() {
        let mut result = rerender_result();
        if let TaskOutcome::Rerender(out) = &mut result.task_results {
            out.changed = false;
        }
        assert!(matches!(
            result.validate(),
            Err(ArtifactError::PatchWithoutChange)
        ));
    }

    #[test]
    fn test_message_without_patch_rejected_for_rerender() {
        let mut result = rerender_result();
        if let TaskOutcome::Rerender(out) = &mut result.task_results {
            out.patch = None;
            out.changed = false;
        }
        assert!(matches!(
            result.validate(),
            Err(ArtifactError::MessageWithoutCommit)
        ));
    }

    #[test]
    fn test_version_message_without_patch_is_legal() {
        // A bump whose chained rerender produced no extra content still
        // records the bump message before the patch is captured.
        let result = TaskResult {
            task: TaskKind::VersionUpdate,
            repo: "x".into(),
            pr_number: 1,
            sha: None,
            task_results: TaskOutcome::VersionUpdate(VersionOutcome {
                version_changed: true,
                version_error: false,
                new_version: Some("2.0".into()),
                rerender_changed: false,
                rerender_error: false,
                info_message: None,
                commit_message: Some(version_update_message("2.0")),
                patch: None,
            }),
        };
        assert!(result.validate().is_ok());
    }

    #[test]
    fn test_unchanged_version_forbids_rerender_fields() {
        let result = TaskResult {
            task: TaskKind::VersionUpdate,
            repo: "x".into(),
            pr_number: 1,
            sha: None,
            task_results: TaskOutcome::VersionUpdate(VersionOutcome {
                version_changed: false,
                version_error: false,
                new_version: None,
                rerender_changed: true,
                rerender_error: false,
                info_message: None,
                commit_message: None,
                patch: None,
            }),
        };
        assert!(matches!(
            result.validate(),
            Err(ArtifactError::RerenderOnUnchangedVersion)
        ));
    }

    #[test]
    fn test_partial_lint_findings_rejected() {
        let result = TaskResult {
            task: TaskKind::Lint,
            repo: "x".into(),
            pr_number: 1,
            sha: None,
            task_results: TaskOutcome::Lint(LintOutcome {
                lint_error: false,
                lints: Some(FindingsMap::new()),
                hints: None,
                errors: None,
            }),
        };
        assert!(matches!(
            result.validate(),
            Err(ArtifactError::PartialFindings)
        ));
    }

    #[test]
    fn test_null_findings_require_lint_error() {
        let result = TaskResult {
            task: TaskKind::Lint,
            repo: "x".into(),
            pr_number: 1,
            sha: None,
            task_results: TaskOutcome::Lint(LintOutcome {
                lint_error: false,
                lints: None,
                hints: None,
                errors: None,
            }),
        };
        assert!(matches!(
            result.validate(),
            Err(ArtifactError::MissingFindingsWithoutError)
        ));
    }

    #[test]
    fn test_write_is_write_once() {
        let dir = tempdir().unwrap();
        let result = rerender_result();
        result.write(dir.path()).unwrap();
        assert!(matches!(
            result.write(dir.path()),
            Err(ArtifactError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_write_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let result = rerender_result();
        result.write(dir.path()).unwrap();
        let back = TaskResult::load(dir.path()).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_load_missing_artifact_is_io_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            TaskResult::load(dir.path()),
            Err(ArtifactError::Io { .. })
        ));
    }

    #[test]
    fn test_version_update_message_format() {
        assert_eq!(
            version_update_message("1.2.3"),
            "ENH: updated version to 1.2.3"
        );
    }
}
