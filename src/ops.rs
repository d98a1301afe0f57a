//! Opaque feedstock tool operations.
//!
//! The actual rerender/version-detection/lint algorithms live in a
//! container image and are consumed through one narrow capability: run,
//! return a structured outcome. `FeedstockOps` is the seam; the
//! container implementation is the only one shipped, but the finalizer
//! and tests never need to know that.
//!
//! Rerender and version outcomes report tool failures as data (`error`
//! flags) rather than `Err`: the trusted phase has to distinguish "tool
//! ran and reported a problem" from "pipeline infrastructure failed",
//! and a crashed runner would erase that distinction. Lint is the
//! exception: its failures propagate as `OpsError` so the runner can
//! fold them into `lint_error` with the full error chain logged.

use std::path::Path;

use async_trait::async_trait;
use bollard::Docker;
use bollard::query_parameters::CreateImageOptionsBuilder;
use futures_util::TryStreamExt;
use serde::Deserialize;
use tokio::process::Command;
use tracing::warn;

use crate::errors::OpsError;
use crate::task::{ErrorMap, FindingsMap};

/// Mount point of the feedstock working copy inside the tool container.
const CONTAINER_WORKDIR: &str = "/feedstock";
/// Tool binary shipped in the container image.
const TOOL_BIN: &str = "feedstock-ops";

/// Outcome of the rerender operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RerenderOut {
    pub changed: bool,
    pub error: bool,
    pub info_message: Option<String>,
    pub commit_message: Option<String>,
}

impl RerenderOut {
    fn failed(info: String) -> Self {
        Self {
            changed: false,
            error: true,
            info_message: Some(info),
            commit_message: None,
        }
    }
}

/// Outcome of the version-detection/bump operation.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionOut {
    pub changed: bool,
    pub error: bool,
    pub new_version: Option<String>,
}

impl VersionOut {
    fn failed() -> Self {
        Self {
            changed: false,
            error: true,
            new_version: None,
        }
    }
}

/// Normalized lint findings. Always carries all three maps; the legacy
/// findings-only tool output is normalized before this type exists.
#[derive(Debug, Clone, PartialEq)]
pub struct LintFindings {
    pub lints: FindingsMap,
    pub hints: FindingsMap,
    pub errors: ErrorMap,
}

#[derive(Debug, Deserialize)]
struct RawRerender {
    changed: bool,
    error: bool,
    info_message: Option<String>,
    commit_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawVersion {
    changed: bool,
    error: bool,
    new_version: Option<String>,
}

/// The lint tool historically returned findings only; newer builds add a
/// per-recipe error map. Both decode into this shape.
#[derive(Debug, Deserialize)]
struct RawLint {
    lints: FindingsMap,
    hints: FindingsMap,
    errors: Option<ErrorMap>,
}

/// A missing error map is the degraded/legacy variant: synthesize
/// all-false over the union of the findings keys.
fn normalize_lint(raw: RawLint) -> LintFindings {
    let errors = match raw.errors {
        Some(errors) => errors,
        None => raw
            .lints
            .keys()
            .chain(raw.hints.keys())
            .map(|key| (key.clone(), false))
            .collect(),
    };
    LintFindings {
        lints: raw.lints,
        hints: raw.hints,
        errors,
    }
}

/// One opaque operation per task kind.
#[async_trait]
pub trait FeedstockOps {
    async fn rerender(&self, workdir: &Path) -> RerenderOut;
    async fn update_version(
        &self,
        workdir: &Path,
        full_repo: &str,
        input_version: Option<&str>,
    ) -> VersionOut;
    async fn lint(&self, workdir: &Path) -> Result<LintFindings, OpsError>;
}

/// Container-backed implementation of the feedstock tool.
pub struct ContainerOps {
    image: String,
}

impl ContainerOps {
    pub fn new(image: String) -> Self {
        Self { image }
    }

    /// Pull the tool image. Callers tolerate failure here: an
    /// interrupted pull must not silently skip the task, so the
    /// subsequent tool invocation is relied on to surface the real
    /// error.
    pub async fn pull_image(&self) -> anyhow::Result<()> {
        let docker = Docker::connect_with_local_defaults()?;
        let options = CreateImageOptionsBuilder::default()
            .from_image(&self.image)
            .build();
        docker
            .create_image(Some(options), None, None)
            .try_for_each(|_progress| async { Ok(()) })
            .await?;
        Ok(())
    }

    async fn run_tool(&self, workdir: &Path, args: &[&str]) -> Result<Vec<u8>, OpsError> {
        let mount = format!(
            "type=bind,src={},dst={CONTAINER_WORKDIR}",
            workdir.display()
        );
        let output = Command::new("docker")
            .args(["run", "--rm", "--mount", &mount, &self.image, TOOL_BIN])
            .args(args)
            .output()
            .await
            .map_err(OpsError::Spawn)?;

        if !output.status.success() {
            return Err(OpsError::ToolFailed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl FeedstockOps for ContainerOps {
    async fn rerender(&self, workdir: &Path) -> RerenderOut {
        let raw: Result<RawRerender, OpsError> = self
            .run_tool(workdir, &["rerender", "--feedstock-dir", CONTAINER_WORKDIR])
            .await
            .and_then(|stdout| serde_json::from_slice(&stdout).map_err(OpsError::Decode));

        match raw {
            Ok(out) => RerenderOut {
                changed: out.changed,
                error: out.error,
                info_message: out.info_message,
                commit_message: out.commit_message,
            },
            Err(err) => {
                warn!("rerender tool invocation failed: {err}");
                RerenderOut::failed(format!("The rerender tool failed to run: {err}"))
            }
        }
    }

    async fn update_version(
        &self,
        workdir: &Path,
        full_repo: &str,
        input_version: Option<&str>,
    ) -> VersionOut {
        let mut args = vec![
            "update-version",
            "--feedstock-dir",
            CONTAINER_WORKDIR,
            "--repo",
            full_repo,
        ];
        if let Some(version) = input_version {
            args.push("--version");
            args.push(version);
        }

        let raw: Result<RawVersion, OpsError> = self
            .run_tool(workdir, &args)
            .await
            .and_then(|stdout| serde_json::from_slice(&stdout).map_err(OpsError::Decode));

        match raw {
            Ok(out) => VersionOut {
                changed: out.changed,
                error: out.error,
                new_version: out.new_version,
            },
            Err(err) => {
                warn!("version tool invocation failed: {err}");
                VersionOut::failed()
            }
        }
    }

    async fn lint(&self, workdir: &Path) -> Result<LintFindings, OpsError> {
        let stdout = self
            .run_tool(workdir, &["lint", "--feedstock-dir", CONTAINER_WORKDIR])
            .await?;
        let raw: RawLint = serde_json::from_slice(&stdout).map_err(OpsError::Decode)?;
        Ok(normalize_lint(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn findings(pairs: &[(&str, &[&str])]) -> FindingsMap {
        pairs
            .iter()
            .map(|(key, msgs)| {
                (
                    key.to_string(),
                    msgs.iter().map(|m| m.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_normalize_lint_keeps_explicit_error_map() {
        let raw = RawLint {
            lints: findings(&[("recipe", &["missing license"])]),
            hints: FindingsMap::new(),
            errors: Some([("recipe".to_string(), true)].into_iter().collect()),
        };
        let normalized = normalize_lint(raw);
        assert_eq!(normalized.errors.get("recipe"), Some(&true));
    }

    #[test]
    fn test_normalize_lint_synthesizes_all_false_over_union() {
        let raw = RawLint {
            lints: findings(&[("recipe/a", &["lint"])]),
            hints: findings(&[("recipe/b", &["hint"])]),
            errors: None,
        };
        let normalized = normalize_lint(raw);
        assert_eq!(normalized.errors.len(), 2);
        assert_eq!(normalized.errors.get("recipe/a"), Some(&false));
        assert_eq!(normalized.errors.get("recipe/b"), Some(&false));
    }

    #[test]
    fn test_raw_lint_decodes_without_error_map() {
        let raw: RawLint = serde_json::from_str(
            r#"{"lints": {"recipe": []}, "hints": {"recipe": ["tidy up"]}}"#,
        )
        .unwrap();
        assert!(raw.errors.is_none());
        let normalized = normalize_lint(raw);
        assert_eq!(normalized.errors.get("recipe"), Some(&false));
    }

    #[test]
    fn test_rerender_failure_outcome_is_data() {
        let out = RerenderOut::failed("boom".into());
        assert!(out.error);
        assert!(!out.changed);
        assert!(out.commit_message.is_none());
    }
}
