//! Typed error hierarchy for stoker.
//!
//! Two top-level enums cover the two validation-heavy subsystems:
//! - `ArtifactError` — Task Result schema and invariant violations
//! - `OpsError` — container tool invocation failures

use thiserror::Error;

/// Errors raised while loading or validating a Task Result artifact.
///
/// The artifact crosses a trust boundary: it is produced by the sandboxed
/// runner and consumed by the trusted finalizer, so every violation gets
/// its own matchable variant instead of a stringly-typed message.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Failed to read task result at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Task result already exists at {path}")]
    AlreadyExists { path: std::path::PathBuf },

    #[error("Malformed task result: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Task kind `{task}` does not match the `{outcome}` outcome payload")]
    KindMismatch { task: String, outcome: String },

    #[error("Task result carries a patch but reports no change")]
    PatchWithoutChange,

    #[error("Task result carries a commit message but neither a patch nor a version bump")]
    MessageWithoutCommit,

    #[error("Chained rerender fields are set although the version did not change")]
    RerenderOnUnchangedVersion,

    #[error("Lint findings are partially populated; lints, hints, and errors must be all present or all null")]
    PartialFindings,

    #[error("Lint findings are null but lint_error is not set")]
    MissingFindingsWithoutError,
}

/// Errors from invoking the sandboxed container tool.
#[derive(Debug, Error)]
pub enum OpsError {
    #[error("Failed to spawn container tool: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Container tool exited with {code:?}: {stderr}")]
    ToolFailed { code: Option<i32>, stderr: String },

    #[error("Failed to decode container tool output: {0}")]
    Decode(#[source] serde_json::Error),
}
