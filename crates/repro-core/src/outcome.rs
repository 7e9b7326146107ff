use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: CommandStatus,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl ExecutionOutcome {
    pub fn success(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::Ok,
            message: message.into(),
            details,
        }
    }

    pub fn failure(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::Failure,
            message: message.into(),
            details,
        }
    }

    pub fn user_error(message: impl Into<String>, details: Value) -> Self {
        Self {
            status: CommandStatus::UserError,
            message: message.into(),
            details,
        }
    }

    /// Map an error raised while running a command onto an outcome.
    ///
    /// `ReproError`s anywhere in the chain become user errors (or failures for
    /// build tool crashes); anything else is reported as an internal failure.
    #[must_use]
    pub fn from_error(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<ReproError>() {
            Some(repro) => {
                let details = repro.details();
                if repro.is_user_error() {
                    Self::user_error(repro.to_string(), details)
                } else {
                    Self::failure(repro.to_string(), details)
                }
            }
            None => Self::failure(
                format!("{err:#}"),
                json!({ "reason": "internal_error" }),
            ),
        }
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.status {
            CommandStatus::Ok => 0,
            CommandStatus::UserError => 1,
            CommandStatus::Failure => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CommandStatus {
    Ok,
    UserError,
    Failure,
}

#[derive(thiserror::Error, Debug)]
pub enum ReproError {
    #[error("{} is not a git repository or source distribution", .0.display())]
    InvalidInput(PathBuf),
    #[error("{} is not a file", .0.display())]
    MissingFile(PathBuf),
    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("invalid SOURCE_DATE_EPOCH value `{0}`")]
    InvalidEpoch(String),
    #[error("{} contains no members", .0.display())]
    EmptyArchive(PathBuf),
    #[error("{tool} exited with status {code}")]
    BuildFailed {
        tool: String,
        code: i32,
        stderr: String,
    },
    #[error("{tool} did not produce a {kind} in {}", .dir.display())]
    MissingArtifact {
        tool: String,
        kind: &'static str,
        dir: PathBuf,
    },
}

impl ReproError {
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        !matches!(
            self,
            ReproError::BuildFailed { .. } | ReproError::MissingArtifact { .. }
        )
    }

    #[must_use]
    pub fn details(&self) -> Value {
        match self {
            ReproError::InvalidInput(path) => json!({
                "reason": "invalid_input",
                "path": path.display().to_string(),
                "hint": "pass a git repository root, a source tree or a .tar.gz sdist",
            }),
            ReproError::MissingFile(path) => json!({
                "reason": "missing_file",
                "path": path.display().to_string(),
            }),
            ReproError::NotADirectory(path) => json!({
                "reason": "not_a_directory",
                "path": path.display().to_string(),
            }),
            ReproError::InvalidEpoch(raw) => json!({
                "reason": "invalid_epoch",
                "value": raw,
                "hint": "SOURCE_DATE_EPOCH must be a non-negative number of seconds",
            }),
            ReproError::EmptyArchive(path) => json!({
                "reason": "empty_archive",
                "path": path.display().to_string(),
            }),
            ReproError::BuildFailed { tool, code, stderr } => json!({
                "reason": "build_failed",
                "tool": tool,
                "code": code,
                "stderr": stderr,
            }),
            ReproError::MissingArtifact { tool, kind, dir } => json!({
                "reason": "missing_artifact",
                "tool": tool,
                "kind": kind,
                "dir": dir.display().to_string(),
            }),
        }
    }
}
