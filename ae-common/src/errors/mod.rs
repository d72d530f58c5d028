//! Error types for the workspace lifecycle.
//!
//! [`LifecycleError`] is the single error type surfaced by the controller.
//! Each variant wraps a detail enum so callers can match on the kind first
//! and the detail second. Every detail maps to a stable [`ErrorCode`].

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Malformed CLI/API input or malformed server response.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{0}")]
    Invalid(String),

    #[error("ground-truth patch is empty")]
    EmptyGroundTruthPatch,

    #[error("prompt is empty")]
    EmptyPrompt,

    #[error("workspace does not exist: {}", path.display())]
    WorkspaceNotFound { path: PathBuf },

    #[error("not a git repository: {}", path.display())]
    NotARepository { path: PathBuf },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("state file {}: {detail}", path.display())]
    StateFile { path: PathBuf, detail: String },

    #[error("unexpected response shape from {endpoint}: {detail}")]
    ResponseShape { endpoint: String, detail: String },

    #[error("cannot load ground-truth patch from {origin}: {detail}")]
    PatchSource { origin: String, detail: String },
}

/// Sidecar, backup-directory and restore-boundary failures.
#[derive(Debug, Error)]
pub enum BackupIntegrityError {
    #[error("sidecar from {source_label} failed validation: {detail}")]
    SidecarSchema {
        source_label: &'static str,
        detail: String,
    },

    #[error("backup directory is not plausible ({reason}): {}", path.display())]
    Implausible { path: PathBuf, reason: String },

    #[error("restore path escapes workspace: {}", path.display())]
    PathEscape { path: PathBuf },

    #[error("backup has no .git directory: {}", path.display())]
    MissingGit { path: PathBuf },

    #[error("no sidecar found for workspace {}", workspace.display())]
    NoSidecar { workspace: PathBuf },

    #[error(
        "only the in-workspace sidecar was available; .git was not restored and the workspace needs manual intervention"
    )]
    UntrustedSource,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// git subprocess failures.
#[derive(Debug, Error)]
pub enum GitOperationError {
    #[error("failed to spawn `git {args}`: {source}")]
    Spawn {
        args: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`git {args}` timed out after {secs}s")]
    Timeout { args: String, secs: u64 },

    #[error("`git {args}` failed (exit {code:?}): {stderr}")]
    Failed {
        args: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("branch not found: {branch}")]
    BranchNotFound { branch: String },

    #[error("could not reverse-apply ground-truth patch: {detail}")]
    ReverseApply { detail: String },

    #[error("HEAD mismatch after restore: expected {expected}, got {actual}")]
    HeadMismatch { expected: String, actual: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Agent server failures.
#[derive(Debug, Error)]
pub enum AgentCommunicationError {
    #[error("agent server at {url} is unhealthy: {detail}")]
    Unhealthy { url: String, detail: String },

    #[error("session creation failed: {detail}")]
    SessionCreate { detail: String },

    #[error("{endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("{endpoint}: {detail}")]
    Transport { endpoint: String, detail: String },

    #[error("no assistant reply in session {session_id} after {waited_secs}s")]
    NoAssistantReply { session_id: String, waited_secs: u64 },
}

/// Problems with the diff the agent left behind.
#[derive(Debug, Error)]
pub enum PatchValidationError {
    #[error("agent produced an empty diff")]
    Empty,

    #[error("malformed diff block for {file}: {reason}")]
    Malformed { file: String, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level lifecycle error.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("backup integrity error: {0}")]
    BackupIntegrity(#[from] BackupIntegrityError),

    #[error("git operation error: {0}")]
    GitOperation(#[from] GitOperationError),

    #[error("agent communication error: {0}")]
    AgentCommunication(#[from] AgentCommunicationError),

    #[error("patch validation error: {0}")]
    PatchValidation(#[from] PatchValidationError),

    #[error("cancelled")]
    Cancelled,
}

/// Coarse error kind recorded in trajectories and run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    BackupIntegrity,
    GitOperation,
    AgentCommunication,
    PatchValidation,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::BackupIntegrity => "backup_integrity",
            Self::GitOperation => "git_operation",
            Self::AgentCommunication => "agent_communication",
            Self::PatchValidation => "patch_validation",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::BackupIntegrity(_) => ErrorKind::BackupIntegrity,
            Self::GitOperation(_) => ErrorKind::GitOperation,
            Self::AgentCommunication(_) => ErrorKind::AgentCommunication,
            Self::PatchValidation(_) => ErrorKind::PatchValidation,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the retry loop should start a fresh session after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AgentCommunication(_) | Self::PatchValidation(_) => true,
            Self::Validation(ValidationError::ResponseShape { .. }) => true,
            _ => false,
        }
    }

    /// Whether this error means the workspace could not be reconciled.
    pub fn needs_manual_intervention(&self) -> bool {
        matches!(
            self,
            Self::GitOperation(GitOperationError::HeadMismatch { .. })
                | Self::BackupIntegrity(
                    BackupIntegrityError::UntrustedSource
                        | BackupIntegrityError::MissingGit { .. }
                        | BackupIntegrityError::Implausible { .. }
                        | BackupIntegrityError::SidecarSchema { .. }
                )
        )
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(e) => match e {
                ValidationError::Invalid(_) => ErrorCode::InvalidInput,
                ValidationError::EmptyGroundTruthPatch => ErrorCode::EmptyGroundTruthPatch,
                ValidationError::EmptyPrompt => ErrorCode::EmptyPrompt,
                ValidationError::WorkspaceNotFound { .. } => ErrorCode::WorkspaceNotFound,
                ValidationError::NotARepository { .. } => ErrorCode::NotARepository,
                ValidationError::Config(_) => ErrorCode::ConfigInvalid,
                ValidationError::StateFile { .. } => ErrorCode::StateFileInvalid,
                ValidationError::ResponseShape { .. } => ErrorCode::ResponseShape,
                ValidationError::PatchSource { .. } => ErrorCode::PatchSourceUnavailable,
            },
            Self::BackupIntegrity(e) => match e {
                BackupIntegrityError::SidecarSchema { .. } => ErrorCode::SidecarInvalid,
                BackupIntegrityError::Implausible { .. } => ErrorCode::BackupImplausible,
                BackupIntegrityError::PathEscape { .. } => ErrorCode::RestorePathEscape,
                BackupIntegrityError::MissingGit { .. } => ErrorCode::BackupMissingGit,
                BackupIntegrityError::NoSidecar { .. } => ErrorCode::SidecarMissing,
                BackupIntegrityError::UntrustedSource => ErrorCode::UntrustedBackupSource,
                BackupIntegrityError::Io { .. } => ErrorCode::BackupIo,
            },
            Self::GitOperation(e) => match e {
                GitOperationError::Spawn { .. } => ErrorCode::GitSpawnFailed,
                GitOperationError::Timeout { .. } => ErrorCode::GitTimeout,
                GitOperationError::Failed { .. } => ErrorCode::GitCommandFailed,
                GitOperationError::BranchNotFound { .. } => ErrorCode::BranchNotFound,
                GitOperationError::ReverseApply { .. } => ErrorCode::ReverseApplyFailed,
                GitOperationError::HeadMismatch { .. } => ErrorCode::HeadMismatch,
                GitOperationError::Io { .. } => ErrorCode::GitIo,
            },
            Self::AgentCommunication(e) => match e {
                AgentCommunicationError::Unhealthy { .. } => ErrorCode::AgentUnhealthy,
                AgentCommunicationError::SessionCreate { .. } => ErrorCode::SessionCreateFailed,
                AgentCommunicationError::Timeout { .. } => ErrorCode::AgentTimeout,
                AgentCommunicationError::Status { .. } => ErrorCode::AgentHttpStatus,
                AgentCommunicationError::Transport { .. } => ErrorCode::AgentTransport,
                AgentCommunicationError::NoAssistantReply { .. } => ErrorCode::NoAssistantReply,
            },
            Self::PatchValidation(e) => match e {
                PatchValidationError::Empty => ErrorCode::PatchEmpty,
                PatchValidationError::Malformed { .. } => ErrorCode::PatchMalformed,
                PatchValidationError::Io { .. } => ErrorCode::PatchIo,
            },
            Self::Cancelled => ErrorCode::Cancelled,
        }
    }
}

pub type Result<T, E = LifecycleError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        let timeout: LifecycleError = AgentCommunicationError::Timeout {
            endpoint: "POST /session".into(),
        }
        .into();
        assert!(timeout.is_retryable());

        let shape: LifecycleError = ValidationError::ResponseShape {
            endpoint: "POST /session".into(),
            detail: "expected object".into(),
        }
        .into();
        assert!(shape.is_retryable());

        let empty: LifecycleError = PatchValidationError::Empty.into();
        assert!(empty.is_retryable());

        let git: LifecycleError = GitOperationError::Failed {
            args: "reset --hard".into(),
            code: Some(1),
            stderr: String::new(),
        }
        .into();
        assert!(!git.is_retryable());
        assert!(!LifecycleError::Cancelled.is_retryable());
        let cfg: LifecycleError = ValidationError::Config("bad".into()).into();
        assert!(!cfg.is_retryable());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let err: LifecycleError = PatchValidationError::Empty.into();
        assert_eq!(err.kind(), ErrorKind::PatchValidation);
        assert_eq!(
            serde_json::to_string(&err.kind()).unwrap(),
            "\"patch_validation\""
        );
        assert_eq!(err.kind().to_string(), "patch_validation");
    }

    #[test]
    fn test_codes_match_kind_category() {
        let err: LifecycleError = GitOperationError::HeadMismatch {
            expected: "a".into(),
            actual: "b".into(),
        }
        .into();
        assert_eq!(err.code(), ErrorCode::HeadMismatch);
        assert_eq!(err.code().category(), ErrorCategory::GitOperation);
        assert!(err.needs_manual_intervention());
    }
}
