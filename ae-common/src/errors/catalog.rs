//! Error Catalog for Agent Eval
//!
//! Every failure the lifecycle can surface maps to a stable code in the
//! `AE-Exxx` format, a category, a message template and remediation steps.
//!
//! # Error Code Ranges
//!
//! | Range      | Category          | Description                              |
//! |------------|-------------------|------------------------------------------|
//! | E001-E099  | Validation        | Bad input, config or server response     |
//! | E100-E199  | BackupIntegrity   | Sidecar, backup directory, path escapes  |
//! | E200-E299  | GitOperation      | git subprocess failures                  |
//! | E300-E399  | AgentCommunication| Agent server connectivity and replies    |
//! | E400-E499  | PatchValidation   | Extracted patch problems                 |
//! | E500-E599  | Internal          | Cancellation and unexpected errors       |
//!
//! # Example
//!
//! ```rust
//! use ae_common::errors::catalog::ErrorCode;
//!
//! let entry = ErrorCode::HeadMismatch.entry();
//! println!("Error {}: {}", entry.code, entry.message);
//! for step in entry.remediation {
//!     println!("  - {}", step);
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration covering all Agent Eval error scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Validation Errors (E001-E099)
    // =========================================================================
    /// Generic malformed input
    InvalidInput,
    /// Ground-truth patch is empty
    EmptyGroundTruthPatch,
    /// Prompt file is empty
    EmptyPrompt,
    /// Workspace directory does not exist
    WorkspaceNotFound,
    /// Workspace is not a git repository
    NotARepository,
    /// Configuration file or environment is invalid
    ConfigInvalid,
    /// State file is missing or malformed
    StateFileInvalid,
    /// Agent server returned an unexpected JSON shape
    ResponseShape,
    /// Ground-truth patch could not be loaded
    PatchSourceUnavailable,

    // =========================================================================
    // Backup Integrity Errors (E100-E199)
    // =========================================================================
    /// Sidecar record failed schema validation
    SidecarInvalid,
    /// Backup directory failed the plausibility check
    BackupImplausible,
    /// A restore path escaped the workspace boundary
    RestorePathEscape,
    /// Backup directory has no git directory to restore
    BackupMissingGit,
    /// No sidecar could be found at any trust level
    SidecarMissing,
    /// Only the in-workspace sidecar was available
    UntrustedBackupSource,
    /// Filesystem error while handling the backup
    BackupIo,

    // =========================================================================
    // Git Operation Errors (E200-E299)
    // =========================================================================
    /// git binary could not be spawned
    GitSpawnFailed,
    /// git command exceeded its timeout
    GitTimeout,
    /// git command exited non-zero
    GitCommandFailed,
    /// Target branch could not be found or fetched
    BranchNotFound,
    /// Ground-truth patch could not be reverse-applied
    ReverseApplyFailed,
    /// HEAD after restore differs from the recorded HEAD
    HeadMismatch,
    /// Filesystem error while manipulating the repository
    GitIo,

    // =========================================================================
    // Agent Communication Errors (E300-E399)
    // =========================================================================
    /// Agent server health check failed
    AgentUnhealthy,
    /// Session could not be created
    SessionCreateFailed,
    /// Request to the agent server timed out
    AgentTimeout,
    /// Agent server returned an error status
    AgentHttpStatus,
    /// Transport-level failure talking to the agent server
    AgentTransport,
    /// No assistant reply arrived before the poll deadline
    NoAssistantReply,

    // =========================================================================
    // Patch Validation Errors (E400-E499)
    // =========================================================================
    /// Agent produced no changes
    PatchEmpty,
    /// Extracted diff is not a well-formed unified diff
    PatchMalformed,
    /// Patch artifact could not be written
    PatchIo,

    // =========================================================================
    // Internal Errors (E500-E599)
    // =========================================================================
    /// Run was cancelled by the operator
    Cancelled,
}

impl ErrorCode {
    /// Returns the numeric part of the code.
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            Self::InvalidInput => 1,
            Self::EmptyGroundTruthPatch => 2,
            Self::EmptyPrompt => 3,
            Self::WorkspaceNotFound => 4,
            Self::NotARepository => 5,
            Self::ConfigInvalid => 6,
            Self::StateFileInvalid => 7,
            Self::ResponseShape => 8,
            Self::PatchSourceUnavailable => 9,

            Self::SidecarInvalid => 100,
            Self::BackupImplausible => 101,
            Self::RestorePathEscape => 102,
            Self::BackupMissingGit => 103,
            Self::SidecarMissing => 104,
            Self::UntrustedBackupSource => 105,
            Self::BackupIo => 106,

            Self::GitSpawnFailed => 200,
            Self::GitTimeout => 201,
            Self::GitCommandFailed => 202,
            Self::BranchNotFound => 203,
            Self::ReverseApplyFailed => 204,
            Self::HeadMismatch => 205,
            Self::GitIo => 206,

            Self::AgentUnhealthy => 300,
            Self::SessionCreateFailed => 301,
            Self::AgentTimeout => 302,
            Self::AgentHttpStatus => 303,
            Self::AgentTransport => 304,
            Self::NoAssistantReply => 305,

            Self::PatchEmpty => 400,
            Self::PatchMalformed => 401,
            Self::PatchIo => 402,

            Self::Cancelled => 500,
        }
    }

    /// Returns the formatted error code string (e.g., "AE-E001").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("AE-E{:03}", self.code_number())
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Validation,
            100..=199 => ErrorCategory::BackupIntegrity,
            200..=299 => ErrorCategory::GitOperation,
            300..=399 => ErrorCategory::AgentCommunication,
            400..=499 => ErrorCategory::PatchValidation,
            _ => ErrorCategory::Internal,
        }
    }

    /// Returns the full error entry with all metadata.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Returns the error message template.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::InvalidInput => "Input is malformed",
            Self::EmptyGroundTruthPatch => "Ground-truth patch is empty",
            Self::EmptyPrompt => "Prompt file is empty",
            Self::WorkspaceNotFound => "Workspace directory does not exist",
            Self::NotARepository => "Workspace is not a git repository",
            Self::ConfigInvalid => "Configuration contains invalid values",
            Self::StateFileInvalid => "Workspace state file is missing or malformed",
            Self::ResponseShape => "Agent server response has an unexpected shape",
            Self::PatchSourceUnavailable => "Ground-truth patch could not be loaded",

            Self::SidecarInvalid => "Sidecar metadata failed validation",
            Self::BackupImplausible => "Backup directory does not look like one this tool created",
            Self::RestorePathEscape => "Restore path resolves outside the workspace",
            Self::BackupMissingGit => "Backup directory does not contain a git directory",
            Self::SidecarMissing => "No sidecar metadata found for this workspace",
            Self::UntrustedBackupSource => {
                "Only the in-workspace sidecar was found; git history was not restored"
            }
            Self::BackupIo => "Filesystem error while handling the backup",

            Self::GitSpawnFailed => "Failed to start git",
            Self::GitTimeout => "git command timed out",
            Self::GitCommandFailed => "git command failed",
            Self::BranchNotFound => "Target branch not found locally or on the remote",
            Self::ReverseApplyFailed => "Ground-truth patch could not be reverse-applied",
            Self::HeadMismatch => "Restored HEAD does not match the recorded HEAD",
            Self::GitIo => "Filesystem error while manipulating the repository",

            Self::AgentUnhealthy => "Agent server health check failed",
            Self::SessionCreateFailed => "Agent session could not be created",
            Self::AgentTimeout => "Agent server request timed out",
            Self::AgentHttpStatus => "Agent server returned an error status",
            Self::AgentTransport => "Could not reach the agent server",
            Self::NoAssistantReply => "Agent produced no assistant reply before the deadline",

            Self::PatchEmpty => "Agent produced no changes",
            Self::PatchMalformed => "Extracted diff is not a valid unified diff",
            Self::PatchIo => "Failed to write the patch artifact",

            Self::Cancelled => "Run cancelled",
        }
    }

    /// Returns remediation steps for the error.
    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::InvalidInput => &["Check the command-line arguments"],
            Self::EmptyGroundTruthPatch => &[
                "Check the --gt-patch path or URL",
                "Make sure the patch file is a non-empty unified diff",
            ],
            Self::EmptyPrompt => &["Write the task description into the prompt file"],
            Self::WorkspaceNotFound => &[
                "Pass an existing directory with -d",
                "Or pass --source so the workspace can be cloned",
            ],
            Self::NotARepository => &["Point -d at the root of a git working tree"],
            Self::ConfigInvalid => &[
                "Check AE_* and OPENCODE_* environment variables",
                "Check the TOML config file passed with --config",
            ],
            Self::StateFileInvalid => &[
                "Run `ae prepare` for this workspace first",
                "Remove a corrupted state file and prepare again",
            ],
            Self::ResponseShape => &[
                "Check that the agent server version is supported",
                "Re-run with -v to log the raw response",
            ],
            Self::PatchSourceUnavailable => &[
                "Check that the patch path exists or the URL is reachable",
            ],

            Self::SidecarInvalid | Self::UntrustedBackupSource => &[
                "Inspect the workspace manually before trusting it",
                "Restore .git from the backup directory by hand if it is genuine",
            ],
            Self::BackupImplausible | Self::BackupMissingGit => &[
                "Do not restore from this directory",
                "Re-clone the workspace from its source",
            ],
            Self::RestorePathEscape => &[
                "Look for symlinks the agent planted inside the workspace",
            ],
            Self::SidecarMissing => &[
                "The workspace may already be restored; check `git log`",
                "Re-clone the workspace if history is missing",
            ],
            Self::BackupIo => &["Check free space and permissions of the temp directory"],

            Self::GitSpawnFailed => &["Install git and make sure it is on PATH"],
            Self::GitTimeout => &[
                "Increase AE_GIT_TIMEOUT_SECS",
                "Check for stuck git processes or network fetches",
            ],
            Self::GitCommandFailed => &["Re-run with -v to see git's stderr"],
            Self::BranchNotFound => &[
                "Check the branch name",
                "Pass --source or configure an origin remote so the branch can be fetched",
            ],
            Self::ReverseApplyFailed => &[
                "Make sure the patch was made against the selected branch",
            ],
            Self::HeadMismatch => &[
                "The workspace needs manual intervention",
                "The backup directory was kept; compare its .git with the workspace",
            ],
            Self::GitIo => &["Check permissions of the workspace directory"],

            Self::AgentUnhealthy | Self::AgentTransport => &[
                "Start the agent server (e.g. `opencode serve`)",
                "Check OPENCODE_BASE_URL",
            ],
            Self::SessionCreateFailed | Self::AgentHttpStatus => &[
                "Check OPENCODE_SERVER_USERNAME and OPENCODE_SERVER_PASSWORD",
                "Check the agent server logs",
            ],
            Self::AgentTimeout | Self::NoAssistantReply => &[
                "Increase AE_TASK_TIMEOUT_SECS or AE_POLL_TIMEOUT_SECS",
            ],

            Self::PatchEmpty => &["Inspect the trajectory to see what the agent did"],
            Self::PatchMalformed => &["Inspect the raw diff stored in the trajectory"],
            Self::PatchIo => &["Check permissions of the output directory"],

            Self::Cancelled => &["The workspace was restored before exiting"],
        }
    }

    /// Returns all error codes.
    #[must_use]
    pub fn all() -> &'static [ErrorCode] {
        &[
            Self::InvalidInput,
            Self::EmptyGroundTruthPatch,
            Self::EmptyPrompt,
            Self::WorkspaceNotFound,
            Self::NotARepository,
            Self::ConfigInvalid,
            Self::StateFileInvalid,
            Self::ResponseShape,
            Self::PatchSourceUnavailable,
            Self::SidecarInvalid,
            Self::BackupImplausible,
            Self::RestorePathEscape,
            Self::BackupMissingGit,
            Self::SidecarMissing,
            Self::UntrustedBackupSource,
            Self::BackupIo,
            Self::GitSpawnFailed,
            Self::GitTimeout,
            Self::GitCommandFailed,
            Self::BranchNotFound,
            Self::ReverseApplyFailed,
            Self::HeadMismatch,
            Self::GitIo,
            Self::AgentUnhealthy,
            Self::SessionCreateFailed,
            Self::AgentTimeout,
            Self::AgentHttpStatus,
            Self::AgentTransport,
            Self::NoAssistantReply,
            Self::PatchEmpty,
            Self::PatchMalformed,
            Self::PatchIo,
            Self::Cancelled,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_string(), self.message())
    }
}

/// Error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Input, configuration and response-shape errors (E001-E099)
    Validation,
    /// Sidecar and backup directory errors (E100-E199)
    BackupIntegrity,
    /// git subprocess errors (E200-E299)
    GitOperation,
    /// Agent server errors (E300-E399)
    AgentCommunication,
    /// Extracted patch errors (E400-E499)
    PatchValidation,
    /// Internal errors (E500-E599)
    Internal,
}

impl ErrorCategory {
    /// Returns a human-readable name for the category.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Validation => "Validation",
            Self::BackupIntegrity => "Backup integrity",
            Self::GitOperation => "Git operation",
            Self::AgentCommunication => "Agent communication",
            Self::PatchValidation => "Patch validation",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Complete error entry with all metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error code string (e.g., "AE-E001")
    pub code: String,
    /// Error category
    pub category: ErrorCategory,
    /// Human-readable error message
    pub message: String,
    /// Steps to remediate the error
    pub remediation: Vec<String>,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n", self.code, self.message);

        if !self.remediation.is_empty() {
            output.push_str("\nRemediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }

        output
    }

    /// Formats the error as a single line.
    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.code, self.message)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_numbers_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for code in ErrorCode::all() {
            let num = code.code_number();
            assert!(
                seen.insert(num),
                "Duplicate error code number: {} for {:?}",
                num,
                code
            );
        }
    }

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::InvalidInput.code_string(), "AE-E001");
        assert_eq!(ErrorCode::SidecarInvalid.code_string(), "AE-E100");
        assert_eq!(ErrorCode::GitSpawnFailed.code_string(), "AE-E200");
        assert_eq!(ErrorCode::AgentUnhealthy.code_string(), "AE-E300");
        assert_eq!(ErrorCode::PatchEmpty.code_string(), "AE-E400");
        assert_eq!(ErrorCode::Cancelled.code_string(), "AE-E500");
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            ErrorCode::ResponseShape.category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            ErrorCode::RestorePathEscape.category(),
            ErrorCategory::BackupIntegrity
        );
        assert_eq!(
            ErrorCode::HeadMismatch.category(),
            ErrorCategory::GitOperation
        );
        assert_eq!(
            ErrorCode::NoAssistantReply.category(),
            ErrorCategory::AgentCommunication
        );
        assert_eq!(
            ErrorCode::PatchEmpty.category(),
            ErrorCategory::PatchValidation
        );
        assert_eq!(ErrorCode::Cancelled.category(), ErrorCategory::Internal);
    }

    #[test]
    fn test_every_code_has_remediation() {
        for code in ErrorCode::all() {
            assert!(
                !code.remediation().is_empty(),
                "{:?} has no remediation steps",
                code
            );
        }
    }

    #[test]
    fn test_format_full_lists_steps() {
        let text = ErrorCode::HeadMismatch.entry().format_full();
        assert!(text.starts_with("[AE-E205]"));
        assert!(text.contains("1. The workspace needs manual intervention"));
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&ErrorCode::BranchNotFound).unwrap();
        assert_eq!(json, "\"BRANCH_NOT_FOUND\"");
        let json = serde_json::to_string(&ErrorCategory::GitOperation).unwrap();
        assert_eq!(json, "\"git_operation\"");
    }
}
