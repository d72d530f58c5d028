//! Replace a repository's history with one synthetic commit, and put the
//! real history back afterwards.

use std::fs;
use std::path::Path;

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::errors::{BackupIntegrityError, GitOperationError, LifecycleError};
use crate::git::Git;
use crate::path_guard::{self, VCS_DIR};
use crate::state_file::{WorkspaceState, WorkspaceStatus};
use crate::vault::{
    BackupDirectory, BackupVault, HINT_FILE, OriginalRef, ResolvedSidecar, RestoreReport, WORKSPACE_SIDECAR,
};

pub const SYNTHETIC_NAME: &str = "agent-eval";
pub const SYNTHETIC_EMAIL: &str = "agent-eval@noreply";
pub const BASE_MESSAGE: &str = "base";

fn git_io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> GitOperationError {
    let context = context.into();
    move |source| GitOperationError::Io { context, source }
}

/// What a restore must reproduce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreTarget {
    /// HEAD recorded when the backup was taken.
    pub branch_head: String,
    /// Ref to check out at the end (branch or detached hash).
    pub saved_ref: String,
    /// Expected HEAD after checking out `saved_ref`, when known.
    pub saved_head: Option<String>,
}

impl From<&OriginalRef> for RestoreTarget {
    fn from(r: &OriginalRef) -> Self {
        Self {
            branch_head: r.branch_head().to_string(),
            saved_ref: r.saved_ref().to_string(),
            saved_head: Some(r.saved_head().to_string()),
        }
    }
}

/// Counts of everything in a repository that could reveal history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistorySummary {
    pub commits: usize,
    pub tags: usize,
    pub stashes: usize,
    pub reflog_entries: usize,
    pub remotes: usize,
    pub other_refs: usize,
}

impl HistorySummary {
    pub fn collect(git: &Git) -> Result<Self, GitOperationError> {
        let commits = git
            .stdout(&["rev-list", "--all", "--count"])?
            .parse()
            .unwrap_or(usize::MAX);
        let refs = git.stdout(&["for-each-ref", "--format=%(refname)"])?;
        let mut summary = Self {
            commits,
            ..Self::default()
        };
        for name in refs.lines() {
            if name.starts_with("refs/tags/") {
                summary.tags += 1;
            } else if name == "refs/stash" {
                summary.stashes += 1;
            } else if !name.starts_with("refs/heads/") {
                summary.other_refs += 1;
            }
        }
        summary.remotes = git.stdout(&["remote"])?.lines().count();
        let logs = git.dir().join(VCS_DIR).join("logs");
        summary.reflog_entries = WalkDir::new(&logs)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| fs::read_to_string(e.path()).ok())
            .map(|s| s.lines().count())
            .sum();
        Ok(summary)
    }

    /// Exactly one commit and nothing else pointing anywhere.
    pub fn is_single_commit(&self) -> bool {
        self.commits == 1
            && self.tags == 0
            && self.stashes == 0
            && self.reflog_entries == 0
            && self.remotes == 0
            && self.other_refs == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct GitSanitizer {
    vault: BackupVault,
}

impl GitSanitizer {
    pub fn new(vault: BackupVault) -> Self {
        Self { vault }
    }

    pub fn vault(&self) -> &BackupVault {
        &self.vault
    }

    /// Delete `.git` (already copied into `backup`) and re-initialize with a
    /// single commit of the current tree. Returns the new HEAD.
    ///
    /// If re-initialization fails, the original `.git` is copied back.
    pub fn sanitize(&self, workspace: &Path, git: &Git, backup: &BackupDirectory) -> Result<String, LifecycleError> {
        let git_dir = workspace.join(VCS_DIR);
        let carried_exclude = fs::read_to_string(git_dir.join("info").join("exclude")).unwrap_or_default();
        path_guard::remove_entry(&git_dir).map_err(git_io("remove original .git"))?;

        match self.reinit(workspace, git, &carried_exclude) {
            Ok(head) => {
                info!(head = %short(&head), "history replaced with a single commit");
                Ok(head)
            }
            Err(e) => {
                warn!(error = %e, "sanitize failed; putting original .git back");
                let _ = path_guard::remove_entry(&git_dir);
                self.vault.restore_git_dir(&backup.path, workspace)?;
                Err(e)
            }
        }
    }

    fn reinit(&self, workspace: &Path, git: &Git, carried_exclude: &str) -> Result<String, LifecycleError> {
        git.run(&["-c", "init.defaultBranch=main", "init", "-q"])?;
        git.run(&["config", "user.name", SYNTHETIC_NAME])?;
        git.run(&["config", "user.email", SYNTHETIC_EMAIL])?;
        git.run(&["config", "core.logAllRefUpdates", "false"])?;

        let exclude = workspace.join(VCS_DIR).join("info").join("exclude");
        if let Some(parent) = exclude.parent() {
            fs::create_dir_all(parent).map_err(git_io("create .git/info"))?;
        }
        let mut rules = carried_exclude.trim_end().to_string();
        if !rules.is_empty() {
            rules.push('\n');
        }
        rules.push_str(WORKSPACE_SIDECAR);
        rules.push('\n');
        fs::write(&exclude, rules).map_err(git_io("write .git/info/exclude"))?;

        git.run(&["add", "-A"])?;
        git.run(&[
            "-c",
            "commit.gpgsign=false",
            "commit",
            "-q",
            "--allow-empty",
            "--no-verify",
            "-m",
            BASE_MESSAGE,
        ])?;
        let head = git.head()?;

        let summary = HistorySummary::collect(git)?;
        if !summary.is_single_commit() {
            return Err(GitOperationError::Failed {
                args: "sanitize".to_string(),
                code: None,
                stderr: format!("sanitized repository still exposes history: {:?}", summary),
            }
            .into());
        }
        Ok(head)
    }

    /// Whether the workspace still runs on sanitized history.
    ///
    /// Decided from facts the agent cannot undo by committing: a hint file
    /// in `.git`, a state file still saying `prepared`, or a recorded clean
    /// commit missing from the object store. The commit-shape heuristic is
    /// only a last resort for workspaces without a state file.
    pub fn is_sanitized(workspace: &Path, git: &Git, state: Option<&WorkspaceState>) -> bool {
        if fs::symlink_metadata(workspace.join(HINT_FILE)).is_ok() {
            return true;
        }
        match state {
            Some(state) => {
                state.status == WorkspaceStatus::Prepared || !git.has_commit(&state.clean_commit).unwrap_or(false)
            }
            None => Self::looks_sanitized(git),
        }
    }

    /// Whether HEAD is a lone synthetic commit made by [`sanitize`](Self::sanitize).
    pub fn looks_sanitized(git: &Git) -> bool {
        let Ok(count) = git.stdout(&["rev-list", "--count", "HEAD"]) else {
            return false;
        };
        let Ok(author) = git.stdout(&["log", "-1", "--format=%ae%x00%s"]) else {
            return false;
        };
        count == "1" && author == format!("{}\0{}", SYNTHETIC_EMAIL, BASE_MESSAGE)
    }

    /// Put the original `.git` back, reconcile the working tree, restore
    /// ignored files and check out the pre-setup ref.
    ///
    /// A HEAD mismatch keeps the backup directory and fails; the workspace
    /// then needs manual intervention.
    pub fn restore(
        &self,
        workspace: &Path,
        git: &Git,
        resolved: &ResolvedSidecar,
        target: &RestoreTarget,
    ) -> Result<RestoreReport, LifecycleError> {
        if !resolved.may_restore_git() {
            warn!("refusing to restore .git from an in-workspace sidecar");
            if let Err(e) = git.reset_hard_and_clean("HEAD") {
                warn!(error = %e, "cleanup of sanitized tree failed");
            }
            self.vault.restore_ignored(workspace, git, resolved);
            return Err(BackupIntegrityError::UntrustedSource.into());
        }

        let backup = resolved
            .backup_dir()
            .ok_or_else(|| BackupIntegrityError::SidecarSchema {
                source_label: "resolved sidecar",
                detail: "no backup_dir".to_string(),
            })?
            .to_path_buf();

        if fs::symlink_metadata(backup.join(VCS_DIR)).is_err() {
            let _ = git.reset_hard_and_clean("HEAD");
            return Err(BackupIntegrityError::MissingGit {
                path: backup.join(VCS_DIR),
            }
            .into());
        }

        self.vault.restore_git_dir(&backup, workspace)?;
        info!(source = %resolved.trust(), "original .git restored");

        // Rewrite the tree from the restored index without touching .git.
        if let Err(e) = git.run(&["checkout-index", "-a", "-f"]) {
            warn!(error = %e, "checkout-index failed; resetting instead");
            git.run(&["reset", "--hard", &target.branch_head])?;
        }
        git.run(&["clean", "-fd"])?;

        let head = git.head()?;
        if head != target.branch_head {
            return Err(GitOperationError::HeadMismatch {
                expected: target.branch_head.clone(),
                actual: head,
            }
            .into());
        }

        let report = self.vault.restore_ignored(workspace, git, resolved);

        if !target.saved_ref.is_empty() && git.current_ref()? != target.saved_ref {
            git.run(&["checkout", "-q", &target.saved_ref])?;
            info!(git_ref = %target.saved_ref, "switched back to original ref");
            if let Some(expected) = &target.saved_head {
                let actual = git.head()?;
                if &actual != expected {
                    return Err(GitOperationError::HeadMismatch {
                        expected: expected.clone(),
                        actual,
                    }
                    .into());
                }
            }
        }

        path_guard::remove_entry(&workspace.join(WORKSPACE_SIDECAR)).map_err(git_io("remove workspace sidecar"))?;
        if let Err(e) = self.vault.destroy(&backup) {
            warn!(error = %e, "backup directory left behind");
        }
        info!("workspace restored");
        Ok(report)
    }
}

pub(crate) fn short(hash: &str) -> &str {
    hash.get(..10).unwrap_or(hash)
}
