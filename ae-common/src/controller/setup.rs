//! Starting-point setup: check out the target branch, undo the ground-truth
//! fix, back up and sanitize the repository.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use crate::errors::{GitOperationError, LifecycleError, ValidationError};
use crate::git::{Git, run_with_timeout};
use crate::path_guard;
use crate::sanitizer::{GitSanitizer, RestoreTarget, short};
use crate::state_file::{WorkspaceState, is_safe_ref};
use crate::vault::{BackupDirectory, OriginalRef, WORKSPACE_SIDECAR};

/// The real fix, as bytes plus where it came from (path or URL).
#[derive(Clone, PartialEq, Eq)]
pub struct GroundTruthPatch {
    origin: String,
    bytes: Vec<u8>,
}

impl std::fmt::Debug for GroundTruthPatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroundTruthPatch")
            .field("origin", &self.origin)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl GroundTruthPatch {
    pub fn new(origin: impl Into<String>, bytes: Vec<u8>) -> Result<Self, ValidationError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(ValidationError::EmptyGroundTruthPatch);
        }
        Ok(Self {
            origin: origin.into(),
            bytes,
        })
    }

    /// Read a patch file.
    pub fn load(path: &Path) -> Result<Self, ValidationError> {
        let bytes = fs::read(path).map_err(|e| ValidationError::PatchSource {
            origin: path.display().to_string(),
            detail: e.to_string(),
        })?;
        Self::new(path.display().to_string(), bytes)
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// `https://host/owner/repo/...` → `https://host/owner/repo.git` when the
    /// patch came from a URL.
    pub fn repo_url(&self) -> Option<String> {
        repo_url_from_patch_url(&self.origin)
    }
}

pub fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

pub fn repo_url_from_patch_url(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    if scheme != "http" && scheme != "https" {
        return None;
    }
    let mut segs = rest.split('/');
    let host = segs.next().filter(|s| !s.is_empty())?;
    let owner = segs.next().filter(|s| !s.is_empty())?;
    let repo = segs.next().filter(|s| !s.is_empty())?;
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    Some(format!("{}://{}/{}/{}.git", scheme, host, owner, repo))
}

/// `pr_692`, `PR-692`, `pr692` → `692`.
pub fn pr_number(branch: &str) -> Option<&str> {
    let lower = branch.get(..2)?;
    if !lower.eq_ignore_ascii_case("pr") {
        return None;
    }
    let rest = &branch[2..];
    let digits = rest.strip_prefix(['_', '-']).unwrap_or(rest);
    (!digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())).then_some(digits)
}

/// Inputs to `prepare`.
#[derive(Debug, Clone, Default)]
pub struct PrepareRequest {
    pub workspace: PathBuf,
    /// Clone from here when the workspace does not exist.
    pub source: Option<String>,
    pub branch: Option<String>,
    pub gt_patch: Option<GroundTruthPatch>,
}

/// A workspace ready for the agent.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub(crate) original: OriginalRef,
    pub baseline_commit: String,
    pub clean_commit: String,
    pub saved_ref: String,
    pub source_url: Option<String>,
}

/// How far setup got, for rollback.
#[derive(Debug, Default)]
pub(crate) struct SetupProgress {
    pub pre_ref: Option<String>,
    pub mutated: bool,
    pub backup: Option<BackupDirectory>,
    pub original: Option<OriginalRef>,
    pub sanitized: bool,
}

fn reverse_apply_err(detail: impl Into<String>) -> GitOperationError {
    GitOperationError::ReverseApply { detail: detail.into() }
}

/// Check out `branch`, fetching it (or a PR head) when missing locally.
fn checkout_branch(git: &Git, branch: &str, fallback_url: Option<&str>) -> Result<(), GitOperationError> {
    if !git.branch_exists(branch)? {
        let url = git.remote_url("origin")?.or_else(|| fallback_url.map(str::to_string));
        let Some(url) = url else {
            return Err(GitOperationError::BranchNotFound {
                branch: branch.to_string(),
            });
        };
        info!(branch, url = %url, "branch not found locally; fetching");
        let mut fetched = git
            .run_unchecked(&["fetch", "--quiet", &url, &format!("{0}:{0}", branch)])?
            .success();
        if !fetched && let Some(n) = pr_number(branch) {
            info!(branch, pr = n, "fetching pull request head");
            fetched = git
                .run_unchecked(&["fetch", "--quiet", &url, &format!("pull/{}/head:{}", n, branch)])?
                .success();
        }
        if !fetched {
            return Err(GitOperationError::BranchNotFound {
                branch: branch.to_string(),
            });
        }
    }
    git.run(&["checkout", "-q", branch, "--"])?;
    info!(branch, "checked out target branch");
    Ok(())
}

/// `git apply --reverse`, falling back to `patch -p1 -R`. The patch is
/// written to a temp file outside the workspace and removed afterwards.
fn reverse_apply(git: &Git, patch: &GroundTruthPatch) -> Result<(), GitOperationError> {
    let mut tmp = tempfile::Builder::new()
        .prefix("gt_")
        .suffix(".patch")
        .tempfile()
        .map_err(|e| reverse_apply_err(format!("temp file: {}", e)))?;
    tmp.write_all(patch.bytes())
        .and_then(|_| tmp.flush())
        .map_err(|e| reverse_apply_err(format!("temp file: {}", e)))?;
    let tmp_path = tmp.path().to_string_lossy().into_owned();

    let applied = git.run_unchecked(&["apply", "--reverse", "--whitespace=nowarn", &tmp_path])?;
    if applied.success() {
        info!(origin = %patch.origin(), "ground-truth patch reversed");
        return Ok(());
    }
    warn!(stderr = %applied.stderr, "git apply --reverse failed; trying patch -p1 -R");

    let mut cmd = Command::new("patch");
    cmd.args(["-p1", "-R", "--batch", "--silent", "-i", &tmp_path])
        .current_dir(git.dir());
    let out = run_with_timeout(&mut cmd, git.timeout())
        .map_err(|e| reverse_apply_err(format!("cannot run patch: {}", e)))?;
    if out.success() {
        info!(origin = %patch.origin(), "ground-truth patch reversed with patch(1)");
        Ok(())
    } else {
        let detail = if out.timed_out {
            "patch timed out".to_string()
        } else {
            format!("git apply: {}; patch: {}{}", applied.stderr, out.stdout_trimmed(), out.stderr)
        };
        Err(reverse_apply_err(detail))
    }
}

/// Steps 2-7 of setup. `progress` tracks what has to be undone on failure.
pub(crate) fn setup_starting_point(
    workspace: &Path,
    git: &Git,
    sanitizer: &GitSanitizer,
    req: &PrepareRequest,
    prior: Option<&WorkspaceState>,
    progress: &mut SetupProgress,
) -> Result<Prepared, LifecycleError> {
    if !git.is_repository() {
        return Err(ValidationError::NotARepository {
            path: workspace.to_path_buf(),
        }
        .into());
    }
    if GitSanitizer::is_sanitized(workspace, git, prior) {
        return Err(ValidationError::Invalid(format!(
            "{} is already prepared; reset it first",
            workspace.display()
        ))
        .into());
    }
    let pre_ref = git.current_ref()?;
    let pre_head = git.head()?;
    progress.pre_ref = Some(pre_ref.clone());
    let source_url = git.remote_url("origin")?.or_else(|| req.source.clone());

    if let Some(branch) = req.branch.as_deref().filter(|b| *b != pre_ref) {
        if !is_safe_ref(branch) {
            return Err(ValidationError::Invalid(format!("unsafe branch name: {:?}", branch)).into());
        }
        progress.mutated = true;
        let fallback = req.gt_patch.as_ref().and_then(GroundTruthPatch::repo_url);
        checkout_branch(git, branch, fallback.as_deref())?;
    }

    let clean_commit = git.head()?;
    progress.mutated = true;
    git.reset_hard_and_clean("HEAD")?;

    if let Some(patch) = &req.gt_patch {
        reverse_apply(git, patch)?;
        if !git.is_dirty()? {
            warn!("reverse-applying the ground-truth patch changed nothing");
        }
    }

    let vault = sanitizer.vault();
    let backup = vault.create(workspace, git)?;
    progress.backup = Some(backup.clone());
    vault.lock(&backup.path)?;
    let original = OriginalRef::new(pre_ref.clone(), pre_head, clean_commit.clone(), backup.path.clone());
    progress.original = Some(original.clone());

    let baseline_commit = sanitizer.sanitize(workspace, git, &backup)?;
    progress.sanitized = true;
    vault.install_hint(workspace, &backup.path)?;

    info!(
        clean = %short(&clean_commit),
        baseline = %short(&baseline_commit),
        "starting point ready"
    );
    Ok(Prepared {
        original,
        baseline_commit,
        clean_commit,
        saved_ref: pre_ref,
        source_url,
    })
}

/// Undo a partial setup. Best effort; every failure is logged.
pub(crate) fn rollback(workspace: &Path, git: &Git, sanitizer: &GitSanitizer, progress: &SetupProgress) {
    if !progress.mutated {
        debug!("setup failed before mutating the workspace");
        return;
    }
    warn!(sanitized = progress.sanitized, "rolling back partial setup");
    let vault = sanitizer.vault();

    if progress.sanitized
        && let Some(original) = &progress.original
    {
        let restored = vault
            .resolve(workspace, Some(original))
            .map_err(LifecycleError::from)
            .and_then(|resolved| sanitizer.restore(workspace, git, &resolved, &RestoreTarget::from(original)));
        match restored {
            Ok(_) => info!("rollback restored the original repository"),
            Err(e) => warn!(error = %e, "rollback restore failed"),
        }
        return;
    }

    if let Some(backup) = &progress.backup
        && let Err(e) = vault.destroy(&backup.path)
    {
        warn!(error = %e, "could not remove backup");
    }
    if let Err(e) = path_guard::remove_entry(&workspace.join(WORKSPACE_SIDECAR)) {
        debug!(error = %e, "could not remove workspace sidecar");
    }
    if let Err(e) = git.reset_hard_and_clean("HEAD") {
        warn!(error = %e, "rollback reset failed");
    }
    if let Some(pre_ref) = &progress.pre_ref
        && git.current_ref().is_ok_and(|r| &r != pre_ref)
        && let Err(e) = git.run(&["checkout", "-q", pre_ref, "--"])
    {
        warn!(error = %e, git_ref = %pre_ref, "could not switch back to original ref");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_url_from_patch_url() {
        assert_eq!(
            repo_url_from_patch_url("https://github.com/o/r/pull/12.patch").as_deref(),
            Some("https://github.com/o/r.git")
        );
        assert_eq!(
            repo_url_from_patch_url("http://gitee.com/o/r.git/x").as_deref(),
            Some("http://gitee.com/o/r.git")
        );
        assert_eq!(repo_url_from_patch_url("https://github.com/o"), None);
        assert_eq!(repo_url_from_patch_url("/tmp/fix.patch"), None);
    }

    #[test]
    fn test_pr_number() {
        assert_eq!(pr_number("pr_692"), Some("692"));
        assert_eq!(pr_number("PR-7"), Some("7"));
        assert_eq!(pr_number("pr12"), Some("12"));
        assert_eq!(pr_number("pr_"), None);
        assert_eq!(pr_number("prx1"), None);
        assert_eq!(pr_number("feature"), None);
        assert_eq!(pr_number("p"), None);
    }

    #[test]
    fn test_ground_truth_patch_rejects_blank() {
        assert!(matches!(
            GroundTruthPatch::new("x", b" \n\t".to_vec()),
            Err(ValidationError::EmptyGroundTruthPatch)
        ));
        let p = GroundTruthPatch::new("https://github.com/o/r/commit/abc.diff", b"diff".to_vec()).unwrap();
        assert_eq!(p.repo_url().as_deref(), Some("https://github.com/o/r.git"));
        assert!(format!("{:?}", p).contains("bytes: 4"));
    }

    #[test]
    fn test_is_url() {
        assert!(is_url("https://x/y"));
        assert!(!is_url("./fix.patch"));
    }
}
