//! Tamper-resistant storage of a workspace's pre-agent state.
//!
//! A backup directory lives outside the workspace, under the system temp
//! directory, and holds:
//!
//! ```text
//! agent_eval_git_bak_XXXXXX/
//! ├── .git/                 original version-control directory
//! ├── ignored/<relpath>     copies of files ignored before the agent ran
//! ├── sidecar.json          durable sidecar
//! └── lock_manifest.json    permission bits recorded before locking
//! ```
//!
//! The whole tree is made read-only right after creation. Nothing read from
//! it is written back into the workspace without passing [`path_guard`].
//!
//! [`path_guard`]: crate::path_guard

pub mod sidecar;

pub use sidecar::{
    DURABLE_SIDECAR, HINT_FILE, ResolvedSidecar, Sidecar, TrustLevel, WORKSPACE_SIDECAR,
};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt, symlink};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::errors::{BackupIntegrityError, LifecycleError};
use crate::git::Git;
use crate::path_guard::{self, VCS_DIR};

/// Name prefix of every backup directory this crate creates.
pub const BACKUP_PREFIX: &str = "agent_eval_git_bak_";
const IGNORED_DIR: &str = "ignored";
const LOCK_MANIFEST: &str = "lock_manifest.json";
/// Mode for a restored file whose original mode was not recorded.
const DEFAULT_RESTORED_MODE: u32 = 0o640;

fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> BackupIntegrityError {
    let context = context.into();
    move |source| BackupIntegrityError::Io { context, source }
}

/// The controller's private record of what to restore.
///
/// Lives only in memory for the duration of one run and is never written
/// into the workspace. `Debug` hides the backup location.
#[derive(Clone, PartialEq, Eq)]
pub struct OriginalRef {
    saved_ref: String,
    saved_head: String,
    branch_head: String,
    backup_dir: PathBuf,
}

impl OriginalRef {
    pub fn new(
        saved_ref: impl Into<String>,
        saved_head: impl Into<String>,
        branch_head: impl Into<String>,
        backup_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            saved_ref: saved_ref.into(),
            saved_head: saved_head.into(),
            branch_head: branch_head.into(),
            backup_dir: backup_dir.into(),
        }
    }

    /// Branch name (or detached hash) checked out before setup.
    pub fn saved_ref(&self) -> &str {
        &self.saved_ref
    }

    /// HEAD before setup.
    pub fn saved_head(&self) -> &str {
        &self.saved_head
    }

    /// HEAD of the target branch at backup time.
    pub fn branch_head(&self) -> &str {
        &self.branch_head
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }
}

impl fmt::Debug for OriginalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginalRef")
            .field("saved_ref", &self.saved_ref)
            .field("saved_head", &self.saved_head)
            .field("branch_head", &self.branch_head)
            .field("backup_dir", &"<redacted>")
            .finish()
    }
}

/// A freshly created backup.
#[derive(Debug, Clone)]
pub struct BackupDirectory {
    pub path: PathBuf,
    pub sidecar: Sidecar,
}

/// Outcome of restoring ignored files.
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    pub skipped: Vec<(String, String)>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BackupVault {
    temp_root: PathBuf,
    prefix: String,
}

impl Default for BackupVault {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupVault {
    pub fn new() -> Self {
        Self::with_temp_root(std::env::temp_dir())
    }

    /// Vault whose backups live under `temp_root`.
    pub fn with_temp_root(temp_root: impl Into<PathBuf>) -> Self {
        Self {
            temp_root: temp_root.into(),
            prefix: BACKUP_PREFIX.to_string(),
        }
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    // ── Create / lock ──────────────────────────────────────────────────

    /// Snapshot `.git`, ignored files and their modes, and write the sidecar
    /// to the backup and the working tree.
    pub fn create(&self, workspace: &Path, git: &Git) -> Result<BackupDirectory, LifecycleError> {
        let path = tempfile::Builder::new()
            .prefix(&self.prefix)
            .tempdir_in(&self.temp_root)
            .map_err(io_err("create backup directory"))?
            .keep();

        match self.populate(workspace, git, &path) {
            Ok(sidecar) => {
                info!(ignored = sidecar.pre_agent_ignored.as_ref().map_or(0, |s| s.len()), "backup created");
                Ok(BackupDirectory { path, sidecar })
            }
            Err(e) => {
                let _ = force_remove(&path);
                Err(e)
            }
        }
    }

    fn populate(&self, workspace: &Path, git: &Git, backup: &Path) -> Result<Sidecar, LifecycleError> {
        let src_git = workspace.join(VCS_DIR);
        copy_entry(&src_git, &backup.join(VCS_DIR)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BackupIntegrityError::MissingGit { path: src_git.clone() },
            _ => BackupIntegrityError::Io {
                context: format!("copy {}", src_git.display()),
                source: e,
            },
        })?;

        let ignored = git.ignored_files()?;
        let mut modes = BTreeMap::new();
        let ignored_root = backup.join(IGNORED_DIR);
        for rel in &ignored {
            if !path_guard::is_safe_relative_path(rel) {
                continue;
            }
            let src = workspace.join(rel);
            let Ok(meta) = fs::symlink_metadata(&src) else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let dst = ignored_root.join(rel);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).map_err(io_err(format!("create {}", parent.display())))?;
            }
            fs::copy(&src, &dst).map_err(io_err(format!("back up {}", rel)))?;
            modes.insert(rel.clone(), meta.permissions().mode() & 0o7777);
        }

        let sidecar = Sidecar {
            backup_dir: Some(backup.to_path_buf()),
            pre_agent_ignored: Some(ignored.into_iter().collect()),
            pre_agent_modes: modes,
        };
        let bytes = sidecar.to_bytes();
        fs::write(backup.join(DURABLE_SIDECAR), &bytes)
            .map_err(io_err("write durable sidecar"))?;
        fs::write(workspace.join(WORKSPACE_SIDECAR), &bytes)
            .map_err(io_err("write workspace sidecar"))?;
        Ok(sidecar)
    }

    /// Record every mode under `backup`, then make the tree read-only.
    pub fn lock(&self, backup: &Path) -> Result<(), BackupIntegrityError> {
        let mut manifest = BTreeMap::new();
        for entry in WalkDir::new(backup).follow_links(false).min_depth(1) {
            let entry = entry.map_err(|e| BackupIntegrityError::Io {
                context: format!("walk {}", backup.display()),
                source: e.into(),
            })?;
            if entry.file_type().is_symlink() {
                continue;
            }
            let meta = entry.metadata().map_err(|e| BackupIntegrityError::Io {
                context: format!("stat {}", entry.path().display()),
                source: e.into(),
            })?;
            if let Ok(rel) = entry.path().strip_prefix(backup) {
                manifest.insert(rel.to_string_lossy().into_owned(), meta.permissions().mode() & 0o7777);
            }
        }
        let bytes = serde_json::to_vec(&manifest).map_err(|e| BackupIntegrityError::Io {
            context: "serialize lock manifest".to_string(),
            source: e.into(),
        })?;
        fs::write(backup.join(LOCK_MANIFEST), bytes).map_err(io_err("write lock manifest"))?;

        for entry in WalkDir::new(backup).follow_links(false).contents_first(true) {
            let Ok(entry) = entry else { continue };
            let mode = if entry.file_type().is_dir() {
                0o555
            } else if entry.file_type().is_file() {
                0o444
            } else {
                continue;
            };
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode))
                .map_err(io_err(format!("lock {}", entry.path().display())))?;
        }
        debug!(entries = manifest.len(), "backup locked read-only");
        Ok(())
    }

    /// Point `.git/info/sidecar_backup` at the durable sidecar.
    pub fn install_hint(&self, workspace: &Path, backup: &Path) -> Result<(), BackupIntegrityError> {
        let hint = workspace.join(HINT_FILE);
        if let Some(parent) = hint.parent() {
            fs::create_dir_all(parent).map_err(io_err("create .git/info"))?;
        }
        let target = backup.join(DURABLE_SIDECAR);
        fs::write(&hint, target.as_os_str().as_encoded_bytes()).map_err(io_err("write hint file"))
    }

    // ── Plausibility / resolution ──────────────────────────────────────

    /// Reject a backup path that does not look like one this vault made.
    pub fn check_plausible(&self, path: &Path, expect_git: bool) -> Result<(), BackupIntegrityError> {
        let fail = |reason: &str| BackupIntegrityError::Implausible {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };
        if !path.is_absolute() {
            return Err(fail("not absolute"));
        }
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(fail("not a directory")),
            Err(_) => return Err(fail("does not exist")),
        }
        let name_ok = path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with(&self.prefix));
        if !name_ok {
            return Err(fail("unexpected name"));
        }
        let real_root = self
            .temp_root
            .canonicalize()
            .map_err(|_| fail("temp root unavailable"))?;
        let real_parent = path
            .parent()
            .and_then(|p| p.canonicalize().ok())
            .ok_or_else(|| fail("parent unavailable"))?;
        if !real_parent.starts_with(&real_root) {
            return Err(fail("outside temp directory"));
        }
        if expect_git && fs::symlink_metadata(path.join(VCS_DIR)).is_err() {
            return Err(fail("no .git inside"));
        }
        Ok(())
    }

    /// Find the sidecar through the trust hierarchy: memory, hint file,
    /// then the working tree.
    pub fn resolve(
        &self,
        workspace: &Path,
        memory: Option<&OriginalRef>,
    ) -> Result<ResolvedSidecar, BackupIntegrityError> {
        if let Some(original) = memory {
            let dir = original.backup_dir();
            let mut sidecar = sidecar::read_small_file(&dir.join(DURABLE_SIDECAR))
                .and_then(|b| Sidecar::parse_lenient(&b))
                .unwrap_or_else(|| {
                    warn!("durable sidecar unreadable; using backup contents only");
                    Sidecar::default()
                });
            sidecar.backup_dir = Some(dir.to_path_buf());
            return Ok(ResolvedSidecar::FromMemory(sidecar));
        }

        if let Some(sidecar) = self.read_hint(workspace) {
            return Ok(ResolvedSidecar::FromHint(sidecar));
        }

        let path = workspace.join(WORKSPACE_SIDECAR);
        let bytes = sidecar::read_small_file(&path).ok_or_else(|| BackupIntegrityError::NoSidecar {
            workspace: workspace.to_path_buf(),
        })?;
        let sidecar = Sidecar::parse_strict(&bytes).map_err(|detail| {
            BackupIntegrityError::SidecarSchema {
                source_label: "workspace sidecar",
                detail,
            }
        })?;
        if let Some(dir) = &sidecar.backup_dir {
            self.check_plausible(dir, true)?;
        }
        warn!("only the in-workspace sidecar is available");
        Ok(ResolvedSidecar::FromWorkspace(sidecar))
    }

    fn read_hint(&self, workspace: &Path) -> Option<Sidecar> {
        let raw = sidecar::read_small_file(&workspace.join(HINT_FILE))?;
        let target = PathBuf::from(String::from_utf8_lossy(&raw).trim());
        if target.file_name().is_none_or(|n| n != DURABLE_SIDECAR) {
            warn!(hint = %target.display(), "hint file does not name a durable sidecar");
            return None;
        }
        let dir = target.parent()?.to_path_buf();
        if let Err(e) = self.check_plausible(&dir, true) {
            warn!(error = %e, "ignoring hint file");
            return None;
        }
        let mut sidecar = sidecar::read_small_file(&target).and_then(|b| Sidecar::parse_lenient(&b))?;
        sidecar.backup_dir = Some(dir);
        Some(sidecar)
    }

    // ── Restore ────────────────────────────────────────────────────────

    /// Replace the workspace's `.git` with the backed-up one.
    pub fn restore_git_dir(&self, backup: &Path, workspace: &Path) -> Result<(), BackupIntegrityError> {
        let src = backup.join(VCS_DIR);
        if fs::symlink_metadata(&src).is_err() {
            return Err(BackupIntegrityError::MissingGit { path: src });
        }
        let dst = workspace.join(VCS_DIR);
        path_guard::remove_entry(&dst).map_err(io_err("remove sanitized .git"))?;
        copy_entry(&src, &dst).map_err(io_err("copy .git from backup"))?;

        let manifest = read_manifest(backup);
        for entry in WalkDir::new(&dst).follow_links(false) {
            let Ok(entry) = entry else { continue };
            if entry.file_type().is_symlink() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(workspace) else {
                continue;
            };
            let recorded = manifest.as_ref().and_then(|m| m.get(&*rel.to_string_lossy()).copied());
            let mode = match recorded {
                Some(mode) => mode & 0o777,
                None if entry.file_type().is_dir() => 0o755,
                None => 0o644,
            };
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode))
                .map_err(io_err(format!("chmod {}", entry.path().display())))?;
        }
        Ok(())
    }

    /// Bring back pre-agent ignored files and delete ignored files the
    /// agent created. Per-file failures are logged and skipped.
    pub fn restore_ignored(&self, workspace: &Path, git: &Git, resolved: &ResolvedSidecar) -> RestoreReport {
        let mut report = RestoreReport::default();
        let Some(backup) = resolved.backup_dir() else {
            warn!("sidecar has no backup directory; ignored files not restored");
            return report;
        };
        let sidecar = resolved.sidecar();
        let ignored_root = backup.join(IGNORED_DIR);
        let backed_up = enumerate_files(&ignored_root);
        if sidecar.pre_agent_ignored.is_none() {
            warn!(
                source = %resolved.trust(),
                "ignored-file list missing; using backup contents"
            );
        }
        let listed = sidecar.pre_agent_ignored.clone().unwrap_or_default();
        let candidates: BTreeSet<&String> = backed_up.iter().chain(listed.iter()).collect();

        for rel in candidates {
            let src = ignored_root.join(rel);
            if !path_guard::is_safe_relative_path(rel)
                || !fs::symlink_metadata(&src).is_ok_and(|m| m.is_file())
            {
                continue;
            }
            let dest = match path_guard::guard_restore_target(workspace, git, rel) {
                Ok(dest) => dest,
                Err(reason) => {
                    warn!(path = %rel, %reason, "skipping ignored file");
                    report.skipped.push((rel.clone(), reason.to_string()));
                    continue;
                }
            };
            let mode = sidecar
                .pre_agent_modes
                .get(rel)
                .map_or(DEFAULT_RESTORED_MODE, |m| m & 0o777);
            match write_restored(&src, &dest, mode) {
                Ok(()) => report.restored.push(rel.clone()),
                Err(e) => {
                    warn!(path = %rel, error = %e, "failed to restore ignored file");
                    report.skipped.push((rel.clone(), e.to_string()));
                }
            }
        }

        match git.ignored_files() {
            Ok(current) => {
                for rel in current {
                    if rel == WORKSPACE_SIDECAR || listed.contains(&rel) || backed_up.contains(&rel) {
                        continue;
                    }
                    let full = workspace.join(&rel);
                    if !path_guard::is_safe_relative_path(&rel)
                        || !path_guard::verify_within_boundary(workspace, &full)
                    {
                        continue;
                    }
                    match path_guard::remove_entry(&full) {
                        Ok(()) => report.removed.push(rel),
                        Err(e) => debug!(path = %rel, error = %e, "could not remove agent file"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not list ignored files; agent-created files left in place"),
        }

        info!(
            restored = report.restored.len(),
            skipped = report.skipped.len(),
            removed = report.removed.len(),
            source = %resolved.trust(),
            "ignored files restored"
        );
        report
    }

    /// Unlock and delete a backup directory created by this vault.
    pub fn destroy(&self, backup: &Path) -> Result<(), BackupIntegrityError> {
        self.check_plausible(backup, false)?;
        force_remove(backup).map_err(io_err(format!("remove {}", backup.display())))
    }
}

/// Write `src`'s bytes to a fresh file at `dest` with exactly `mode`.
fn write_restored(src: &Path, dest: &Path, mode: u32) -> std::io::Result<()> {
    let bytes = fs::read(src)?;
    path_guard::remove_entry(dest)?;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(dest)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    fs::set_permissions(dest, fs::Permissions::from_mode(mode))
}

fn read_manifest(backup: &Path) -> Option<BTreeMap<String, u32>> {
    let parsed = sidecar::read_small_file(&backup.join(LOCK_MANIFEST))
        .and_then(|bytes| serde_json::from_slice(&bytes).ok());
    if parsed.is_none() {
        warn!(backup = %backup.display(), "lock manifest missing or unreadable; using default .git modes");
    }
    parsed
}

/// Regular files under `root`, relative to it.
fn enumerate_files(root: &Path) -> BTreeSet<String> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(root)
                .ok()
                .map(|p| p.to_string_lossy().into_owned())
        })
        .collect()
}

/// Copy a file, symlink or directory tree without following symlinks.
fn copy_entry(src: &Path, dst: &Path) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if meta.file_type().is_symlink() {
        return symlink(fs::read_link(src)?, dst);
    }
    if meta.is_file() {
        return fs::copy(src, dst).map(|_| ());
    }
    // Directories stay writable until their contents are in place.
    let mut dir_modes = Vec::new();
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let target = dst.join(rel);
        let ft = entry.file_type();
        if ft.is_dir() {
            fs::create_dir(&target)?;
            fs::set_permissions(&target, fs::Permissions::from_mode(0o700))?;
            dir_modes.push((target, entry.metadata()?.permissions().mode() & 0o7777));
        } else if ft.is_symlink() {
            symlink(fs::read_link(entry.path())?, &target)?;
        } else if ft.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    for (dir, mode) in dir_modes.into_iter().rev() {
        fs::set_permissions(&dir, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

/// Make a (possibly locked) tree writable and delete it.
fn force_remove(path: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(path).follow_links(false) {
        let Ok(entry) = entry else { continue };
        let mode = if entry.file_type().is_dir() {
            0o700
        } else if entry.file_type().is_file() {
            0o600
        } else {
            continue;
        };
        let _ = fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode));
    }
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn repo() -> (TempDir, Git) {
        let dir = TempDir::new().unwrap();
        let git = Git::new(dir.path(), Duration::from_secs(30));
        git.run(&["init", "-q"]).unwrap();
        git.run(&["config", "user.email", "t@example.com"]).unwrap();
        git.run(&["config", "user.name", "t"]).unwrap();
        fs::write(dir.path().join(".gitignore"), ".env\nbuild/\n").unwrap();
        fs::write(dir.path().join("main.rs"), "fn main() {}\n").unwrap();
        git.run(&["add", "-A"]).unwrap();
        git.run(&["commit", "-q", "-m", "init"]).unwrap();
        fs::write(dir.path().join(".env"), "TOKEN=1\n").unwrap();
        fs::set_permissions(dir.path().join(".env"), fs::Permissions::from_mode(0o600)).unwrap();
        fs::create_dir(dir.path().join("build")).unwrap();
        fs::write(dir.path().join("build/out.o"), [0u8, 1, 2]).unwrap();
        (dir, git)
    }

    #[test]
    fn test_create_records_ignored_files_and_modes() {
        let tmp = TempDir::new().unwrap();
        let vault = BackupVault::with_temp_root(tmp.path());
        let (ws, git) = repo();

        let backup = vault.create(ws.path(), &git).unwrap();
        let listed = backup.sidecar.pre_agent_ignored.clone().unwrap();
        assert!(listed.contains(".env"));
        assert!(listed.contains("build/out.o"));
        assert_eq!(backup.sidecar.pre_agent_modes[".env"], 0o600);
        assert!(backup.path.join(".git/HEAD").is_file());
        assert!(backup.path.join("ignored/build/out.o").is_file());
        assert!(ws.path().join(WORKSPACE_SIDECAR).is_file());
        vault.check_plausible(&backup.path, true).unwrap();

        vault.lock(&backup.path).unwrap();
        let manifest = read_manifest(&backup.path).unwrap();
        assert!(manifest.contains_key(".git/HEAD"));
        assert!(manifest.contains_key(DURABLE_SIDECAR));
        assert_eq!(manifest["ignored/build/out.o"] & 0o200, 0o200);
        assert!(!manifest.contains_key(LOCK_MANIFEST));
        let mode = fs::metadata(backup.path.join(DURABLE_SIDECAR))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o444);

        vault.destroy(&backup.path).unwrap();
        assert!(!backup.path.exists());
    }

    #[test]
    fn test_plausibility_rejects_foreign_dirs() {
        let tmp = TempDir::new().unwrap();
        let vault = BackupVault::with_temp_root(tmp.path());

        let wrong_name = tmp.path().join("not_ours");
        fs::create_dir_all(wrong_name.join(".git")).unwrap();
        assert!(vault.check_plausible(&wrong_name, true).is_err());

        let elsewhere = TempDir::new().unwrap();
        let outside = elsewhere.path().join(format!("{}x", BACKUP_PREFIX));
        fs::create_dir_all(outside.join(".git")).unwrap();
        assert!(vault.check_plausible(&outside, true).is_err());

        let no_git = tmp.path().join(format!("{}y", BACKUP_PREFIX));
        fs::create_dir(&no_git).unwrap();
        assert!(vault.check_plausible(&no_git, true).is_err());
        assert!(vault.check_plausible(&no_git, false).is_ok());
        assert!(vault.destroy(&wrong_name).is_err());
        assert!(wrong_name.exists());
    }

    #[test]
    fn test_restore_ignored_recovers_content_and_removes_new_files() {
        let tmp = TempDir::new().unwrap();
        let vault = BackupVault::with_temp_root(tmp.path());
        let (ws, git) = repo();
        let backup = vault.create(ws.path(), &git).unwrap();
        vault.lock(&backup.path).unwrap();

        fs::remove_file(ws.path().join(".env")).unwrap();
        fs::write(ws.path().join("build/out.o"), "tampered").unwrap();
        fs::write(ws.path().join("build/new.o"), "agent").unwrap();

        let original = OriginalRef::new("main", "h", "h", &backup.path);
        let resolved = vault.resolve(ws.path(), Some(&original)).unwrap();
        let report = vault.restore_ignored(ws.path(), &git, &resolved);

        assert_eq!(fs::read_to_string(ws.path().join(".env")).unwrap(), "TOKEN=1\n");
        let mode = fs::metadata(ws.path().join(".env")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(fs::read(ws.path().join("build/out.o")).unwrap(), vec![0u8, 1, 2]);
        assert!(!ws.path().join("build/new.o").exists());
        assert!(report.removed.contains(&"build/new.o".to_string()));
        vault.destroy(&backup.path).unwrap();
    }

    #[test]
    fn test_original_ref_debug_is_redacted() {
        let r = OriginalRef::new("main", "abc", "abc", "/tmp/agent_eval_git_bak_secret");
        let dbg = format!("{:?}", r);
        assert!(!dbg.contains("secret"));
        assert!(dbg.contains("<redacted>"));
    }
}
