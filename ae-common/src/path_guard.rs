//! Checks applied to every path that comes out of backup metadata before
//! anything is written into the workspace.
//!
//! The sidecar lists paths the agent may have rewritten, so each entry must
//! pass three gates:
//! 1. [`is_safe_relative_path`]: relative, no `..`, not inside `.git`.
//! 2. [`is_version_control_tracked`]: tracked content is never overwritten
//!    from the backup.
//! 3. [`verify_within_boundary`]: after parent directories exist, the
//!    canonical location is still under the workspace root. This runs on
//!    every restored path, including ones whose parents already existed.
//!
//! A failing gate skips that one file; it never aborts a restore.

use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::git::Git;

/// Name of the version-control internals directory.
pub const VCS_DIR: &str = ".git";

/// Why a restore target was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathRejection {
    Unsafe,
    Tracked,
    SymlinkedParent(PathBuf),
    NotADirectory(PathBuf),
    EscapesRoot,
    Io(String),
}

impl fmt::Display for PathRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsafe => write!(f, "absolute, traversing or inside {}", VCS_DIR),
            Self::Tracked => write!(f, "tracked by git"),
            Self::SymlinkedParent(p) => write!(f, "parent {} is a symlink", p.display()),
            Self::NotADirectory(p) => write!(f, "parent {} is not a directory", p.display()),
            Self::EscapesRoot => write!(f, "resolves outside the workspace"),
            Self::Io(e) => write!(f, "{}", e),
        }
    }
}

/// Reject absolute paths, any `..` segment, and anything under `.git`.
///
/// `.git` is compared case-insensitively so a case-folding filesystem does
/// not turn `.GIT/hooks/x` into a hook.
pub fn is_safe_relative_path(path: &str) -> bool {
    if path.is_empty() || path.contains('\0') {
        return false;
    }
    let mut saw_normal = false;
    for component in Path::new(path).components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => return false,
            Component::CurDir => {}
            Component::Normal(name) => {
                if name.to_string_lossy().eq_ignore_ascii_case(VCS_DIR) {
                    return false;
                }
                saw_normal = true;
            }
        }
    }
    saw_normal
}

/// Whether git currently tracks `rel`. Errors count as tracked.
pub fn is_version_control_tracked(git: &Git, rel: &str) -> bool {
    git.is_tracked(rel).unwrap_or(true)
}

/// Whether `candidate`, resolved through its (existing) parent directory,
/// lies under `root`'s canonical location.
///
/// The final component is not followed: whatever sits there gets unlinked
/// before the write.
pub fn verify_within_boundary(root: &Path, candidate: &Path) -> bool {
    let Ok(real_root) = root.canonicalize() else {
        return false;
    };
    let Some(parent) = candidate.parent() else {
        return false;
    };
    let Some(name) = candidate.file_name() else {
        return false;
    };
    let Ok(real_parent) = parent.canonicalize() else {
        return false;
    };
    let resolved = real_parent.join(name);
    resolved.starts_with(&real_root) && resolved != real_root
}

/// Create the parent directories of `rel` under `root` one level at a time,
/// refusing to walk through a symlink. Nothing is created outside `root`.
pub fn create_parent_dirs(root: &Path, rel: &Path) -> Result<(), PathRejection> {
    let Some(parent) = rel.parent() else {
        return Ok(());
    };
    let mut current = root.to_path_buf();
    for component in parent.components() {
        let Component::Normal(name) = component else {
            continue;
        };
        current.push(name);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(PathRejection::SymlinkedParent(current));
            }
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(PathRejection::NotADirectory(current)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                std::fs::create_dir(&current).map_err(|e| PathRejection::Io(e.to_string()))?;
            }
            Err(e) => return Err(PathRejection::Io(e.to_string())),
        }
    }
    Ok(())
}

/// Run all gates for one backup-sourced path and return the destination.
pub fn guard_restore_target(root: &Path, git: &Git, rel: &str) -> Result<PathBuf, PathRejection> {
    if !is_safe_relative_path(rel) {
        return Err(PathRejection::Unsafe);
    }
    if is_version_control_tracked(git, rel) {
        return Err(PathRejection::Tracked);
    }
    create_parent_dirs(root, Path::new(rel))?;
    let dest = root.join(rel);
    if !verify_within_boundary(root, &dest) {
        return Err(PathRejection::EscapesRoot);
    }
    Ok(dest)
}

/// Remove whatever is at `path` without following symlinks.
pub fn remove_entry(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_rejects_traversal_absolute_and_vcs() {
        assert!(!is_safe_relative_path("../x"));
        assert!(!is_safe_relative_path("a/../../x"));
        assert!(!is_safe_relative_path("/etc/passwd"));
        assert!(!is_safe_relative_path(".git/hooks/pre-commit"));
        assert!(!is_safe_relative_path("./.git/config"));
        assert!(!is_safe_relative_path(".GIT/hooks/post-checkout"));
        assert!(!is_safe_relative_path("vendor/dep/.git/hooks/x"));
        assert!(!is_safe_relative_path(""));
        assert!(!is_safe_relative_path("."));
    }

    #[test]
    fn test_accepts_ordinary_paths() {
        assert!(is_safe_relative_path(".env"));
        assert!(is_safe_relative_path("build/out/app.o"));
        assert!(is_safe_relative_path("./config/local.toml"));
        assert!(is_safe_relative_path(".gitignore"));
        assert!(is_safe_relative_path(".github/workflows/ci.yml"));
    }

    #[test]
    fn test_boundary_rejects_symlinked_intermediate() {
        let root = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        symlink(outside.path(), root.path().join("cache")).unwrap();

        let candidate = root.path().join("cache").join("secret.txt");
        assert!(!verify_within_boundary(root.path(), &candidate));

        std::fs::create_dir(root.path().join("real")).unwrap();
        assert!(verify_within_boundary(
            root.path(),
            &root.path().join("real").join("f")
        ));
    }

    #[test]
    fn test_boundary_does_not_follow_final_symlink() {
        let root = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        symlink(outside.path().join("x"), root.path().join("link")).unwrap();
        assert!(verify_within_boundary(root.path(), &root.path().join("link")));
    }

    #[test]
    fn test_create_parent_dirs_refuses_symlink() {
        let root = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        symlink(outside.path(), root.path().join("out")).unwrap();

        let err = create_parent_dirs(root.path(), Path::new("out/deep/file")).unwrap_err();
        assert!(matches!(err, PathRejection::SymlinkedParent(_)));
        assert!(!outside.path().join("deep").exists());

        create_parent_dirs(root.path(), Path::new("a/b/c/file")).unwrap();
        assert!(root.path().join("a/b/c").is_dir());
    }

    #[test]
    fn test_remove_entry_keeps_symlink_target() {
        let root = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let target = outside.path().join("keep.txt");
        std::fs::write(&target, "keep").unwrap();
        let link = root.path().join("link");
        symlink(&target, &link).unwrap();

        remove_entry(&link).unwrap();
        assert!(std::fs::symlink_metadata(&link).is_err());
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "keep");
        remove_entry(&link).unwrap();
    }

    proptest! {
        #[test]
        fn prop_never_panics(s in "\\PC*") {
            let _ = is_safe_relative_path(&s);
        }

        #[test]
        fn prop_parent_segment_always_rejected(
            prefix in "[a-z]{0,8}(/[a-z]{1,8}){0,3}",
            suffix in "[a-z]{1,8}(/[a-z]{1,8}){0,3}",
        ) {
            let path = if prefix.is_empty() {
                format!("../{}", suffix)
            } else {
                format!("{}/../{}", prefix, suffix)
            };
            prop_assert!(!is_safe_relative_path(&path));
        }

        #[test]
        fn prop_absolute_always_rejected(rest in "[a-z]{1,8}(/[a-z]{1,8}){0,3}") {
            let path = format!("/{}", rest);
            prop_assert!(!is_safe_relative_path(&path));
        }
    }
}
