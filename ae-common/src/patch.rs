//! Turn the agent's working tree into a validated unified diff.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::{LifecycleError, PatchValidationError};
use crate::git::Git;
use crate::vault::WORKSPACE_SIDECAR;

/// Files the harness writes into the workspace; never part of a patch.
const INTERNAL_FILES: &[&str] = &[WORKSPACE_SIDECAR];

/// The agent's change set. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchArtifact {
    diff: String,
    files: Vec<String>,
}

impl PatchArtifact {
    /// Validate `diff` and collect the files it touches.
    pub fn new(diff: String) -> Result<Self, PatchValidationError> {
        validate_patch(&diff)?;
        let files = changed_files(&diff);
        Ok(Self { diff, files })
    }

    pub fn diff(&self) -> &str {
        &self.diff
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn line_count(&self) -> usize {
        self.diff.lines().count()
    }

    /// Write to `dir/<stem>.patch`.
    pub fn write_to(&self, dir: &Path, stem: &str) -> Result<PathBuf, PatchValidationError> {
        fs::create_dir_all(dir).map_err(|source| PatchValidationError::Io {
            context: format!("create {}", dir.display()),
            source,
        })?;
        let path = dir.join(format!("{}.patch", stem));
        fs::write(&path, &self.diff).map_err(|source| PatchValidationError::Io {
            context: format!("write {}", path.display()),
            source,
        })?;
        info!(path = %path.display(), files = self.files.len(), "patch written");
        Ok(path)
    }
}

/// Diff of the working tree (tracked changes, deletions and new files)
/// against `base`, with harness files removed. Commits the agent made on
/// top of `base` are folded in. The index is always reset afterwards.
pub fn extract_diff(git: &Git, base: &str) -> Result<String, LifecycleError> {
    let result = git
        .run(&["add", "-A"])
        .and_then(|_| git.run(&["diff", "--cached", "--binary", base, "--"]));
    if let Err(e) = git.run(&["reset", "-q", "HEAD"]) {
        warn!(error = %e, "could not unstage after diff");
    }
    let raw = String::from_utf8_lossy(&result?.stdout).into_owned();
    let stripped = strip_internal_files(&raw);
    debug!(bytes = stripped.len(), "diff extracted");
    Ok(stripped)
}

/// Extract and validate in one step.
pub fn extract_patch(git: &Git, base: &str) -> Result<PatchArtifact, LifecycleError> {
    let diff = extract_diff(git, base)?;
    Ok(PatchArtifact::new(diff)?)
}

fn header_touches_internal(header: &str) -> bool {
    INTERNAL_FILES.iter().any(|name| {
        header.contains(&format!(" a/{} b/", name)) || header.trim_end().ends_with(&format!(" b/{}", name))
    })
}

/// Remove `diff --git` blocks that touch harness-internal files.
pub fn strip_internal_files(patch: &str) -> String {
    let mut out = String::with_capacity(patch.len());
    let mut skip = false;
    for line in patch.split_inclusive('\n') {
        if line.starts_with("diff --git ") {
            skip = header_touches_internal(line);
        }
        if !skip {
            out.push_str(line);
        }
    }
    if out.trim().is_empty() { String::new() } else { out }
}

/// Paths named by `diff --git a/X b/Y` headers (the `b/` side; the `a/`
/// side too for renames and deletions).
pub fn changed_files(patch: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    let mut push = |f: &str| {
        if !f.is_empty() && !files.iter().any(|x| x == f) {
            files.push(f.to_string());
        }
    };
    for line in patch.lines() {
        let Some(rest) = line.strip_prefix("diff --git a/") else {
            continue;
        };
        match rest.split_once(" b/") {
            Some((a, b)) => {
                push(b);
                if a != b {
                    push(a);
                }
            }
            None => push(rest),
        }
    }
    files
}

/// `@@ -a[,b] +c[,d] @@` at the start of `line`.
fn is_hunk_header(line: &str) -> bool {
    fn range<'a>(s: &'a str, sign: char) -> Option<&'a str> {
        let s = s.strip_prefix(sign)?;
        let end = s.find(|c: char| !c.is_ascii_digit() && c != ',').unwrap_or(s.len());
        let (nums, rest) = s.split_at(end);
        let mut parts = nums.splitn(2, ',');
        let first = parts.next()?;
        if first.is_empty() || parts.next().is_some_and(str::is_empty) {
            return None;
        }
        Some(rest)
    }
    let Some(rest) = line.strip_prefix("@@ ") else {
        return false;
    };
    range(rest, '-')
        .and_then(|r| r.strip_prefix(' '))
        .and_then(|r| range(r, '+'))
        .is_some_and(|r| r.starts_with(" @@"))
}

/// Check that `patch` is a well-formed git-style unified diff, block by block.
pub fn validate_patch(patch: &str) -> Result<(), PatchValidationError> {
    if patch.trim().is_empty() {
        return Err(PatchValidationError::Empty);
    }

    let mut blocks: Vec<Vec<&str>> = Vec::new();
    for line in patch.trim().lines() {
        if line.starts_with("diff --git ") {
            blocks.push(vec![line]);
        } else if let Some(block) = blocks.last_mut() {
            block.push(line);
        }
    }
    if blocks.is_empty() {
        return Err(PatchValidationError::Malformed {
            file: "<patch>".to_string(),
            reason: "no 'diff --git' header".to_string(),
        });
    }

    for block in &blocks {
        let header = block[0];
        let file = header.trim_start_matches("diff --git ").to_string();
        let has = |prefix: &str| block.iter().any(|l| l.starts_with(prefix));

        let is_rename = has("rename from ") && has("rename to ");
        let is_mode_change = has("old mode ") && has("new mode ");
        let is_binary = has("Binary files ") || has("GIT binary patch");
        let hunks = block.iter().filter(|l| is_hunk_header(l)).count();

        if hunks == 0 && (is_rename || is_mode_change || is_binary) {
            continue;
        }
        // Empty new or deleted file: header only.
        if hunks == 0 && (has("new file mode ") || has("deleted file mode ")) && !has("--- ") {
            continue;
        }
        let malformed = |reason: &str| PatchValidationError::Malformed {
            file: file.clone(),
            reason: reason.to_string(),
        };
        if !has("--- ") || !has("+++ ") {
            return Err(malformed("missing '---' or '+++' header"));
        }
        if hunks == 0 {
            return Err(malformed("no '@@ ... @@' hunk header"));
        }

        let mut in_hunk = false;
        let mut content = 0usize;
        for line in block.iter().skip(1) {
            if is_hunk_header(line) {
                in_hunk = true;
                continue;
            }
            if !in_hunk {
                continue;
            }
            if ["--- ", "+++ ", "index ", "new file", "deleted file"]
                .iter()
                .any(|p| line.starts_with(p))
            {
                in_hunk = false;
                continue;
            }
            if line.starts_with([' ', '+', '-', '\\']) {
                content += 1;
            }
        }
        if content == 0 {
            return Err(malformed("hunk headers without content"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{commit_all, init_repo};
    use tempfile::TempDir;

    const MODIFY: &str = "diff --git a/src/lib.rs b/src/lib.rs
index 1111111..2222222 100644
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,2 +1,2 @@
 fn a() {}
-fn b() {}
+fn b() { todo() }
";

    #[test]
    fn test_valid_modify() {
        let p = PatchArtifact::new(MODIFY.to_string()).unwrap();
        assert_eq!(p.files(), ["src/lib.rs"]);
        assert_eq!(p.line_count(), 8);
    }

    #[test]
    fn test_hunk_header_forms() {
        assert!(is_hunk_header("@@ -1,2 +1,3 @@"));
        assert!(is_hunk_header("@@ -0,0 +1 @@ fn main() {"));
        assert!(is_hunk_header("@@ -7 +7 @@"));
        assert!(!is_hunk_header("@@ -1, +1 @@"));
        assert!(!is_hunk_header("@@ -a +1 @@"));
        assert!(!is_hunk_header("@@@ -1 +1 @@@"));
        assert!(!is_hunk_header(" @@ -1 +1 @@"));
    }

    #[test]
    fn test_empty_is_typed() {
        assert!(matches!(validate_patch("  \n"), Err(PatchValidationError::Empty)));
    }

    #[test]
    fn test_metadata_only_blocks_are_valid() {
        let rename = "diff --git a/old.rs b/new.rs\nsimilarity index 100%\nrename from old.rs\nrename to new.rs\n";
        let mode = "diff --git a/run.sh b/run.sh\nold mode 100644\nnew mode 100755\n";
        let binary = "diff --git a/img.png b/img.png\nindex 1..2 100644\nBinary files a/img.png and b/img.png differ\n";
        let empty_new = "diff --git a/empty b/empty\nnew file mode 100644\nindex 0000000..e69de29\n";
        for p in [rename, mode, binary, empty_new] {
            validate_patch(p).unwrap();
        }
        assert_eq!(changed_files(rename), ["new.rs", "old.rs"]);
    }

    #[test]
    fn test_malformed_blocks() {
        let no_hunk = "diff --git a/x b/x\n--- a/x\n+++ b/x\n";
        let no_headers = "diff --git a/x b/x\n@@ -1 +1 @@\n-a\n+b\n";
        let no_content = "diff --git a/x b/x\n--- a/x\n+++ b/x\n@@ -1 +1 @@\n";
        for p in [no_hunk, no_headers, no_content, "just text\n"] {
            assert!(
                matches!(validate_patch(p), Err(PatchValidationError::Malformed { .. })),
                "accepted: {p}"
            );
        }
        let mixed = format!("{}{}", MODIFY, no_hunk);
        assert!(validate_patch(&mixed).is_err());
    }

    #[test]
    fn test_strip_internal_exact_match() {
        let sidecar = format!(
            "diff --git a/{0} b/{0}\nnew file mode 100644\n--- /dev/null\n+++ b/{0}\n@@ -0,0 +1 @@\n+{{}}\n",
            WORKSPACE_SIDECAR
        );
        let lookalike = format!(
            "diff --git a/{0}-notes b/{0}-notes\n--- a/{0}-notes\n+++ b/{0}-notes\n@@ -1 +1 @@\n-a\n+b\n",
            WORKSPACE_SIDECAR
        );
        assert_eq!(strip_internal_files(&sidecar), "");
        let combined = format!("{}{}{}", MODIFY, sidecar, lookalike);
        let stripped = strip_internal_files(&combined);
        assert!(stripped.contains("src/lib.rs"));
        assert!(stripped.contains("-notes"));
        assert!(!stripped.contains(&format!("b/{}\n", WORKSPACE_SIDECAR)));
    }

    #[test]
    fn test_extract_includes_new_files_and_unstages() {
        let dir = TempDir::new().unwrap();
        let git = init_repo(dir.path()).unwrap();
        fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        let base = commit_all(&git, "init").unwrap();

        fs::write(dir.path().join("a.txt"), "two\n").unwrap();
        fs::write(dir.path().join("new.txt"), "fresh\n").unwrap();
        fs::write(dir.path().join(WORKSPACE_SIDECAR), "{}").unwrap();

        let patch = extract_patch(&git, &base).unwrap();
        assert_eq!(patch.files(), ["a.txt", "new.txt"]);
        let staged = git.stdout(&["diff", "--cached", "--name-only"]).unwrap();
        assert!(staged.is_empty());

        fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        fs::remove_file(dir.path().join("new.txt")).unwrap();
        let err = extract_patch(&git, &base).unwrap_err();
        assert!(matches!(err, LifecycleError::PatchValidation(PatchValidationError::Empty)));
    }

    #[test]
    fn test_extract_folds_in_commits_made_after_base() {
        let dir = TempDir::new().unwrap();
        let git = init_repo(dir.path()).unwrap();
        fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        let base = commit_all(&git, "init").unwrap();

        fs::write(dir.path().join("a.txt"), "two\n").unwrap();
        commit_all(&git, "agent work").unwrap();
        fs::write(dir.path().join("b.txt"), "uncommitted\n").unwrap();

        let patch = extract_patch(&git, &base).unwrap();
        assert_eq!(patch.files(), ["a.txt", "b.txt"]);
        assert!(patch.diff().contains("+two"));
        assert_ne!(git.head().unwrap(), base);
    }
}
