//! Subprocess runner for `git` (and the `patch` fallback).
//!
//! Every call has a timeout, captures both streams and never goes through a
//! shell. Repository-local hooks and fsmonitor commands are disabled on each
//! invocation: after the agent has run, `.git/config` and `.git/hooks` of the
//! sanitized repository are attacker-controlled.

use std::ffi::OsStr;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::errors::GitOperationError;

/// Overrides applied to every git invocation.
const HARDENING_ARGS: &[&str] = &[
    "-c",
    "core.hooksPath=/dev/null",
    "-c",
    "core.fsmonitor=false",
    "-c",
    "core.pager=cat",
];

/// Captured result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|s| s.success())
    }

    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    /// Stdout as lossy UTF-8 with surrounding whitespace removed.
    pub fn stdout_trimmed(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Run `command` to completion, killing it once `timeout` elapses.
pub fn run_with_timeout(command: &mut Command, timeout: Duration) -> std::io::Result<CommandOutput> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout {
            let _ = out.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut err) = stderr {
            let _ = err.read_to_end(&mut buf);
        }
        buf
    });

    let start = Instant::now();
    let mut timed_out = false;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break Some(status),
            None => {
                if start.elapsed() >= timeout {
                    timed_out = true;
                    let _ = child.kill();
                    break child.wait().ok();
                }
                thread::sleep(Duration::from_millis(20));
            }
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandOutput {
        status,
        stdout: stdout_bytes,
        stderr: String::from_utf8_lossy(&stderr_bytes).trim().to_string(),
        timed_out,
    })
}

/// A git runner bound to one working directory.
#[derive(Debug, Clone)]
pub struct Git {
    dir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new("git");
        cmd.args(HARDENING_ARGS)
            .args(args)
            .current_dir(&self.dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_PAGER", "cat")
            .env("LC_ALL", "C");
        cmd
    }

    /// Run without checking the exit status. Spawn failures and timeouts are
    /// still errors.
    pub fn run_unchecked(&self, args: &[&str]) -> Result<CommandOutput, GitOperationError> {
        let joined = args.join(" ");
        trace!(dir = %self.dir.display(), "git {}", joined);
        let output = run_with_timeout(&mut self.command(args), self.timeout).map_err(|source| {
            GitOperationError::Spawn {
                args: joined.clone(),
                source,
            }
        })?;
        if output.timed_out {
            return Err(GitOperationError::Timeout {
                args: joined,
                secs: self.timeout.as_secs(),
            });
        }
        if !output.success() {
            debug!(code = ?output.code(), stderr = %output.stderr, "git {} failed", joined);
        }
        Ok(output)
    }

    /// Run and require exit status 0.
    pub fn run(&self, args: &[&str]) -> Result<CommandOutput, GitOperationError> {
        let output = self.run_unchecked(args)?;
        if output.success() {
            Ok(output)
        } else {
            Err(GitOperationError::Failed {
                args: args.join(" "),
                code: output.code(),
                stderr: output.stderr,
            })
        }
    }

    /// Run and return trimmed stdout.
    pub fn stdout(&self, args: &[&str]) -> Result<String, GitOperationError> {
        Ok(self.run(args)?.stdout_trimmed())
    }

    /// Whether `dir` is the top of a working tree with its own `.git`.
    pub fn is_repository(&self) -> bool {
        self.dir.join(".git").exists()
            && self
                .run_unchecked(&["rev-parse", "--git-dir"])
                .is_ok_and(|o| o.success())
    }

    pub fn head(&self) -> Result<String, GitOperationError> {
        self.stdout(&["rev-parse", "HEAD"])
    }

    /// Current branch name, or the commit hash when HEAD is detached.
    pub fn current_ref(&self) -> Result<String, GitOperationError> {
        let out = self.run_unchecked(&["symbolic-ref", "--quiet", "--short", "HEAD"])?;
        if out.success() {
            let name = out.stdout_trimmed();
            if !name.is_empty() {
                return Ok(name);
            }
        }
        self.head()
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool, GitOperationError> {
        let refname = format!("refs/heads/{}", branch);
        Ok(self
            .run_unchecked(&["show-ref", "--verify", "--quiet", &refname])?
            .success())
    }

    /// Whether `rev` names a commit present in the object store.
    pub fn has_commit(&self, rev: &str) -> Result<bool, GitOperationError> {
        let spec = format!("{}^{{commit}}", rev);
        Ok(self.run_unchecked(&["cat-file", "-e", &spec])?.success())
    }

    pub fn remote_url(&self, remote: &str) -> Result<Option<String>, GitOperationError> {
        let out = self.run_unchecked(&["remote", "get-url", remote])?;
        let url = out.stdout_trimmed();
        Ok((out.success() && !url.is_empty()).then_some(url))
    }

    /// `git reset --hard <rev>` followed by `git clean -fd`.
    pub fn reset_hard_and_clean(&self, rev: &str) -> Result<(), GitOperationError> {
        self.run(&["reset", "--hard", rev])?;
        self.run(&["clean", "-fd"])?;
        Ok(())
    }

    /// Whether `rel` is currently tracked.
    pub fn is_tracked(&self, rel: &str) -> Result<bool, GitOperationError> {
        Ok(self
            .run_unchecked(&["ls-files", "--error-unmatch", "--", rel])?
            .success())
    }

    /// Whether the working tree differs from HEAD (including untracked files).
    pub fn is_dirty(&self) -> Result<bool, GitOperationError> {
        let out = self.run(&["status", "--porcelain", "--untracked-files=all"])?;
        Ok(!out.stdout.is_empty())
    }

    /// Untracked files matched by ignore rules, as repo-relative paths.
    pub fn ignored_files(&self) -> Result<Vec<String>, GitOperationError> {
        let out = self.run(&[
            "ls-files",
            "-z",
            "--others",
            "--ignored",
            "--exclude-standard",
        ])?;
        Ok(out
            .stdout
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect())
    }

    /// `git clone <source> <dest>`, run from `dest`'s parent.
    pub fn clone_into(source: &str, dest: &Path, timeout: Duration) -> Result<(), GitOperationError> {
        let parent = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let dest_str = dest.to_string_lossy();
        Git::new(parent, timeout)
            .run(&["clone", "--quiet", "--", source, &dest_str])
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_repo() -> (TempDir, Git) {
        let dir = TempDir::new().unwrap();
        let git = Git::new(dir.path(), Duration::from_secs(30));
        git.run(&["init", "-q", "-b", "main"]).unwrap();
        git.run(&["config", "user.email", "t@example.com"]).unwrap();
        git.run(&["config", "user.name", "t"]).unwrap();
        std::fs::write(dir.path().join("a.txt"), "a\n").unwrap();
        git.run(&["add", "-A"]).unwrap();
        git.run(&["commit", "-q", "-m", "init"]).unwrap();
        (dir, git)
    }

    #[test]
    fn test_head_and_current_ref() {
        let (_dir, git) = init_repo();
        let head = git.head().unwrap();
        assert_eq!(head.len(), 40);
        assert_eq!(git.current_ref().unwrap(), "main");
        git.run(&["checkout", "-q", "--detach"]).unwrap();
        assert_eq!(git.current_ref().unwrap(), head);
    }

    #[test]
    fn test_failed_command_reports_stderr() {
        let (_dir, git) = init_repo();
        let err = git.run(&["checkout", "no-such-branch"]).unwrap_err();
        match err {
            GitOperationError::Failed { args, .. } => assert!(args.contains("no-such-branch")),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!git.branch_exists("no-such-branch").unwrap());
        assert!(git.branch_exists("main").unwrap());
    }

    #[test]
    fn test_tracked_and_ignored() {
        let (dir, git) = init_repo();
        std::fs::write(dir.path().join(".gitignore"), "*.log\n").unwrap();
        std::fs::write(dir.path().join("x.log"), "log").unwrap();
        assert!(git.is_tracked("a.txt").unwrap());
        assert!(!git.is_tracked("x.log").unwrap());
        assert_eq!(git.ignored_files().unwrap(), vec!["x.log".to_string()]);
        assert!(git.is_dirty().unwrap());
    }

    #[test]
    fn test_timeout_kills_process() {
        let start = Instant::now();
        let out = run_with_timeout(
            Command::new("sleep").arg("5"),
            Duration::from_millis(200),
        )
        .unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_hooks_are_not_executed() {
        use std::os::unix::fs::PermissionsExt;
        let (dir, git) = init_repo();
        let marker = dir.path().join("hook-ran");
        let hook = dir.path().join(".git/hooks/pre-commit");
        std::fs::write(&hook, format!("#!/bin/sh\ntouch {}\n", marker.display())).unwrap();
        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        git.run(&["add", "-A"]).unwrap();
        git.run(&["commit", "-q", "-m", "second"]).unwrap();
        assert!(!marker.exists());
    }
}
