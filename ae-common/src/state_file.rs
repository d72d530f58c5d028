//! Per-workspace state kept outside the workspace.
//!
//! A plain `KEY=value` file, one per workspace, named after a hash of the
//! canonical workspace path:
//!
//! ```text
//! # agent-eval workspace state
//! WORKSPACE=/work/repo
//! CLEAN_COMMIT=4b825dc642cb6eb9a060e54bf8d69288fbee4904
//! BASE_COMMIT=...
//! SOURCE_URL=https://github.com/o/r.git
//! CREATED_AT=2026-10-18T09:12:44Z
//! ORIGINAL_REF=main
//! WORKSPACE_CREATED=true
//! STATUS=prepared
//! ```
//!
//! The file is parsed field by field and never executed.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::errors::ValidationError;

const HEADER: &str = "# agent-eval workspace state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkspaceStatus {
    Prepared,
    Restored,
    NeedsManualIntervention,
}

impl WorkspaceStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Prepared => "prepared",
            Self::Restored => "restored",
            Self::NeedsManualIntervention => "needs-manual-intervention",
        }
    }
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkspaceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prepared" => Ok(Self::Prepared),
            "restored" => Ok(Self::Restored),
            "needs-manual-intervention" => Ok(Self::NeedsManualIntervention),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceState {
    pub workspace: Option<PathBuf>,
    /// HEAD of the target branch before the ground-truth patch was reversed.
    pub clean_commit: String,
    /// The single sanitized commit the agent starts from.
    pub base_commit: Option<String>,
    pub source_url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub original_ref: Option<String>,
    pub workspace_created: bool,
    pub status: WorkspaceStatus,
}

/// 40 (SHA-1) or 64 (SHA-256) hex characters.
pub fn is_commit_hash(s: &str) -> bool {
    (s.len() == 40 || s.len() == 64) && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// A ref we are willing to hand to `git checkout`.
pub fn is_safe_ref(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('-')
        && !s.contains("..")
        && s.chars().all(|c| !c.is_whitespace() && !c.is_control())
}

fn strip_quotes(v: &str) -> &str {
    for q in ['"', '\''] {
        if v.len() >= 2 && v.starts_with(q) && v.ends_with(q) {
            return &v[1..v.len() - 1];
        }
    }
    v
}

fn is_key(k: &str) -> bool {
    !k.is_empty() && k.bytes().all(|b| b.is_ascii_uppercase() || b == b'_')
}

impl WorkspaceState {
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut workspace = None;
        let mut clean_commit = None;
        let mut base_commit = None;
        let mut source_url = None;
        let mut created_at = None;
        let mut original_ref = None;
        let mut workspace_created = false;
        let mut status = WorkspaceStatus::Prepared;

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let lineno = idx + 1;
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| format!("line {}: expected KEY=value", lineno))?;
            let key = key.trim();
            if !is_key(key) {
                return Err(format!("line {}: invalid key '{}'", lineno, key));
            }
            let value = strip_quotes(value.trim());
            match key {
                "WORKSPACE" => workspace = Some(PathBuf::from(value)),
                "CLEAN_COMMIT" | "BASE_COMMIT" => {
                    if !is_commit_hash(value) {
                        return Err(format!("line {}: {} is not a commit hash", lineno, key));
                    }
                    let slot = if key == "CLEAN_COMMIT" {
                        &mut clean_commit
                    } else {
                        &mut base_commit
                    };
                    *slot = Some(value.to_ascii_lowercase());
                }
                "SOURCE_URL" => source_url = (!value.is_empty()).then(|| value.to_string()),
                "CREATED_AT" => {
                    let ts = DateTime::parse_from_rfc3339(value)
                        .map_err(|e| format!("line {}: CREATED_AT: {}", lineno, e))?;
                    created_at = Some(ts.with_timezone(&Utc));
                }
                "ORIGINAL_REF" => {
                    if !value.is_empty() {
                        if !is_safe_ref(value) {
                            return Err(format!("line {}: ORIGINAL_REF is not a valid ref", lineno));
                        }
                        original_ref = Some(value.to_string());
                    }
                }
                "WORKSPACE_CREATED" => {
                    workspace_created = match value {
                        "true" | "1" => true,
                        "false" | "0" | "" => false,
                        other => {
                            return Err(format!(
                                "line {}: WORKSPACE_CREATED must be true/false, got '{}'",
                                lineno, other
                            ));
                        }
                    }
                }
                "STATUS" => status = value.parse().map_err(|e| format!("line {}: {}", lineno, e))?,
                _ => {}
            }
        }

        Ok(Self {
            workspace,
            clean_commit: clean_commit.ok_or("missing CLEAN_COMMIT")?,
            base_commit,
            source_url,
            created_at,
            original_ref,
            workspace_created,
            status,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(HEADER);
        out.push('\n');
        let mut put = |k: &str, v: &str| {
            out.push_str(k);
            out.push('=');
            out.push_str(v);
            out.push('\n');
        };
        if let Some(ws) = &self.workspace {
            put("WORKSPACE", &ws.display().to_string());
        }
        put("CLEAN_COMMIT", &self.clean_commit);
        if let Some(base) = &self.base_commit {
            put("BASE_COMMIT", base);
        }
        put("SOURCE_URL", self.source_url.as_deref().unwrap_or(""));
        if let Some(ts) = &self.created_at {
            put("CREATED_AT", &ts.to_rfc3339_opts(SecondsFormat::Secs, true));
        }
        put("ORIGINAL_REF", self.original_ref.as_deref().unwrap_or(""));
        put(
            "WORKSPACE_CREATED",
            if self.workspace_created { "true" } else { "false" },
        );
        put("STATUS", self.status.as_str());
        out
    }
}

/// Directory of state files.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Canonical path when the workspace exists, absolute path otherwise.
    pub fn workspace_key(workspace: &Path) -> PathBuf {
        workspace
            .canonicalize()
            .or_else(|_| std::path::absolute(workspace))
            .unwrap_or_else(|_| workspace.to_path_buf())
    }

    pub fn path_for(&self, workspace: &Path) -> PathBuf {
        let key = Self::workspace_key(workspace);
        let hash = blake3::hash(key.as_os_str().as_encoded_bytes());
        let hex = hash.to_hex();
        self.dir.join(format!("{}.state", &hex[..16]))
    }

    pub fn load(&self, workspace: &Path) -> Result<Option<WorkspaceState>, ValidationError> {
        let path = self.path_for(workspace);
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ValidationError::StateFile {
                    path,
                    detail: e.to_string(),
                });
            }
        };
        WorkspaceState::parse(&text)
            .map(Some)
            .map_err(|detail| ValidationError::StateFile { path, detail })
    }

    /// Like [`load`](Self::load) but a missing file is an error.
    pub fn require(&self, workspace: &Path) -> Result<WorkspaceState, ValidationError> {
        self.load(workspace)?.ok_or_else(|| ValidationError::StateFile {
            path: self.path_for(workspace),
            detail: "not found; run `ae prepare` first".to_string(),
        })
    }

    /// Write atomically (temp file in the same directory, then rename).
    pub fn save(&self, workspace: &Path, state: &WorkspaceState) -> Result<PathBuf, ValidationError> {
        let path = self.path_for(workspace);
        let fail = |detail: String| ValidationError::StateFile {
            path: path.clone(),
            detail,
        };
        std::fs::create_dir_all(&self.dir).map_err(|e| fail(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| fail(e.to_string()))?;
        tmp.write_all(state.render().as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| fail(e.to_string()))?;
        tmp.persist(&path).map_err(|e| fail(e.error.to_string()))?;
        Ok(path)
    }

    pub fn set_status(&self, workspace: &Path, status: WorkspaceStatus) -> Result<(), ValidationError> {
        if let Some(mut state) = self.load(workspace)? {
            state.status = status;
            self.save(workspace, &state)?;
        }
        Ok(())
    }

    pub fn remove(&self, workspace: &Path) -> Result<(), ValidationError> {
        let path = self.path_for(workspace);
        match std::fs::remove_file(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(ValidationError::StateFile {
                path,
                detail: e.to_string(),
            }),
            _ => Ok(()),
        }
    }
}
