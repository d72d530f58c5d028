//! Sidecar records and their trust levels.
//!
//! The same record is kept in three places, from most to least trusted:
//! the controller's in-memory [`OriginalRef`](super::OriginalRef), a hint
//! file under `.git/info/` pointing at the durable copy in the backup
//! directory, and a file in the working tree. Parsing never trusts keys to
//! exist or to have the right type.

use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// Sidecar file inside the working tree.
pub const WORKSPACE_SIDECAR: &str = ".agent_eval_sanitize_meta.json";
/// Durable copy inside the backup directory.
pub const DURABLE_SIDECAR: &str = "sidecar.json";
/// Hint file, relative to the workspace root.
pub const HINT_FILE: &str = ".git/info/sidecar_backup";

/// Largest sidecar we are willing to parse.
const MAX_SIDECAR_BYTES: u64 = 16 * 1024 * 1024;

/// Metadata describing where a workspace's pre-agent state lives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sidecar {
    pub backup_dir: Option<PathBuf>,
    /// `None` when the list was absent or unusable.
    pub pre_agent_ignored: Option<BTreeSet<String>>,
    /// Permission bits per relative path.
    pub pre_agent_modes: BTreeMap<String, u32>,
}

impl Sidecar {
    pub fn to_json(&self) -> Value {
        json!({
            "backup_dir": self.backup_dir.as_ref().map(|p| p.display().to_string()),
            "pre_agent_ignored": self.pre_agent_ignored.as_ref().map(|s| s.iter().collect::<Vec<_>>()),
            "pre_agent_modes": self.pre_agent_modes,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec_pretty(&self.to_json()).unwrap_or_default()
    }

    /// Parse a record from a trusted location, dropping entries of the
    /// wrong type instead of rejecting the whole record.
    pub fn parse_lenient(bytes: &[u8]) -> Option<Self> {
        let value: Value = serde_json::from_slice(bytes).ok()?;
        let obj = value.as_object()?;

        let backup_dir = match obj.get("backup_dir") {
            Some(Value::String(s)) if !s.is_empty() => Some(PathBuf::from(s)),
            _ => None,
        };
        let pre_agent_ignored = match obj.get("pre_agent_ignored") {
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            _ => None,
        };
        let pre_agent_modes = match obj.get("pre_agent_modes") {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| mode_value(v).map(|m| (k.clone(), m)))
                .collect(),
            _ => BTreeMap::new(),
        };

        Some(Self {
            backup_dir,
            pre_agent_ignored,
            pre_agent_modes,
        })
    }

    /// Parse a record from the working tree. Every field must be present
    /// and well-typed, or the whole record is rejected.
    pub fn parse_strict(bytes: &[u8]) -> Result<Self, String> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| format!("invalid JSON: {}", e))?;
        let obj = value
            .as_object()
            .ok_or_else(|| format!("expected object, got {}", type_name(&value)))?;

        let backup_dir = match field(obj, "backup_dir")? {
            Value::String(s) if !s.is_empty() => PathBuf::from(s),
            Value::String(_) => return Err("backup_dir is empty".to_string()),
            other => return Err(format!("backup_dir: expected string, got {}", type_name(other))),
        };

        let ignored = match field(obj, "pre_agent_ignored")? {
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        format!("pre_agent_ignored[{}]: expected string, got {}", i, type_name(v))
                    })
                })
                .collect::<Result<BTreeSet<_>, _>>()?,
            other => {
                return Err(format!(
                    "pre_agent_ignored: expected list, got {}",
                    type_name(other)
                ));
            }
        };

        let modes = match field(obj, "pre_agent_modes")? {
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| {
                    mode_value(v)
                        .map(|m| (k.clone(), m))
                        .ok_or_else(|| format!("pre_agent_modes[{}]: expected finite mode, got {}", k, v))
                })
                .collect::<Result<BTreeMap<_, _>, _>>()?,
            other => {
                return Err(format!(
                    "pre_agent_modes: expected object, got {}",
                    type_name(other)
                ));
            }
        };

        Ok(Self {
            backup_dir: Some(backup_dir),
            pre_agent_ignored: Some(ignored),
            pre_agent_modes: modes,
        })
    }
}

fn field<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a Value, String> {
    obj.get(key).ok_or_else(|| format!("missing field {}", key))
}

/// A permission value: a finite, non-negative number that fits in `u32`.
fn mode_value(v: &Value) -> Option<u32> {
    if let Some(n) = v.as_u64() {
        return u32::try_from(n).ok();
    }
    let f = v.as_f64()?;
    if f.is_finite() && f >= 0.0 && f <= f64::from(u32::MAX) && f.fract() == 0.0 {
        Some(f as u32)
    } else {
        None
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Trust level of a resolved sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrustLevel {
    Memory,
    Hint,
    Workspace,
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Hint => write!(f, "hint file"),
            Self::Workspace => write!(f, "workspace sidecar"),
        }
    }
}

/// A sidecar tagged with the source it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSidecar {
    FromMemory(Sidecar),
    FromHint(Sidecar),
    FromWorkspace(Sidecar),
}

impl ResolvedSidecar {
    pub fn sidecar(&self) -> &Sidecar {
        match self {
            Self::FromMemory(s) | Self::FromHint(s) | Self::FromWorkspace(s) => s,
        }
    }

    pub fn trust(&self) -> TrustLevel {
        match self {
            Self::FromMemory(_) => TrustLevel::Memory,
            Self::FromHint(_) => TrustLevel::Hint,
            Self::FromWorkspace(_) => TrustLevel::Workspace,
        }
    }

    /// Whether this record may be used as the source for `.git` itself.
    pub fn may_restore_git(&self) -> bool {
        !matches!(self, Self::FromWorkspace(_))
    }

    pub fn backup_dir(&self) -> Option<&Path> {
        self.sidecar().backup_dir.as_deref()
    }
}

/// Read a file, refusing anything that is not a small regular file.
pub(crate) fn read_small_file(path: &Path) -> Option<Vec<u8>> {
    let meta = std::fs::symlink_metadata(path).ok()?;
    if !meta.is_file() || meta.len() > MAX_SIDECAR_BYTES {
        return None;
    }
    std::fs::read(path).ok()
}
