//! TOML configuration file.
//!
//! ```toml
//! [server]
//! base_url = "http://127.0.0.1:4096"
//! username = "opencode"
//! model = "anthropic/claude-sonnet"
//! agent = "build"
//!
//! [harness]
//! max_attempts = 3
//! git_timeout_secs = 60
//! output_dir = "./generated_patches"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::errors::ValidationError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub server: ServerSection,
    pub harness: HarnessSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub model: Option<String>,
    pub config_path: Option<PathBuf>,
    pub agent: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessSection {
    pub max_attempts: Option<u32>,
    pub git_timeout_secs: Option<u64>,
    pub task_timeout_secs: Option<u64>,
    pub poll_timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub output_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl FileConfig {
    pub fn parse(text: &str, path: &Path) -> Result<Self, ValidationError> {
        toml::from_str(text)
            .map_err(|e| ValidationError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load a config file. A missing file is an error only when `required`.
    pub fn load(path: &Path, required: bool) -> Result<Option<Self>, ValidationError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text, path).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => Ok(None),
            Err(e) => Err(ValidationError::Config(format!(
                "cannot read {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// `$XDG_CONFIG_HOME/agent-eval/config.toml` (or the platform equivalent).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("agent-eval").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sections() {
        let cfg = FileConfig::parse(
            "[server]\nbase_url = \"http://h:1\"\n[harness]\nmax_attempts = 2\n",
            Path::new("c.toml"),
        )
        .unwrap();
        assert_eq!(cfg.server.base_url.as_deref(), Some("http://h:1"));
        assert_eq!(cfg.harness.max_attempts, Some(2));
        assert!(cfg.harness.output_dir.is_none());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = FileConfig::parse("[server]\nbase_uri = \"x\"\n", Path::new("c.toml"));
        assert!(err.is_err());
    }

    #[test]
    fn test_missing_optional_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(FileConfig::load(&missing, false).unwrap().is_none());
        assert!(FileConfig::load(&missing, true).is_err());
    }
}
