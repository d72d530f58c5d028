//! Configuration system for Agent Eval.
//!
//! Values are layered, each later layer overriding the earlier one:
//! - built-in defaults
//! - TOML config file
//! - environment variables (`OPENCODE_*` for the agent server, `AE_*` for the harness)
//! - command-line flags
//!
//! Every value keeps track of where it came from.

pub mod env;
pub mod file;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use file::FileConfig;
pub use source::{ConfigSource, Sourced};

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ValidationError;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:4096";
pub const DEFAULT_USERNAME: &str = "opencode";
pub const DEFAULT_AGENT: &str = "build";
pub const DEFAULT_OPENCODE_CONFIG: &str = "~/.config/opencode/config.json";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

/// A credential that never shows up in logs or debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Connection settings for the external agent server.
#[derive(Debug, Clone)]
pub struct AgentServerConfig {
    pub base_url: Sourced<String>,
    pub username: Sourced<String>,
    pub password: Sourced<Option<Secret>>,
    /// Explicit model override (`provider/model`).
    pub model: Sourced<Option<String>>,
    /// The agent server's own JSON config, consulted for a default model.
    pub config_path: Sourced<PathBuf>,
    pub agent: Sourced<String>,
}

/// Knobs of the harness itself.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub max_attempts: Sourced<u32>,
    pub git_timeout_secs: Sourced<u64>,
    pub task_timeout_secs: Sourced<u64>,
    pub poll_timeout_secs: Sourced<u64>,
    pub poll_interval_ms: Sourced<u64>,
    pub output_dir: Sourced<PathBuf>,
    pub state_dir: Sourced<PathBuf>,
    pub log_level: Sourced<String>,
}

impl HarnessConfig {
    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs.value)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs.value)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs.value)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.value)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: AgentServerConfig,
    pub harness: HarnessConfig,
}

/// Values supplied on the command line; `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub max_attempts: Option<u32>,
    pub output_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub model: Option<String>,
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("agent-eval").join("state"))
        .unwrap_or_else(|| PathBuf::from(".agent-eval/state"))
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: AgentServerConfig {
                base_url: Sourced::default_value(DEFAULT_BASE_URL.to_string()),
                username: Sourced::default_value(DEFAULT_USERNAME.to_string()),
                password: Sourced::default_value(None),
                model: Sourced::default_value(None),
                config_path: Sourced::default_value(env::expand_tilde(DEFAULT_OPENCODE_CONFIG)),
                agent: Sourced::default_value(DEFAULT_AGENT.to_string()),
            },
            harness: HarnessConfig {
                max_attempts: Sourced::default_value(DEFAULT_MAX_ATTEMPTS),
                git_timeout_secs: Sourced::default_value(60),
                task_timeout_secs: Sourced::default_value(600),
                poll_timeout_secs: Sourced::default_value(120),
                poll_interval_ms: Sourced::default_value(1500),
                output_dir: Sourced::default_value(PathBuf::from("./generated_patches")),
                state_dir: Sourced::default_value(default_state_dir()),
                log_level: Sourced::default_value("info".to_string()),
            },
        }
    }
}

impl AppConfig {
    /// Defaults, then the config file, then the environment.
    ///
    /// An explicit `config_path` must exist; the default location is optional.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ValidationError> {
        let mut config = Self::default();

        let (path, required) = match config_path {
            Some(p) => (Some(p.to_path_buf()), true),
            None => (file::default_config_path(), false),
        };
        if let Some(path) = path
            && let Some(file) = FileConfig::load(&path, required)?
        {
            config.apply_file(&file, &path);
        }

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_file(&mut self, file: &FileConfig, path: &Path) {
        let s = &mut self.server;
        if let Some(v) = &file.server.base_url {
            s.base_url = Sourced::from_file(v.clone(), path);
        }
        if let Some(v) = &file.server.username {
            s.username = Sourced::from_file(v.clone(), path);
        }
        if let Some(v) = &file.server.password {
            s.password = Sourced::from_file(Some(Secret::new(v.clone())), path);
        }
        if let Some(v) = &file.server.model {
            s.model = Sourced::from_file(Some(v.clone()), path);
        }
        if let Some(v) = &file.server.config_path {
            s.config_path = Sourced::from_file(v.clone(), path);
        }
        if let Some(v) = &file.server.agent {
            s.agent = Sourced::from_file(v.clone(), path);
        }

        let h = &mut self.harness;
        if let Some(v) = file.harness.max_attempts {
            h.max_attempts = Sourced::from_file(v, path);
        }
        if let Some(v) = file.harness.git_timeout_secs {
            h.git_timeout_secs = Sourced::from_file(v, path);
        }
        if let Some(v) = file.harness.task_timeout_secs {
            h.task_timeout_secs = Sourced::from_file(v, path);
        }
        if let Some(v) = file.harness.poll_timeout_secs {
            h.poll_timeout_secs = Sourced::from_file(v, path);
        }
        if let Some(v) = file.harness.poll_interval_ms {
            h.poll_interval_ms = Sourced::from_file(v, path);
        }
        if let Some(v) = &file.harness.output_dir {
            h.output_dir = Sourced::from_file(v.clone(), path);
        }
        if let Some(v) = &file.harness.state_dir {
            h.state_dir = Sourced::from_file(v.clone(), path);
        }
        if let Some(v) = &file.harness.log_level {
            h.log_level = Sourced::from_file(v.to_lowercase(), path);
        }
    }

    /// Overlay environment variables, reporting every bad value at once.
    pub fn apply_env(&mut self) -> Result<(), ValidationError> {
        let mut oc = EnvParser::with_prefix("OPENCODE_");
        let s = &mut self.server;
        s.base_url = s
            .base_url
            .clone()
            .overlay(oc.get_string("BASE_URL", &s.base_url.value));
        s.username = s
            .username
            .clone()
            .overlay(oc.get_string("SERVER_USERNAME", &s.username.value));
        let password = oc.get_optional_string("SERVER_PASSWORD");
        if password.value.is_some() {
            s.password = Sourced {
                value: password.value.map(Secret::new),
                source: password.source,
                origin: password.origin,
            };
        }
        s.model = s.model.clone().overlay(oc.get_optional_string("MODEL"));
        s.config_path = s
            .config_path
            .clone()
            .overlay(oc.get_path("CONFIG_PATH", s.config_path.value.clone()));

        let mut ae = EnvParser::new();
        s.agent = s.agent.clone().overlay(ae.get_string("AGENT", &s.agent.value));
        let h = &mut self.harness;
        h.max_attempts = h.max_attempts.clone().overlay(ae.get_u32_range(
            "MAX_ATTEMPTS",
            h.max_attempts.value,
            1,
            MAX_ATTEMPTS_LIMIT,
        ));
        h.git_timeout_secs = h.git_timeout_secs.clone().overlay(ae.get_u64_range(
            "GIT_TIMEOUT_SECS",
            h.git_timeout_secs.value,
            1,
            86_400,
        ));
        h.task_timeout_secs = h.task_timeout_secs.clone().overlay(ae.get_u64_range(
            "TASK_TIMEOUT_SECS",
            h.task_timeout_secs.value,
            1,
            86_400,
        ));
        h.poll_timeout_secs = h.poll_timeout_secs.clone().overlay(ae.get_u64_range(
            "POLL_TIMEOUT_SECS",
            h.poll_timeout_secs.value,
            1,
            86_400,
        ));
        h.poll_interval_ms = h.poll_interval_ms.clone().overlay(ae.get_u64_range(
            "POLL_INTERVAL_MS",
            h.poll_interval_ms.value,
            10,
            60_000,
        ));
        h.output_dir = h
            .output_dir
            .clone()
            .overlay(ae.get_path("OUTPUT_DIR", h.output_dir.value.clone()));
        h.state_dir = h
            .state_dir
            .clone()
            .overlay(ae.get_path("STATE_DIR", h.state_dir.value.clone()));
        h.log_level = h
            .log_level
            .clone()
            .overlay(ae.get_log_level("LOG_LEVEL", &h.log_level.value));

        let errors: Vec<String> = oc
            .take_errors()
            .into_iter()
            .chain(ae.take_errors())
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::Config(errors.join("; ")))
        }
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(n) = cli.max_attempts {
            self.harness.max_attempts = Sourced::from_cli(n, "--max-attempts");
        }
        if let Some(dir) = &cli.output_dir {
            self.harness.output_dir = Sourced::from_cli(dir.clone(), "--output-dir");
        }
        if let Some(level) = &cli.log_level {
            self.harness.log_level = Sourced::from_cli(level.clone(), "--verbose");
        }
        if let Some(model) = &cli.model {
            self.server.model = Sourced::from_cli(Some(model.clone()), "--model");
        }
    }

    /// Cross-field checks that apply whatever layer a value came from.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut problems = Vec::new();
        let attempts = &self.harness.max_attempts;
        if attempts.value == 0 || attempts.value > MAX_ATTEMPTS_LIMIT {
            problems.push(format!(
                "max_attempts must be in 1..={} (got {} from {})",
                MAX_ATTEMPTS_LIMIT,
                attempts.value,
                attempts.describe()
            ));
        }
        let url = &self.server.base_url;
        if !(url.value.starts_with("http://") || url.value.starts_with("https://")) {
            problems.push(format!(
                "base_url must start with http:// or https:// (got '{}' from {})",
                url.value,
                url.describe()
            ));
        }
        if self.harness.poll_interval_ms.value == 0 {
            problems.push("poll_interval_ms must be positive".to_string());
        }
        for (name, v) in [
            ("git_timeout_secs", &self.harness.git_timeout_secs),
            ("task_timeout_secs", &self.harness.task_timeout_secs),
            ("poll_timeout_secs", &self.harness.poll_timeout_secs),
        ] {
            if v.value == 0 {
                problems.push(format!("{} must be positive", name));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::Config(problems.join("; ")))
        }
    }
}
