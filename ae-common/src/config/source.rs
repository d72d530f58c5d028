//! Source tracking for configuration values.

use serde::Serialize;
use std::fmt;
use std::path::Path;

/// Where a configuration value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// Built-in default.
    Default,
    /// TOML configuration file.
    File,
    /// Environment variable.
    Environment,
    /// Command-line flag.
    CommandLine,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::File => write!(f, "config file"),
            Self::Environment => write!(f, "environment"),
            Self::CommandLine => write!(f, "command line"),
        }
    }
}

/// A configuration value together with its source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    /// Variable name, file path or flag the value was read from.
    pub origin: Option<String>,
}

impl<T> Sourced<T> {
    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
            origin: None,
        }
    }

    pub fn from_file(value: T, path: &Path) -> Self {
        Self {
            value,
            source: ConfigSource::File,
            origin: Some(path.display().to_string()),
        }
    }

    pub fn from_env(value: T, var: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigSource::Environment,
            origin: Some(var.into()),
        }
    }

    pub fn from_cli(value: T, flag: &str) -> Self {
        Self {
            value,
            source: ConfigSource::CommandLine,
            origin: Some(flag.to_string()),
        }
    }

    /// Keep `self` unless `other` was explicitly set by a higher layer.
    pub fn overlay(self, other: Sourced<T>) -> Self {
        if other.source == ConfigSource::Default {
            self
        } else {
            other
        }
    }

    /// Describe the source for diagnostics, e.g. `environment (AE_MAX_ATTEMPTS)`.
    pub fn describe(&self) -> String {
        match &self.origin {
            Some(origin) => format!("{} ({})", self.source, origin),
            None => self.source.to_string(),
        }
    }
}
