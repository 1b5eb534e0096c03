//! # Configuration
//!
//! Hierarchical configuration loading for driver binaries embedding the
//! scheduler:
//! - `arrayloom.toml` (base configuration)
//! - `arrayloom.local.toml` (git-ignored local overrides)
//! - Environment variables (`ARRAYLOOM_*` prefix, `__` separator)
//!
//! ## Example
//!
//! ```toml
//! # arrayloom.toml
//! [target]
//! features = "host-msan"
//!
//! [logging]
//! level = "debug"
//! ```
//!
//! ```bash
//! ARRAYLOOM_TARGET__FEATURES=host-no_asserts
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::target::Target;

/// Main configuration struct.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Compilation target configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Dash-separated target string ("host", "host-msan-no_asserts", ...).
    #[serde(default = "default_target_features")]
    pub features: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_target_features() -> String {
    "host".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig {
            features: default_target_features(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from the default locations.
    ///
    /// Merges in order:
    /// 1. `arrayloom.toml` (base configuration)
    /// 2. `arrayloom.local.toml` (local overrides, git-ignored)
    /// 3. Environment variables (`ARRAYLOOM_*` prefix)
    pub fn load() -> anyhow::Result<Self> {
        Ok(Figment::new()
            .merge(Toml::file("arrayloom.toml"))
            .merge(Toml::file("arrayloom.local.toml"))
            .merge(Env::prefixed("ARRAYLOOM_").split("__"))
            .extract()?)
    }

    /// Load configuration from a specific file path.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        Ok(Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("ARRAYLOOM_").split("__"))
            .extract()?)
    }

    /// Resolve the configured target string into a capability record.
    pub fn resolve_target(&self) -> crate::error::Result<Target> {
        self.target.features.parse()
    }
}
