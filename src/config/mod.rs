//! Application configuration.
//!
//! Aggregates the listener settings and the list of publish/subscribe
//! rules into a single Config struct that can be loaded from YAML files or
//! environment variables.

mod rule;
mod server;

pub use rule::RuleConfig;
pub use server::ServerConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "PUBSUB_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PUBSUB";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "PUBSUB_LOG";

use std::collections::HashSet;

use serde::Deserialize;

/// Errors detected while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("no pubsub rules configured")]
    NoRules,

    #[error("rule {index}: {field} must be a non-empty path starting with '/', got {value:?}")]
    InvalidPath {
        index: usize,
        field: &'static str,
        value: String,
    },

    #[error("rule {index}: publish path and subscribe path must be different ({path})")]
    SamePaths { index: usize, path: String },

    #[error("rule {index}: path {path} is already used by another rule")]
    DuplicatePath { index: usize, path: String },
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener configuration.
    pub server: ServerConfig,
    /// Publish/subscribe rules, matched in order.
    pub rules: Vec<RuleConfig>,
}

impl Config {
    /// Load configuration from file and environment, then validate it.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check rule invariants. Any failure is fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rules.is_empty() {
            return Err(ConfigError::NoRules);
        }

        let mut seen = HashSet::new();
        for (index, rule) in self.rules.iter().enumerate() {
            rule.validate(index)?;
            for path in [&rule.publish_path, &rule.subscribe_path] {
                if !seen.insert(path.as_str()) {
                    return Err(ConfigError::DuplicatePath {
                        index,
                        path: path.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
