//! RunEngine configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. A TOML file (missing files are skipped)
//! 3. Environment variables prefixed with `PLANS_`
//!
//! Nested keys use a double underscore in environment variables:
//!
//! ```text
//! PLANS_AUTO_RAISE=false
//! PLANS_CALL_RETURNS_RESULT=true
//! PLANS_RUN_TAGS__OPEN=begin_run
//! ```
//!
//! # Example
//!
//! ```no_run
//! use rust_daq_plans::config::EngineConfig;
//!
//! let config = EngineConfig::load().expect("valid configuration");
//! println!("auto_raise: {}", config.auto_raise);
//! ```

use crate::experiment::preprocessors::RunTags;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/plans.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A provider failed or a value had the wrong type
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Loaded values that cannot be used
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Settings for the `RunEngine`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Return plan failures to the caller instead of folding them into the
    /// run result
    pub auto_raise: bool,
    /// Return a `RunResult` carrying the plan's return value instead of the
    /// list of run uids
    pub call_returns_result: bool,
    /// Capacity of the document broadcast channel
    pub document_capacity: usize,
    /// Logging level used when `RUST_LOG` is not set
    pub log_level: String,
    /// Command tags of the run bracket
    pub run_tags: RunTags,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auto_raise: true,
            call_returns_result: false,
            document_capacity: 256,
            log_level: "info".to_string(),
            run_tags: RunTags::default(),
        }
    }
}

impl EngineConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` (skipped if missing) and the environment, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PLANS_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Check values that deserialize fine but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.document_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "document_capacity must be > 0".to_string(),
            ));
        }

        if self.run_tags.open.is_empty() || self.run_tags.close.is_empty() {
            return Err(ConfigError::ValidationError(
                "run_tags cannot be empty".to_string(),
            ));
        }

        if self.run_tags.open == self.run_tags.close {
            return Err(ConfigError::ValidationError(format!(
                "run_tags.open and run_tags.close must differ (both '{}')",
                self.run_tags.open
            )));
        }

        Ok(())
    }
}
