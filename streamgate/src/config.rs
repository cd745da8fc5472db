//! Pipeline configuration.
//!
//! Built explicitly and handed to the controller; nothing is read from the
//! environment.

use crate::{drm::GateConfig, queue::DEFAULT_QUEUE_CAPACITY};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, str::FromStr};
use streamgate_cenc::ProtectionSystem;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Items each stream queue holds before producers block.
    pub queue_capacity: usize,
    pub decrypt_failure_threshold: u32,
    pub output_protection_threshold: u32,
    /// Clear the fatal report latch after a successful decrypt.
    pub rearm_error_report_on_success: bool,
    /// Protection system the decryption stages bind to.
    pub protection_system: Option<ProtectionSystem>,
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let gate = GateConfig::default();

        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            decrypt_failure_threshold: gate.decrypt_failure_threshold,
            output_protection_threshold: gate.output_protection_threshold,
            rearm_error_report_on_success: gate.rearm_error_report_on_success,
            protection_system: None,
            log_level: None,
        }
    }
}

impl Config {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config = serde_json::from_str::<Self>(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be at least 1".to_owned(),
            ));
        }

        if self.decrypt_failure_threshold == 0 || self.output_protection_threshold == 0 {
            return Err(ConfigError::Invalid(
                "failure thresholds must be at least 1".to_owned(),
            ));
        }

        self.log_level_filter()?;
        Ok(())
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            decrypt_failure_threshold: self.decrypt_failure_threshold,
            output_protection_threshold: self.output_protection_threshold,
            rearm_error_report_on_success: self.rearm_error_report_on_success,
        }
    }

    pub fn log_level_filter(&self) -> Result<Option<LevelFilter>, ConfigError> {
        self.log_level
            .as_deref()
            .map(|level| {
                LevelFilter::from_str(level)
                    .map_err(|_| ConfigError::Invalid(format!("unknown log level {:?}", level)))
            })
            .transpose()
    }
}
