use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::batch::BatchConfig;
use crate::preprocess::{NormalizerConfig, PreprocessError};
use crate::recognizer::EngineConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Invalid(#[from] PreprocessError),
    #[error("Invalid batch config: {0}")]
    Batch(String),
}

/// Top-level settings file:
///
/// ```toml
/// [normalizer]
/// scale_factor = 1.5
///
/// [engine]
/// kind = "command"
/// program = "paddle-lines"
///
/// [batch]
/// max_concurrency = 4
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaybillConfig {
    pub normalizer: NormalizerConfig,
    pub engine: EngineConfig,
    pub batch: BatchConfig,
}

impl WaybillConfig {
    pub fn from_toml(toml_content: &str) -> Result<Self, ConfigError> {
        let config: WaybillConfig = toml::from_str(toml_content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.normalizer.validate()?;
        if self.batch.max_concurrency == 0 {
            return Err(ConfigError::Batch("max_concurrency must be positive".into()));
        }
        Ok(())
    }
}
