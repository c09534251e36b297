use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::env;
use crate::matcher::MatchConfig;

pub const DEFAULT_MAX_PASSES: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid fusion config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Knobs for the pattern rewriter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Upper bound on full sweeps over the pattern list; 0 disables fusion.
    pub max_passes: usize,
    pub match_config: MatchConfig,
    /// Pattern names skipped regardless of backend.
    pub disabled_patterns: Vec<String>,
    /// Entries kept in the per-manager partition plan memo; 0 disables it.
    pub plan_cache_capacity: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            max_passes: DEFAULT_MAX_PASSES,
            match_config: MatchConfig::default(),
            disabled_patterns: Vec::new(),
            plan_cache_capacity: 0,
        }
    }
}

impl FusionConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Defaults, with fusion switched off when `FUSE_RS_DISABLE_FUSION` is set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if env::env_bool(env::DISABLE_FUSION_VAR).unwrap_or(false) {
            tracing::info!("pattern fusion disabled through {}", env::DISABLE_FUSION_VAR);
            config.max_passes = 0;
        }
        config
    }

    pub fn is_disabled(&self, pattern: &str) -> bool {
        self.disabled_patterns.iter().any(|name| name == pattern)
    }
}
