//! Broker configuration.
//!
//! Loaded once at startup from a YAML file:
//!
//! ```yaml
//! plugins:
//!   vm:
//!     path: /usr/local/lib/vend/vm-plugin
//!     envs: [CLOUD_REGION=eu-1]
//! pools:
//!   staging:
//!     plugin: vm
//!     params:
//!       max_idle: 3
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use vend_core::Meta;
use vend_plugin::CmdParam;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The pool id is not configured.
    #[error("pool {0:?} not found in config")]
    PoolNotFound(String),

    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// One plugin binary and its extra environment.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    pub path: String,
    #[serde(default)]
    pub envs: Vec<String>,
}

/// One pool: which plugin governs it and with which parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub plugin: String,
    #[serde(default)]
    pub params: Meta,
}

/// The broker's static configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub plugins: HashMap<String, PluginConfig>,
    pub pools: HashMap<String, PoolConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The configuration of one pool.
    pub fn pool(&self, pool_id: &str) -> Result<&PoolConfig, ConfigError> {
        self.pools
            .get(pool_id)
            .ok_or_else(|| ConfigError::PoolNotFound(pool_id.to_string()))
    }

    /// The launch parameters for every configured plugin, keyed by name.
    pub fn plugin_cmds(&self) -> HashMap<String, CmdParam> {
        self.plugins
            .iter()
            .map(|(name, plugin)| {
                (
                    name.clone(),
                    CmdParam {
                        name: name.clone(),
                        path: plugin.path.clone(),
                        envs: plugin.envs.clone(),
                    },
                )
            })
            .collect()
    }
}
