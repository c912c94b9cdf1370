//! Configuration for the CLI.
//!
//! Handles:
//! - Where the deployment model lives
//! - Where the state store lives
//! - How nodes are reached over SSH
//!
//! Flags and environment variables take precedence over the config file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use volsnap_engine::SshConfig;

/// Configuration file name.
const CONFIG_FILE: &str = "config.toml";

/// State store file name inside the state directory.
pub const STATE_DB_FILE: &str = "volsnap.db";

/// Model path used when neither flag nor config names one.
const DEFAULT_MODEL_PATH: &str = "/etc/volsnap/model.toml";

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "volsnap", "snapctl")
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))
}

/// CLI configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Deployment model file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<PathBuf>,

    /// Directory holding the state store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    #[serde(default)]
    pub ssh: SshConfig,
}

impl Config {
    /// Load config from disk, or return default.
    pub fn load() -> Result<Self> {
        let path = project_dirs()?.config_dir().join(CONFIG_FILE);
        Self::load_from(&path)
    }

    fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;

        toml::from_str(&contents).with_context(|| format!("Failed to parse config from {:?}", path))
    }

    /// Model path, preferring the flag over the config file.
    pub fn model_path(&self, flag: Option<PathBuf>) -> PathBuf {
        flag.or_else(|| self.model.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH))
    }

    /// State directory, preferring the flag over the config file.
    pub fn state_dir(&self, flag: Option<PathBuf>) -> Result<PathBuf> {
        if let Some(dir) = flag.or_else(|| self.state_dir.clone()) {
            return Ok(dir);
        }
        Ok(project_dirs()?.data_dir().to_path_buf())
    }
}
