//! Configuration management for the crawling worker
//!
//! The worker needs very little: where the coordinator lives and where to
//! keep its local state (identity file, log, cached artifacts). Both come
//! from a small TOML file with command-line overrides.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_store_dir() -> String {
    "./data".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Base URL of the coordinator. All endpoint paths hang off this.
    pub base_url: String,
    /// Directory for the identity file, the log, and cached artifacts.
    #[serde(default = "default_store_dir")]
    pub store_dir: String,
}

impl WorkerConfig {
    /// Read, parse, and validate the configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: WorkerConfig = toml::from_str(&content).with_context(|| {
            format!(
                "Failed to parse {} - TOML syntax error in worker configuration",
                path.display()
            )
        })?;
        config
            .validate()
            .with_context(|| format!("Validation failed for {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        shared::utils::validate_base_url(&self.base_url)?;
        if self.store_dir.is_empty() {
            return Err(anyhow::anyhow!("store_dir must not be empty"));
        }
        Ok(())
    }

    /// The base URL with any trailing slash removed, so endpoint paths can
    /// be appended directly.
    pub fn base_url_trimmed(&self) -> String {
        self.base_url.trim_end_matches('/').to_string()
    }

    pub fn store_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.store_dir)
    }
}
