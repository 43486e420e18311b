//! Configuration management for the coordinator
//!
//! The coordinator reads a single TOML file describing where to listen,
//! where durable state lives, the beat interval, and the set of task types
//! it controls. Values are validated after parsing so a bad file fails at
//! startup with a readable error instead of much later.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use crate::store::StoreBackend;

fn default_listen_address() -> String {
    "127.0.0.1:8700".to_string()
}

fn default_state_dir() -> String {
    "./db".to_string()
}

fn default_interval() -> u64 {
    60
}

fn default_storage() -> StoreBackend {
    StoreBackend::Dir
}

fn default_max_body_mb() -> usize {
    10
}

fn default_artifact_suffix() -> String {
    ".xml.gz".to_string()
}

/// One task type the coordinator controls.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskEntry {
    /// The uppercase action token, e.g. `ARTICLE`.
    pub action: String,
    /// The URL path segment workers upload results to, e.g. `article`.
    pub path: String,
    /// Directory name under the state dir for this task's queues.
    pub prefix: String,
    /// Where uploaded result payloads are written.
    pub artifact_dir: String,
    /// Filename suffix for stored artifacts.
    #[serde(default = "default_artifact_suffix")]
    pub artifact_suffix: String,
    /// Action of the task seeded from this task's results. An ISSUE result
    /// lists the article ids found on a day-index page; those become jobs of
    /// the fan-out task.
    #[serde(default)]
    pub fan_out: Option<String>,
}

/// A job registered at startup so a fresh deployment has an initial
/// frontier. Registration is idempotent.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedEntry {
    pub action: String,
    pub params: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// Seconds between scheduler beats.
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_storage")]
    pub storage: StoreBackend,
    /// Upload body size cap in megabytes.
    #[serde(default = "default_max_body_mb")]
    pub max_body_mb: usize,
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskEntry>,
    #[serde(default, rename = "seed")]
    pub seeds: Vec<SeedEntry>,
}

impl CoordinatorConfig {
    /// Read, parse, and validate the configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: CoordinatorConfig = toml::from_str(&content).with_context(|| {
            format!(
                "Failed to parse {} - TOML syntax error in coordinator configuration",
                path.display()
            )
        })?;
        config
            .validate()
            .with_context(|| format!("Validation failed for {}", path.display()))?;
        info!(
            listen_address = %config.listen_address,
            state_dir = %config.state_dir,
            interval = config.interval_seconds,
            task_count = config.tasks.len(),
            "Coordinator configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_seconds == 0 {
            return Err(anyhow::anyhow!("interval_seconds must be positive"));
        }
        if self.tasks.is_empty() {
            return Err(anyhow::anyhow!("at least one [[task]] must be configured"));
        }

        let mut actions = HashSet::new();
        let mut paths = HashSet::new();
        for task in &self.tasks {
            if task.action.is_empty() || task.action.contains(char::is_whitespace) {
                return Err(anyhow::anyhow!(
                    "task action {:?} must be non-empty and contain no whitespace",
                    task.action
                ));
            }
            if task.path.is_empty() || task.path.contains('/') {
                return Err(anyhow::anyhow!(
                    "task path {:?} must be a single non-empty path segment",
                    task.path
                ));
            }
            if !actions.insert(task.action.as_str()) {
                return Err(anyhow::anyhow!("duplicate task action {:?}", task.action));
            }
            if !paths.insert(task.path.as_str()) {
                return Err(anyhow::anyhow!("duplicate task path {:?}", task.path));
            }
        }

        for task in &self.tasks {
            if let Some(fan_out) = &task.fan_out {
                if !actions.contains(fan_out.as_str()) {
                    return Err(anyhow::anyhow!(
                        "task {:?} fans out to unknown action {:?}",
                        task.action,
                        fan_out
                    ));
                }
            }
        }

        for seed in &self.seeds {
            if !actions.contains(seed.action.as_str()) {
                return Err(anyhow::anyhow!(
                    "seed references unknown action {:?}",
                    seed.action
                ));
            }
            if seed.params.is_empty() || seed.params.contains(char::is_whitespace) {
                return Err(anyhow::anyhow!(
                    "seed params {:?} must be non-empty and contain no whitespace",
                    seed.params
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<CoordinatorConfig> {
        let config: CoordinatorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config() {
        let config = parse(
            r#"
[[task]]
action = "ARTICLE"
path = "article"
prefix = "articles"
artifact_dir = "/tmp/articles"
"#,
        )
        .unwrap();
        assert_eq!(config.listen_address, "127.0.0.1:8700");
        assert_eq!(config.interval_seconds, 60);
        assert_eq!(config.storage, StoreBackend::Dir);
        assert_eq!(config.tasks[0].artifact_suffix, ".xml.gz");
    }

    #[test]
    fn test_fan_out_must_reference_known_action() {
        let result = parse(
            r#"
[[task]]
action = "ISSUE"
path = "issue"
prefix = "issues"
artifact_dir = "/tmp/issues"
fan_out = "ARTICLE"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_full_crawl_config() {
        let config = parse(
            r#"
listen_address = "0.0.0.0:8700"
state_dir = "./db"
interval_seconds = 120
storage = "sqlite"

[[task]]
action = "ISSUE"
path = "issue"
prefix = "issues"
artifact_dir = "/srv/crawl/issues"
fan_out = "ARTICLE"

[[task]]
action = "ARTICLE"
path = "article"
prefix = "articles"
artifact_dir = "/srv/crawl/articles"

[[seed]]
action = "ISSUE"
params = "20081211"
"#,
        )
        .unwrap();
        assert_eq!(config.storage, StoreBackend::Sqlite);
        assert_eq!(config.tasks.len(), 2);
        assert_eq!(config.tasks[0].fan_out.as_deref(), Some("ARTICLE"));
        assert_eq!(config.seeds[0].params, "20081211");
    }

    #[test]
    fn test_rejects_empty_tasks_and_bad_tokens() {
        assert!(parse("").is_err());
        assert!(parse(
            r#"
[[task]]
action = "BAD ACTION"
path = "bad"
prefix = "bad"
artifact_dir = "/tmp/bad"
"#,
        )
        .is_err());
        assert!(parse(
            r#"
[[task]]
action = "A"
path = "x"
prefix = "a"
artifact_dir = "/tmp/a"

[[task]]
action = "B"
path = "x"
prefix = "b"
artifact_dir = "/tmp/b"
"#,
        )
        .is_err());
    }
}
