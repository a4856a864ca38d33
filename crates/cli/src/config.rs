use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use orchestrator::{InterpreterConfig, RetryPolicy};
use serde::{Deserialize, Serialize};

pub const AUTOPILOT_DIR: &str = ".autopilot";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutopilotConfig {
    pub project: ProjectConfig,
    pub runtime: RuntimeConfig,
    pub retry: RetryPolicy,
    pub workers: WorkersConfig,
    pub vcs: VcsConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "my-project".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub state_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub templates_dir: PathBuf,
    /// Markdown guidance consulted before any decision worker.
    pub guidance: PathBuf,
    pub unattended: bool,
    pub confidence_threshold: f64,
    pub max_steps: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let interpreter = InterpreterConfig::default();
        Self {
            state_dir: Path::new(AUTOPILOT_DIR).join("state"),
            artifacts_dir: interpreter.artifacts_dir,
            templates_dir: PathBuf::from("templates"),
            guidance: Path::new(AUTOPILOT_DIR).join("guidance.md"),
            unattended: interpreter.unattended,
            confidence_threshold: interpreter.confidence_threshold,
            max_steps: interpreter.max_steps,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub timeout_secs: u64,
    /// Role to argv. The request arrives on stdin as JSON.
    pub commands: BTreeMap<String, Vec<String>>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 1800,
            commands: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VcsConfig {
    pub enabled: bool,
    /// Commit state files after every save.
    pub checkpoint: bool,
    pub workspaces_dir: PathBuf,
    pub main_branch: String,
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            checkpoint: false,
            workspaces_dir: Path::new(AUTOPILOT_DIR).join("workspaces"),
            main_branch: "main".to_string(),
        }
    }
}

impl AutopilotConfig {
    pub fn path(root: &Path) -> PathBuf {
        root.join(AUTOPILOT_DIR).join(CONFIG_FILE)
    }

    /// Read `.autopilot/config.toml`, falling back to defaults when it is absent.
    pub async fn load(root: &Path) -> Result<Self> {
        let path = Self::path(root);
        let config = match tokio::fs::read_to_string(&path).await {
            Ok(content) => Self::parse(&content)
                .with_context(|| format!("Invalid configuration in {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.retry.validate()?;
        if !(0.0..=1.0).contains(&config.runtime.confidence_threshold) {
            bail!(
                "runtime.confidence_threshold is {}, expected a value between 0 and 1",
                config.runtime.confidence_threshold
            );
        }
        Ok(config)
    }

    pub fn interpreter_config(&self, root: &Path, unattended: bool) -> InterpreterConfig {
        InterpreterConfig::default()
            .with_unattended(unattended || self.runtime.unattended)
            .with_confidence_threshold(self.runtime.confidence_threshold)
            .with_max_steps(self.runtime.max_steps)
            .with_retry_policy(self.retry.clone())
            .with_artifacts_dir(root.join(&self.runtime.artifacts_dir))
    }
}
