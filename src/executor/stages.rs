//! Stage configuration and registry.
//!
//! Each stage lists the promotion steps to run, in order, as executables.
//! One TOML file per stage:
//!
//! ```toml
//! [stage]
//! name = "prod"
//!
//! [[stage.steps]]
//! name = "git-commit"
//! command = "hooks/git-commit.sh"
//! args = ["--push"]
//! timeout_secs = 300
//! ```

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct StageFile {
    stage: StageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

/// One promotion step: an executable plus arguments.
#[derive(Debug, Clone, Deserialize)]
pub struct StepConfig {
    pub name: String,
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub timeout_secs: Option<u64>,
}

impl StepConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Loaded stage configurations, indexed by stage name.
#[derive(Debug, Default)]
pub struct StageRegistry {
    stages: HashMap<String, StageConfig>,
}

impl StageRegistry {
    /// Create an empty registry with no stages.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load all `.toml` files from a directory and build the registry.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut stages = HashMap::new();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read stage dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                let file: StageFile = toml::from_str(&content).map_err(|e| {
                    Error::Config(format!("bad stage config {}: {e}", path.display()))
                })?;
                let stage = file.stage;
                if stage.steps.is_empty() {
                    return Err(Error::Config(format!(
                        "stage {} in {} has no steps",
                        stage.name,
                        path.display()
                    )));
                }
                if let Some(prev) = stages.insert(stage.name.clone(), stage) {
                    return Err(Error::Config(format!(
                        "stage {} is configured twice ({})",
                        prev.name,
                        path.display()
                    )));
                }
            }
        }

        Ok(Self { stages })
    }

    /// Register a stage directly.
    pub fn insert(&mut self, stage: StageConfig) {
        self.stages.insert(stage.name.clone(), stage);
    }

    /// Look up a stage by name.
    pub fn get(&self, name: &str) -> Option<&StageConfig> {
        self.stages.get(name)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
