//! Service configuration.
//!
//! The pipeline itself (agents, policies, scheduler, alert and drift
//! settings) sits at the top level of the file. The service adds the
//! commands that implement each executor and the directory that holds the
//! run journal.

use crate::executor::CommandSpec;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use trendline_scheduler::PipelineConfig;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_VAR: &str = "TRENDLINE_CONFIG";

pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";

/// File name of the run journal inside [`AppConfig::state_dir`].
pub const JOURNAL_FILE: &str = "journal.jsonl";

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(flatten)]
    pub pipeline: PipelineConfig,

    /// Executor name to the command that implements it.
    #[serde(default)]
    pub executors: HashMap<String, CommandSpec>,

    /// Directory for durable scheduler state.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

impl AppConfig {
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.state_dir.join(JOURNAL_FILE)
    }

    /// Executor names referenced by agents but missing from `executors`.
    #[must_use]
    pub fn missing_executors(&self) -> Vec<String> {
        let mut missing: Vec<String> = self
            .pipeline
            .agents
            .iter()
            .map(|agent| agent.executor_name().to_string())
            .filter(|name| !self.executors.contains_key(name))
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }
}
