/*
[INPUT]:  YAML configuration file
[OUTPUT]: Parsed tracker configuration
[POS]:    Configuration layer - endpoint and storage setup
[UPDATE]: When adding new configuration options
*/

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the task tracker
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackerConfig {
    /// Push channel endpoint delivering task notifications
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Override for the durable handle store location; defaults to the
    /// platform data directory
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            store_path: None,
        }
    }
}

fn default_ws_url() -> String {
    "wss://api.docuflow.io/ws/tasks".to_string()
}

impl TrackerConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}
