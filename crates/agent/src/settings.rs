//! Process-level settings for the agent binary

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Settings read from `AGENT_`-prefixed environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    /// Engine configuration file (monitors, actions, manager)
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    /// Port for the health and metrics endpoints
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// "json" for log shipping, "pretty" for interactive runs
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

fn default_config_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\ProgramData\VmAgent\agent.yaml")
    } else {
        PathBuf::from("/etc/vm-agent/agent.yaml")
    }
}

fn default_api_port() -> u16 {
    8080
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            config_path: default_config_path(),
            api_port: default_api_port(),
            log_format: default_log_format(),
        }
    }
}

impl AgentSettings {
    /// Load settings from the environment
    pub fn load() -> Result<Self> {
        Self::from_source(config::Environment::with_prefix("AGENT"))
    }

    fn from_source<S>(source: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        config::Config::builder()
            .add_source(source)
            .build()
            .and_then(|c| c.try_deserialize())
            .context("invalid AGENT_* environment settings")
    }
}
