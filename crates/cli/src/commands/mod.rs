//! Subcommand implementations

pub mod actions;
pub mod manager;

use agent_lib::api::{ManagerClient, ManagerClientConfig};
use agent_lib::config::AgentConfig;
use anyhow::{bail, Context, Result};
use std::path::Path;
use std::str::FromStr;

/// Context fields for events raised by hand
pub const CLI_MONITOR: &str = "cli";
pub const CLI_EVENT: &str = "manual";

/// A `key=value` pair given with `--set`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl FromStr for KeyValue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("empty key in '{s}'"));
        }
        Ok(Self {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

pub fn pairs(set: Vec<KeyValue>) -> impl Iterator<Item = (String, String)> {
    set.into_iter().map(|kv| (kv.key, kv.value))
}

pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        bail!("configuration file {} does not exist", path.display());
    }
    AgentConfig::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

pub fn client_for(config: &AgentConfig) -> Result<ManagerClient> {
    ManagerClient::new(ManagerClientConfig::from_settings(
        &config.manager_url,
        &config.api_key,
        &config.engine.api,
    ))
    .context("invalid manager URL")
}
