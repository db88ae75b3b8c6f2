//! Agent configuration
//!
//! The configuration file lists the monitors, their triggers and the actions
//! they dispatch to. Engine tunables all carry defaults so a minimal file only
//! names the VM, the manager and the scripts directory.

use crate::error::{EngineError, Result};
use crate::models::VmIdentity;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Identifier of this VM in the manager
    pub vm_id: String,

    /// Human readable VM name, exposed to actions as `vm_name`
    #[serde(default)]
    pub vm_name: Option<String>,

    /// Key used to authenticate against the manager API
    pub api_key: String,

    /// Manager base URL (e.g. "https://manager.example.com")
    pub manager_url: String,

    /// Directory every script must live in
    pub scripts_dir: PathBuf,

    #[serde(default)]
    pub monitors: Vec<MonitorDefinition>,

    #[serde(default)]
    pub actions: Vec<ActionDefinition>,

    #[serde(default)]
    pub engine: EngineSettings,
}

/// One watched source and the triggers evaluated against it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorDefinition {
    pub name: String,

    #[serde(flatten)]
    pub kind: MonitorKind,

    /// Evaluated in declaration order; first match wins
    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,
}

/// Closed set of monitor kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorKind {
    /// Tail a log file, surviving rotation and truncation
    LogFileTail {
        path: PathBuf,
        #[serde(default)]
        start_at: StartPosition,
    },
}

/// Where a log tail begins when the file already exists at startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    #[default]
    End,
    Beginning,
}

/// Pattern bound to an event name and an action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub event: String,
    /// Regular expression; named groups become context keys
    pub pattern: String,
    pub action: String,
}

/// Optional remote fetch followed by an optional local script
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub name: String,

    /// Endpoint path template with `{placeholder}` tokens
    #[serde(default)]
    pub api_endpoint: Option<String>,

    /// Script file name relative to the scripts directory
    #[serde(default)]
    pub script: Option<String>,

    /// Script parameter name -> context key, or a `{template}` over the context
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    /// Overrides the runner's default timeout for this action
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Runtime tunables for the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub poll_interval_ms: u64,
    pub open_retry_initial_ms: u64,
    pub open_retry_max_ms: u64,
    pub max_consecutive_errors: u32,
    pub long_backoff_secs: u64,
    pub max_read_bytes: usize,
    pub max_line_bytes: usize,
    pub max_concurrent_actions: usize,
    pub action_queue_capacity: usize,
    pub shutdown_grace_secs: u64,
    pub restart_backoff_initial_ms: u64,
    pub restart_backoff_max_ms: u64,
    pub script: ScriptSettings,
    pub api: ApiSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            open_retry_initial_ms: 1000,
            open_retry_max_ms: 30_000,
            max_consecutive_errors: 5,
            long_backoff_secs: 60,
            max_read_bytes: 4 * 1024 * 1024,
            max_line_bytes: 64 * 1024,
            max_concurrent_actions: 4,
            action_queue_capacity: 256,
            shutdown_grace_secs: 30,
            restart_backoff_initial_ms: 1000,
            restart_backoff_max_ms: 60_000,
            script: ScriptSettings::default(),
            api: ApiSettings::default(),
        }
    }
}

impl EngineSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Script interpreter and resource bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptSettings {
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    pub param_prefix: String,
    pub timeout_secs: u64,
    pub max_output_bytes: usize,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        let (interpreter, interpreter_args) = if cfg!(windows) {
            (
                "powershell.exe".to_string(),
                ["-NoProfile", "-NonInteractive", "-ExecutionPolicy", "Bypass", "-File"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            )
        } else {
            ("sh".to_string(), Vec::new())
        };

        Self {
            interpreter,
            interpreter_args,
            param_prefix: "--".to_string(),
            timeout_secs: 300,
            max_output_bytes: 64 * 1024,
        }
    }
}

/// Manager API client policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub probe_path: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 5,
            max_retries: 3,
            initial_backoff_ms: 500,
            probe_path: "/api/agent/ping".to_string(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a file, overlaid with `VMAGENT_` environment variables
    ///
    /// Nested keys use a double underscore: `VMAGENT_ENGINE__POLL_INTERVAL_MS`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("VMAGENT")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;

        let config: AgentConfig = settings
            .try_deserialize()
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;

        config.check()?;
        Ok(config)
    }

    /// Structural checks the engine relies on
    pub fn check(&self) -> Result<()> {
        let actions: HashSet<&str> = self.actions.iter().map(|a| a.name.as_str()).collect();
        let mut monitor_names = HashSet::new();

        for monitor in &self.monitors {
            if !monitor_names.insert(monitor.name.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate monitor name '{}'",
                    monitor.name
                )));
            }

            for trigger in &monitor.triggers {
                if !actions.contains(trigger.action.as_str()) {
                    return Err(EngineError::Config(format!(
                        "trigger '{}' of monitor '{}' references unknown action '{}'",
                        trigger.event, monitor.name, trigger.action
                    )));
                }
                Regex::new(&trigger.pattern).map_err(|e| {
                    EngineError::Config(format!(
                        "trigger '{}' of monitor '{}' has an invalid pattern: {}",
                        trigger.event, monitor.name, e
                    ))
                })?;
            }
        }

        Ok(())
    }

    pub fn identity(&self) -> VmIdentity {
        VmIdentity::new(self.vm_id.clone(), self.vm_name.clone())
    }

    pub fn action(&self, name: &str) -> Option<&ActionDefinition> {
        self.actions.iter().find(|a| a.name == name)
    }

    pub fn monitor(&self, name: &str) -> Option<&MonitorDefinition> {
        self.monitors.iter().find(|m| m.name == name)
    }
}
