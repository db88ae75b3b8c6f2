//! Local script execution
//!
//! Scripts are resolved strictly inside the configured scripts directory,
//! run through the configured interpreter with `<prefix><Param> <value>`
//! arguments, and bounded in both wall-clock time and captured output.

mod path;
mod runner;

pub use path::resolve_script_path;
pub use runner::{ScriptRunner, ScriptRunnerConfig};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One script invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRequest {
    /// File name relative to the scripts directory
    pub script: String,
    /// Named parameters in argument order
    pub params: Vec<(String, String)>,
    /// Overrides the runner's default timeout
    pub timeout: Option<Duration>,
}

impl ScriptRequest {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            params: Vec::new(),
            timeout: None,
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Captured result of a finished (or killed) script process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptOutput {
    /// `None` when the process was killed
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub duration: Duration,
}

impl ScriptOutput {
    pub fn truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }
}

/// Seam between the action executor and process spawning
#[async_trait]
pub trait ScriptLauncher: Send + Sync {
    /// Run one script to completion
    ///
    /// Returns the output on exit code 0. Non-zero exits, timeouts,
    /// cancellation, spawn failures and path violations are errors.
    async fn run(&self, request: ScriptRequest, cancel: CancellationToken) -> Result<ScriptOutput>;
}
