//! Test doubles shared by unit tests across modules

use crate::api::{ApiFields, ManagerApi};
use crate::error::{ApiError, EngineError, Result};
use crate::script::{ScriptLauncher, ScriptOutput, ScriptRequest};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Manager stand-in that replays canned responses, then answers `{}`
#[derive(Default)]
pub(crate) struct FakeApi {
    pub responses: Mutex<Vec<std::result::Result<ApiFields, ApiError>>>,
    pub paths: Mutex<Vec<String>>,
    /// Simulated response latency
    pub delay: Option<Duration>,
}

#[async_trait]
impl ManagerApi for FakeApi {
    async fn fetch(&self, path: &str) -> std::result::Result<ApiFields, ApiError> {
        self.paths.lock().unwrap().push(path.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(ApiFields::new())
        } else {
            responses.remove(0)
        }
    }
}

/// Script launcher that records requests instead of spawning
#[derive(Default)]
pub(crate) struct RecordingLauncher {
    pub requests: Mutex<Vec<ScriptRequest>>,
    pub exit_code: i32,
    /// Simulated run time; cancellation ends it early
    pub delay: Option<Duration>,
}

impl RecordingLauncher {
    pub fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ScriptLauncher for RecordingLauncher {
    async fn run(&self, request: ScriptRequest, cancel: CancellationToken) -> Result<ScriptOutput> {
        let script = request.script.clone();
        self.requests.lock().unwrap().push(request);

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Err(EngineError::Cancelled {
                        script,
                        output: Box::default(),
                    });
                }
            }
        }

        let output = ScriptOutput {
            exit_code: Some(self.exit_code),
            stdout: "done".to_string(),
            ..ScriptOutput::default()
        };
        if self.exit_code == 0 {
            Ok(output)
        } else {
            Err(EngineError::ScriptExecution {
                script,
                exit_code: self.exit_code,
                output: Box::new(output),
            })
        }
    }
}
