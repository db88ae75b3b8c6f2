//! Error taxonomy for the event engine
//!
//! Every variant is contained at the smallest scope it can affect: one line,
//! one action invocation, or one monitor. None of them is allowed to stop the
//! agent process.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::script::ScriptOutput;

/// Errors produced by the monitor → trigger → action pipeline
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid configuration (only produced while loading, before startup)
    #[error("configuration error: {0}")]
    Config(String),

    /// Reading a monitored file failed
    #[error("I/O error on monitored file {path}: {source}")]
    MonitorIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A template referenced a key the context does not hold
    #[error("template placeholder '{{{placeholder}}}' missing from context (template: {template})")]
    Template {
        placeholder: String,
        template: String,
    },

    /// A value cannot be placed in an endpoint path safely
    #[error("value '{value}' for placeholder '{{{placeholder}}}' is not a valid path segment")]
    UnsafeTemplateValue { placeholder: String, value: String },

    /// Manager API call failed
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Script exceeded its wall-clock timeout and was killed
    #[error("script '{script}' timed out after {}s", timeout.as_secs())]
    ScriptTimeout {
        script: String,
        timeout: Duration,
        output: Box<ScriptOutput>,
    },

    /// Script exited with a non-zero code
    #[error("script '{script}' exited with code {exit_code}")]
    ScriptExecution {
        script: String,
        exit_code: i32,
        output: Box<ScriptOutput>,
    },

    /// Script could not be started
    #[error("failed to spawn script '{script}': {source}")]
    ScriptSpawn {
        script: String,
        #[source]
        source: std::io::Error,
    },

    /// Script path resolves outside the scripts directory
    #[error("script path '{script}' escapes scripts directory {}", root.display())]
    PathViolation { script: String, root: PathBuf },

    /// Script was killed because the action pool was hard-cancelled
    #[error("script '{script}' cancelled during shutdown")]
    Cancelled {
        script: String,
        output: Box<ScriptOutput>,
    },

    /// Manager API request abandoned because the action pool was hard-cancelled
    #[error("API request for action '{action}' cancelled during shutdown")]
    FetchCancelled { action: String },

    /// A monitor's action queue has no consumer left
    #[error("action queue for monitor '{monitor}' is closed")]
    DispatchClosed { monitor: String },
}

impl EngineError {
    /// Stable, machine-readable name used in structured log records
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config_error",
            EngineError::MonitorIo { .. } => "monitor_io_error",
            EngineError::Template { .. } | EngineError::UnsafeTemplateValue { .. } => {
                "template_error"
            }
            EngineError::Api(ApiError::JsonDecode(_)) => "json_decode_error",
            EngineError::Api(_) => "api_error",
            EngineError::ScriptTimeout { .. } => "script_timeout_error",
            EngineError::ScriptExecution { .. } => "script_execution_error",
            EngineError::ScriptSpawn { .. } => "script_spawn_error",
            EngineError::PathViolation { .. } => "path_violation_error",
            EngineError::Cancelled { .. } | EngineError::FetchCancelled { .. } => "cancelled",
            EngineError::DispatchClosed { .. } => "dispatch_error",
        }
    }

    /// Captured process output, when the error happened after the script ran
    pub fn script_output(&self) -> Option<&ScriptOutput> {
        match self {
            EngineError::ScriptTimeout { output, .. }
            | EngineError::ScriptExecution { output, .. }
            | EngineError::Cancelled { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Failures of a single manager API call
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// Connection, DNS or timeout failure after all retries
    #[error("network error calling manager: {0}")]
    Network(String),

    /// 5xx response after all retries
    #[error("manager returned server error {status}: {body}")]
    Server { status: u16, body: String },

    /// 4xx response (never retried)
    #[error("manager rejected request with {status}: {body}")]
    Client { status: u16, body: String },

    /// 2xx response whose body is not a JSON object
    #[error("failed to decode manager response: {0}")]
    JsonDecode(String),

    /// Base URL plus endpoint did not form a valid URL
    #[error("invalid manager URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Network(_) | ApiError::Server { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = EngineError::Template {
            placeholder: "user".to_string(),
            template: "/api/users/{user}".to_string(),
        };
        assert_eq!(err.kind(), "template_error");
        assert!(err.to_string().contains("{user}"));

        let err: EngineError = ApiError::JsonDecode("eof".to_string()).into();
        assert_eq!(err.kind(), "json_decode_error");

        let err: EngineError = ApiError::Server {
            status: 502,
            body: String::new(),
        }
        .into();
        assert_eq!(err.kind(), "api_error");
    }

    #[test]
    fn test_api_error_retryable() {
        assert!(ApiError::Network("reset".to_string()).is_retryable());
        assert!(ApiError::Server {
            status: 500,
            body: String::new()
        }
        .is_retryable());
        assert!(!ApiError::Client {
            status: 404,
            body: String::new()
        }
        .is_retryable());
        assert!(!ApiError::JsonDecode("bad".to_string()).is_retryable());
    }
}
