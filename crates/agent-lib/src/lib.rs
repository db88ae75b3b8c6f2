//! Agent library for VM event monitoring and action dispatch
//!
//! This crate provides the core functionality for:
//! - Tailing log files across rotation and truncation
//! - Matching lines against declarative triggers
//! - Enriching events from the manager API
//! - Running local scripts with mapped parameters, bounded in time and output
//! - Supervising monitors, health checks and observability

pub mod action;
pub mod api;
pub mod config;
pub mod error;
pub mod health;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod script;
pub mod template;

#[cfg(test)]
mod testing;

pub use action::{ActionDispatcher, ActionExecutor, ActionPool, PoolConfig, ShutdownOutcome};
pub use api::{KeyStatus, ManagerApi, ManagerClient, ManagerClientConfig};
pub use config::AgentConfig;
pub use error::{ApiError, EngineError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use monitor::{MonitorRuntime, Supervisor};
pub use observability::{AgentMetrics, StructuredLogger};
pub use script::{ScriptLauncher, ScriptRunner, ScriptRunnerConfig};
