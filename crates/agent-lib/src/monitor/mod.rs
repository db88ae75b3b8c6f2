//! Monitors and their supervision
//!
//! A monitor watches one source and turns new input into triggered events.
//! The set of monitor kinds is closed: [`run_monitor`] is the single place a
//! new [`MonitorKind`] variant gets wired in.

mod log_file;
mod supervisor;
mod tail;
mod triggers;


pub use log_file::{LogFileMonitor, LogMonitorSettings};
pub use supervisor::{RestartPolicy, Supervisor};
pub use tail::{FileIdentity, LogTailer, MonitorPhase, MonitorState, PollBatch, TailLimits};
pub use triggers::TriggerSet;

use crate::action::ActionDispatcher;
use crate::config::{EngineSettings, MonitorDefinition, MonitorKind, StartPosition};
use crate::error::Result;
use crate::health::HealthRegistry;
use crate::observability::{AgentMetrics, StructuredLogger};
use tokio::sync::broadcast;

/// Shared services every monitor reports to
#[derive(Clone)]
pub struct MonitorRuntime {
    pub health: HealthRegistry,
    pub logger: StructuredLogger,
    pub metrics: AgentMetrics,
}

impl MonitorRuntime {
    pub fn new(health: HealthRegistry, logger: StructuredLogger) -> Self {
        Self {
            health,
            logger,
            metrics: AgentMetrics::new(),
        }
    }
}

/// Run one monitor until shutdown
///
/// `restarted` marks a run started by the supervisor after a failure; such a
/// run resumes at the end of the file so lines already seen by the failed run
/// are not dispatched twice.
pub async fn run_monitor(
    definition: &MonitorDefinition,
    triggers: TriggerSet,
    dispatcher: ActionDispatcher,
    engine: &EngineSettings,
    runtime: MonitorRuntime,
    restarted: bool,
    shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    match &definition.kind {
        MonitorKind::LogFileTail { path, start_at } => {
            let start_at = if restarted {
                StartPosition::End
            } else {
                *start_at
            };
            LogFileMonitor::new(
                definition.name.clone(),
                path.clone(),
                start_at,
                triggers,
                dispatcher,
                LogMonitorSettings::from_engine(engine),
                runtime,
            )
            .run(shutdown)
            .await
        }
    }
}
