//! Log file monitor poll loop
//!
//! Drives a [`LogTailer`] at a fixed interval, evaluates triggers on every
//! complete line and hands matches to the monitor's action dispatcher. The
//! loop never waits on an action. Shutdown is only observed between polls.

use super::tail::{LogTailer, MonitorPhase, PollBatch, TailLimits};
use super::triggers::TriggerSet;
use super::MonitorRuntime;
use crate::action::ActionDispatcher;
use crate::config::{EngineSettings, StartPosition};
use crate::error::{EngineError, Result};
use crate::health::monitor_component;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Timing policy of a log file monitor
#[derive(Debug, Clone)]
pub struct LogMonitorSettings {
    pub poll_interval: Duration,
    /// First delay after a failed open or read, doubled per consecutive failure
    pub retry_initial: Duration,
    pub retry_max: Duration,
    /// Consecutive failures before switching to `long_backoff`
    pub max_consecutive_errors: u32,
    pub long_backoff: Duration,
    pub limits: TailLimits,
}

impl Default for LogMonitorSettings {
    fn default() -> Self {
        Self::from_engine(&EngineSettings::default())
    }
}

impl LogMonitorSettings {
    pub fn from_engine(engine: &EngineSettings) -> Self {
        Self {
            poll_interval: engine.poll_interval(),
            retry_initial: Duration::from_millis(engine.open_retry_initial_ms),
            retry_max: Duration::from_millis(engine.open_retry_max_ms),
            max_consecutive_errors: engine.max_consecutive_errors.max(1),
            long_backoff: Duration::from_secs(engine.long_backoff_secs),
            limits: TailLimits {
                max_read_bytes: engine.max_read_bytes.max(1),
                max_line_bytes: engine.max_line_bytes.max(1),
            },
        }
    }

    /// Delay before the next attempt after `consecutive` failures
    pub fn error_delay(&self, consecutive: u32) -> Duration {
        if consecutive >= self.max_consecutive_errors {
            return self.long_backoff;
        }
        let factor = 1u32 << consecutive.saturating_sub(1).min(16);
        self.retry_initial.saturating_mul(factor).min(self.retry_max)
    }
}

/// Tails one file and dispatches trigger matches
pub struct LogFileMonitor {
    name: String,
    tailer: LogTailer,
    triggers: TriggerSet,
    dispatcher: ActionDispatcher,
    settings: LogMonitorSettings,
    runtime: MonitorRuntime,
}

impl LogFileMonitor {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        start_at: StartPosition,
        triggers: TriggerSet,
        dispatcher: ActionDispatcher,
        settings: LogMonitorSettings,
        runtime: MonitorRuntime,
    ) -> Self {
        let tailer = LogTailer::new(path, start_at, settings.limits);
        Self {
            name: name.into(),
            tailer,
            triggers,
            dispatcher,
            settings,
            runtime,
        }
    }

    pub fn phase(&self) -> MonitorPhase {
        self.tailer.state().phase()
    }

    /// Poll until a shutdown signal arrives
    ///
    /// Returns an error only when the action queue has lost its consumer,
    /// which the supervisor treats as a monitor failure.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let component = monitor_component(&self.name);
        self.runtime.health.register(&component).await;

        info!(
            monitor = %self.name,
            path = %self.tailer.path().display(),
            triggers = self.triggers.len(),
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "Starting log file monitor"
        );

        loop {
            let delay = match self.tailer.poll().await {
                Ok(batch) => {
                    self.on_batch(batch, &component).await?;
                    self.settings.poll_interval
                }
                Err(e) => self.on_error(e, &component).await,
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => {
                    self.tailer.state_mut().phase = MonitorPhase::Stopped;
                    info!(monitor = %self.name, "Stopping log file monitor");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn on_batch(&mut self, batch: PollBatch, component: &str) -> Result<()> {
        let recovered = self.tailer.state().consecutive_errors() > 0;
        let path = self.tailer.path().display().to_string();

        if let Some(previous_offset) = batch.rotated_from {
            self.tailer.state_mut().phase = MonitorPhase::Rotated;
            self.runtime.metrics.inc_rotations(&self.name);
            self.runtime
                .logger
                .log_rotation(&self.name, &path, previous_offset);
        }

        {
            let state = self.tailer.state_mut();
            state.consecutive_errors = 0;
            state.phase = MonitorPhase::Tailing;
        }
        if recovered {
            info!(monitor = %self.name, "Monitor recovered");
            self.runtime.health.set_healthy(component).await;
        }

        if batch.lines.is_empty() {
            return Ok(());
        }

        self.runtime
            .metrics
            .inc_lines_read(&self.name, batch.lines.len() as u64);

        for line in &batch.lines {
            let Some(event) = self.triggers.evaluate(&self.name, line) else {
                continue;
            };
            debug!(
                monitor = %self.name,
                trigger = %event.event,
                action = %event.action,
                "Trigger matched"
            );
            self.runtime
                .metrics
                .inc_events_matched(&self.name, &event.event);
            self.dispatcher.dispatch(event)?;
        }

        Ok(())
    }

    async fn on_error(&mut self, error: EngineError, component: &str) -> Duration {
        let consecutive = {
            let state = self.tailer.state_mut();
            state.consecutive_errors = state.consecutive_errors.saturating_add(1);
            state.phase = if state.phase == MonitorPhase::Initializing {
                MonitorPhase::Initializing
            } else {
                MonitorPhase::BackoffError
            };
            state.consecutive_errors
        };
        let delay = self.settings.error_delay(consecutive);

        self.runtime.metrics.inc_monitor_errors(&self.name);
        self.runtime.logger.log_monitor_error(
            &self.name,
            &self.tailer.path().display().to_string(),
            consecutive,
            &error.to_string(),
        );

        if consecutive == 1 || consecutive == self.settings.max_consecutive_errors {
            let message = if consecutive >= self.settings.max_consecutive_errors {
                format!("{error}; long backoff {}s", delay.as_secs())
            } else {
                error.to_string()
            };
            self.runtime.health.set_degraded(component, message).await;
        }

        delay
    }
}
