//! Observability infrastructure for the VM agent
//!
//! Provides:
//! - Prometheus metrics (lines read, trigger matches, action outcomes and latency)
//! - Structured JSON logging of engine events with tracing

use crate::api::KeyStatus;
use crate::models::{ActionExecutionResult, ActionOutcome};
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for action durations (in seconds)
const ACTION_DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    lines_read: IntCounterVec,
    events_matched: IntCounterVec,
    events_dropped: IntCounterVec,
    actions: IntCounterVec,
    action_duration_seconds: HistogramVec,
    actions_in_flight: IntGauge,
    monitor_errors: IntCounterVec,
    monitor_restarts: IntCounterVec,
    rotations: IntCounterVec,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            lines_read: register_int_counter_vec!(
                "vm_agent_lines_read_total",
                "Complete lines read from monitored files",
                &["monitor"]
            )
            .expect("Failed to register lines_read"),

            events_matched: register_int_counter_vec!(
                "vm_agent_events_matched_total",
                "Lines that matched a trigger",
                &["monitor", "event"]
            )
            .expect("Failed to register events_matched"),

            events_dropped: register_int_counter_vec!(
                "vm_agent_events_dropped_total",
                "Matched events dropped because the action queue was full",
                &["monitor"]
            )
            .expect("Failed to register events_dropped"),

            actions: register_int_counter_vec!(
                "vm_agent_actions_total",
                "Action executions by outcome",
                &["outcome"]
            )
            .expect("Failed to register actions"),

            action_duration_seconds: register_histogram_vec!(
                "vm_agent_action_duration_seconds",
                "Wall time of action executions including API fetch and script",
                &["outcome"],
                ACTION_DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register action_duration_seconds"),

            actions_in_flight: register_int_gauge!(
                "vm_agent_actions_in_flight",
                "Actions currently holding an executor slot"
            )
            .expect("Failed to register actions_in_flight"),

            monitor_errors: register_int_counter_vec!(
                "vm_agent_monitor_errors_total",
                "I/O errors while tailing monitored files",
                &["monitor"]
            )
            .expect("Failed to register monitor_errors"),

            monitor_restarts: register_int_counter_vec!(
                "vm_agent_monitor_restarts_total",
                "Monitor tasks restarted by the supervisor",
                &["monitor"]
            )
            .expect("Failed to register monitor_restarts"),

            rotations: register_int_counter_vec!(
                "vm_agent_rotations_total",
                "Detected log rotations or truncations",
                &["monitor"]
            )
            .expect("Failed to register rotations"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn inc_lines_read(&self, monitor: &str, lines: u64) {
        self.inner().lines_read.with_label_values(&[monitor]).inc_by(lines);
    }

    pub fn inc_events_matched(&self, monitor: &str, event: &str) {
        self.inner()
            .events_matched
            .with_label_values(&[monitor, event])
            .inc();
    }

    pub fn inc_events_dropped(&self, monitor: &str) {
        self.inner().events_dropped.with_label_values(&[monitor]).inc();
    }

    /// Record one finished action
    pub fn observe_action(&self, outcome: &str, duration_secs: f64) {
        self.inner().actions.with_label_values(&[outcome]).inc();
        self.inner()
            .action_duration_seconds
            .with_label_values(&[outcome])
            .observe(duration_secs);
    }

    pub fn set_actions_in_flight(&self, count: i64) {
        self.inner().actions_in_flight.set(count);
    }

    pub fn inc_monitor_errors(&self, monitor: &str) {
        self.inner().monitor_errors.with_label_values(&[monitor]).inc();
    }

    pub fn inc_monitor_restarts(&self, monitor: &str) {
        self.inner().monitor_restarts.with_label_values(&[monitor]).inc();
    }

    pub fn inc_rotations(&self, monitor: &str) {
        self.inner().rotations.with_label_values(&[monitor]).inc();
    }
}

/// Structured logger for agent events
///
/// Every record carries an `event` field so log pipelines can filter on it.
#[derive(Clone)]
pub struct StructuredLogger {
    vm_id: String,
}

impl StructuredLogger {
    pub fn new(vm_id: impl Into<String>) -> Self {
        Self {
            vm_id: vm_id.into(),
        }
    }

    /// Log the outcome of one action execution
    pub fn log_action_result(&self, result: &ActionExecutionResult) {
        let duration_ms = result.duration.as_millis() as u64;
        let error_kind = result.error_kind.as_deref().unwrap_or("");
        let error_msg = result.error.as_deref().unwrap_or("");

        match result.outcome {
            ActionOutcome::Succeeded => {
                info!(
                    event = "action_executed",
                    vm_id = %self.vm_id,
                    monitor = %result.monitor,
                    trigger = %result.event,
                    action = %result.action,
                    outcome = result.outcome.as_str(),
                    exit_code = result.exit_code,
                    duration_ms = duration_ms,
                    output_truncated = result.output_truncated,
                    missing_parameters = ?result.missing_parameters,
                    stdout = %result.stdout,
                    stderr = %result.stderr,
                    "Action completed"
                );
            }
            _ if error_kind == "path_violation_error" => {
                error!(
                    event = "action_executed",
                    vm_id = %self.vm_id,
                    monitor = %result.monitor,
                    trigger = %result.event,
                    action = %result.action,
                    outcome = result.outcome.as_str(),
                    exit_code = result.exit_code,
                    duration_ms = duration_ms,
                    error_kind = %error_kind,
                    error = %error_msg,
                    stdout = %result.stdout,
                    stderr = %result.stderr,
                    "Script path rejected"
                );
            }
            _ => {
                warn!(
                    event = "action_executed",
                    vm_id = %self.vm_id,
                    monitor = %result.monitor,
                    trigger = %result.event,
                    action = %result.action,
                    outcome = result.outcome.as_str(),
                    exit_code = result.exit_code,
                    duration_ms = duration_ms,
                    error_kind = %error_kind,
                    error = %error_msg,
                    output_truncated = result.output_truncated,
                    stdout = %result.stdout,
                    stderr = %result.stderr,
                    "Action did not succeed"
                );
            }
        }
    }

    /// Log an I/O failure while tailing a file
    pub fn log_monitor_error(&self, monitor: &str, path: &str, consecutive: u32, error: &str) {
        warn!(
            event = "monitor_error",
            vm_id = %self.vm_id,
            monitor = %monitor,
            path = %path,
            consecutive_errors = consecutive,
            error = %error,
            "Monitor read failed"
        );
    }

    /// Log a detected rotation or truncation
    pub fn log_rotation(&self, monitor: &str, path: &str, previous_offset: u64) {
        info!(
            event = "monitor_rotated",
            vm_id = %self.vm_id,
            monitor = %monitor,
            path = %path,
            previous_offset = previous_offset,
            "Log file rotated, reading from start"
        );
    }

    /// Log the startup API key probe result
    pub fn log_api_key_probe(&self, status: &KeyStatus) {
        match status {
            KeyStatus::Valid { http_status } => {
                info!(
                    event = "api_key_probe",
                    vm_id = %self.vm_id,
                    http_status = *http_status,
                    "API key accepted by manager"
                );
            }
            KeyStatus::InvalidOrServerIssue { http_status } => {
                warn!(
                    event = "api_key_probe",
                    vm_id = %self.vm_id,
                    http_status = *http_status,
                    "API key rejected or manager unhealthy"
                );
            }
            KeyStatus::Unreachable { error } => {
                warn!(
                    event = "api_key_probe",
                    vm_id = %self.vm_id,
                    error = %error,
                    "Manager unreachable"
                );
            }
        }
    }

    pub fn log_startup(&self, version: &str, monitors: usize, actions: usize) {
        info!(
            event = "agent_started",
            vm_id = %self.vm_id,
            agent_version = %version,
            monitors = monitors,
            actions = actions,
            "VM agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            vm_id = %self.vm_id,
            reason = %reason,
            "VM agent shutting down"
        );
    }
}
