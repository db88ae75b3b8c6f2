//! Core runtime models for the event engine

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Identity fields of the VM this agent runs on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmIdentity {
    pub vm_id: String,
    pub vm_name: Option<String>,
}

impl VmIdentity {
    pub fn new(vm_id: impl Into<String>, vm_name: Option<String>) -> Self {
        Self {
            vm_id: vm_id.into(),
            vm_name,
        }
    }
}

/// A trigger match produced by a monitor, ready for dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggeredEvent {
    pub monitor: String,
    pub event: String,
    pub action: String,
    pub captures: BTreeMap<String, String>,
    pub line: String,
}

/// Key/value data available while resolving one action invocation
///
/// Built once per event by layering identity fields, capture groups and API
/// response fields; later layers override earlier ones. Immutable afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventContext {
    values: BTreeMap<String, String>,
}

impl EventContext {
    pub fn builder() -> EventContextBuilder {
        EventContextBuilder::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Start a new builder seeded with this context's values
    pub fn extend(self) -> EventContextBuilder {
        EventContextBuilder {
            values: self.values,
        }
    }
}

/// Layered builder for [`EventContext`]
#[derive(Debug, Default)]
pub struct EventContextBuilder {
    values: BTreeMap<String, String>,
}

impl EventContextBuilder {
    /// Static VM identity plus the monitor and event names
    pub fn identity(mut self, identity: &VmIdentity, monitor: &str, event: &str) -> Self {
        self.values.insert("vm_id".to_string(), identity.vm_id.clone());
        if let Some(name) = &identity.vm_name {
            self.values.insert("vm_name".to_string(), name.clone());
        }
        self.values.insert("monitor".to_string(), monitor.to_string());
        self.values.insert("event".to_string(), event.to_string());
        self
    }

    /// Merge a layer; keys already present are overwritten
    pub fn layer<K, V, I>(mut self, entries: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (k, v) in entries {
            self.values.insert(k.into(), v.into());
        }
        self
    }

    pub fn build(self) -> EventContext {
        EventContext {
            values: self.values,
        }
    }
}

/// Outcome category of one action invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Succeeded,
    Failed,
    Aborted,
    TimedOut,
}

impl ActionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionOutcome::Succeeded => "succeeded",
            ActionOutcome::Failed => "failed",
            ActionOutcome::Aborted => "aborted",
            ActionOutcome::TimedOut => "timed_out",
        }
    }
}

/// Exit code reported for invocations that never produced one
pub const SYNTHETIC_EXIT_CODE: i32 = -1;

/// Record of one action invocation, handed to the structured logger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionExecutionResult {
    pub action: String,
    pub event: String,
    pub monitor: String,
    pub outcome: ActionOutcome,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub output_truncated: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// Mapped parameters whose context key was missing
    pub missing_parameters: Vec<String>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

impl ActionExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == ActionOutcome::Succeeded
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_layers_override_in_order() {
        let identity = VmIdentity::new("vm-42", Some("build-01".to_string()));
        let ctx = EventContext::builder()
            .identity(&identity, "security", "failed_login")
            .layer([("user", "alice"), ("vm_id", "spoofed")])
            .layer([("user", "Alice Smith")])
            .build();

        assert_eq!(ctx.get("vm_name"), Some("build-01"));
        assert_eq!(ctx.get("vm_id"), Some("spoofed"));
        assert_eq!(ctx.get("user"), Some("Alice Smith"));
        assert_eq!(ctx.get("event"), Some("failed_login"));
        assert!(ctx.get("missing").is_none());
    }

    #[test]
    fn test_identity_without_name() {
        let identity = VmIdentity::new("vm-1", None);
        let ctx = EventContext::builder()
            .identity(&identity, "m", "e")
            .build();
        assert!(!ctx.contains("vm_name"));
        assert_eq!(ctx.len(), 3);
    }

    #[test]
    fn test_result_serializes_duration_as_millis() {
        let result = ActionExecutionResult {
            action: "notify".to_string(),
            event: "e".to_string(),
            monitor: "m".to_string(),
            outcome: ActionOutcome::Succeeded,
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            output_truncated: false,
            duration: Duration::from_millis(1500),
            missing_parameters: vec![],
            error_kind: None,
            error: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration"], 1500);
        assert_eq!(json["outcome"], "succeeded");
    }
}
