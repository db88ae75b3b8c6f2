//! Compiled trigger patterns

use crate::config::TriggerDefinition;
use crate::error::{EngineError, Result};
use crate::models::TriggeredEvent;
use regex::Regex;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct CompiledTrigger {
    event: String,
    action: String,
    regex: Regex,
}

/// Ordered trigger list for one monitor
#[derive(Debug, Clone, Default)]
pub struct TriggerSet {
    triggers: Vec<CompiledTrigger>,
}

impl TriggerSet {
    pub fn compile(definitions: &[TriggerDefinition]) -> Result<Self> {
        let triggers = definitions
            .iter()
            .map(|def| {
                let regex = Regex::new(&def.pattern).map_err(|e| {
                    EngineError::Config(format!(
                        "trigger '{}' has an invalid pattern: {e}",
                        def.event
                    ))
                })?;
                Ok(CompiledTrigger {
                    event: def.event.clone(),
                    action: def.action.clone(),
                    regex,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { triggers })
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Test `line` against each trigger in declaration order
    ///
    /// Only the first matching trigger produces an event. Named groups that
    /// took part in the match become captures; groups that did not are left
    /// out so they cannot shadow context keys with empty strings.
    pub fn evaluate(&self, monitor: &str, line: &str) -> Option<TriggeredEvent> {
        self.triggers.iter().find_map(|trigger| {
            let caps = trigger.regex.captures(line)?;
            let captures: BTreeMap<String, String> = trigger
                .regex
                .capture_names()
                .flatten()
                .filter_map(|name| {
                    caps.name(name)
                        .map(|m| (name.to_string(), m.as_str().to_string()))
                })
                .collect();

            Some(TriggeredEvent {
                monitor: monitor.to_string(),
                event: trigger.event.clone(),
                action: trigger.action.clone(),
                captures,
                line: line.to_string(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(event: &str, pattern: &str) -> TriggerDefinition {
        TriggerDefinition {
            event: event.to_string(),
            pattern: pattern.to_string(),
            action: format!("{event}_action"),
        }
    }

    #[test]
    fn test_first_match_wins() {
        let set = TriggerSet::compile(&[
            def("failed_login", r"Failed password for (?P<user>\w+)"),
            def("any_failure", r"Failed"),
        ])
        .unwrap();

        let event = set
            .evaluate("auth", "Failed password for bob from 10.0.0.1")
            .unwrap();
        assert_eq!(event.event, "failed_login");
        assert_eq!(event.action, "failed_login_action");
        assert_eq!(event.captures.get("user").map(String::as_str), Some("bob"));

        let event = set.evaluate("auth", "Failed to start unit").unwrap();
        assert_eq!(event.event, "any_failure");
        assert!(event.captures.is_empty());
    }

    #[test]
    fn test_non_matching_line_is_discarded() {
        let set = TriggerSet::compile(&[def("error", "ERROR")]).unwrap();
        assert!(set.evaluate("app", "INFO all good").is_none());
    }

    #[test]
    fn test_unparticipating_group_is_omitted() {
        let set = TriggerSet::compile(&[def(
            "login",
            r"login (?P<user>\w+)(?: from (?P<ip>[\d.]+))?",
        )])
        .unwrap();

        let event = set.evaluate("auth", "login alice").unwrap();
        assert_eq!(event.captures.len(), 1);
        assert!(!event.captures.contains_key("ip"));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = TriggerSet::compile(&[def("bad", "(unclosed")]).unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }
}
