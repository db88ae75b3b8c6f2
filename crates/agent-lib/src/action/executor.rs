//! Action execution
//!
//! Turns one triggered event into at most one script invocation:
//! identity + captures → optional API fetch → parameter mapping → script.

use crate::api::{fields_to_context, ManagerApi};
use crate::config::ActionDefinition;
use crate::error::{EngineError, Result};
use crate::models::{
    ActionExecutionResult, ActionOutcome, EventContext, TriggeredEvent, VmIdentity,
    SYNTHETIC_EXIT_CODE,
};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::script::{ScriptLauncher, ScriptOutput, ScriptRequest};
use crate::template;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Parameters resolved from a context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedParameters {
    pub params: Vec<(String, String)>,
    /// Parameter names omitted because their source was missing
    pub missing: Vec<String>,
}

/// Executes configured actions for triggered events
pub struct ActionExecutor {
    actions: HashMap<String, ActionDefinition>,
    identity: VmIdentity,
    api: Arc<dyn ManagerApi>,
    scripts: Arc<dyn ScriptLauncher>,
    logger: StructuredLogger,
    metrics: AgentMetrics,
}

impl ActionExecutor {
    pub fn new(
        actions: impl IntoIterator<Item = ActionDefinition>,
        identity: VmIdentity,
        api: Arc<dyn ManagerApi>,
        scripts: Arc<dyn ScriptLauncher>,
    ) -> Self {
        let logger = StructuredLogger::new(identity.vm_id.clone());
        Self {
            actions: actions.into_iter().map(|a| (a.name.clone(), a)).collect(),
            identity,
            api,
            scripts,
            logger,
            metrics: AgentMetrics::new(),
        }
    }

    pub fn action(&self, name: &str) -> Option<&ActionDefinition> {
        self.actions.get(name)
    }

    /// Identity fields layered with the event's capture groups
    pub fn initial_context(&self, event: &TriggeredEvent) -> EventContext {
        EventContext::builder()
            .identity(&self.identity, &event.monitor, &event.event)
            .layer(event.captures.iter().map(|(k, v)| (k.clone(), v.clone())))
            .build()
    }

    /// Execute the action bound to `event`, always producing one result
    pub async fn execute(
        &self,
        event: &TriggeredEvent,
        cancel: CancellationToken,
    ) -> ActionExecutionResult {
        let start = Instant::now();
        let mut missing = Vec::new();

        let outcome = match self.actions.get(&event.action) {
            Some(action) => {
                let ctx = self.initial_context(event);
                self.invoke(action, ctx, cancel, &mut missing).await
            }
            None => Err(EngineError::Config(format!(
                "unknown action '{}'",
                event.action
            ))),
        };

        let result = build_result(event, outcome, missing, start.elapsed());
        self.metrics
            .observe_action(result.outcome.as_str(), result.duration.as_secs_f64());
        self.logger.log_action_result(&result);
        result
    }

    /// Fetch, map and run for one action with an already-built context
    async fn invoke(
        &self,
        action: &ActionDefinition,
        ctx: EventContext,
        cancel: CancellationToken,
        missing: &mut Vec<String>,
    ) -> Result<Option<ScriptOutput>> {
        let ctx = self.enrich(action, ctx, &cancel).await?;

        let Some(script) = &action.script else {
            debug!(action = %action.name, "Action has no script, nothing to run");
            return Ok(None);
        };

        let resolved = resolve_parameters(action, &ctx);
        for name in &resolved.missing {
            warn!(
                action = %action.name,
                parameter = %name,
                "Context has no value for mapped parameter, omitting it"
            );
        }
        missing.extend(resolved.missing);

        let mut request = ScriptRequest::new(script.clone());
        request.params = resolved.params;
        request.timeout = action.timeout_secs.map(Duration::from_secs);

        self.scripts.run(request, cancel).await.map(Some)
    }

    /// Merge API response fields into the context when the action has an endpoint
    ///
    /// Cancelling `cancel` abandons an in-flight request, retries included.
    pub async fn enrich(
        &self,
        action: &ActionDefinition,
        ctx: EventContext,
        cancel: &CancellationToken,
    ) -> Result<EventContext> {
        let Some(endpoint) = &action.api_endpoint else {
            return Ok(ctx);
        };

        let path = template::expand_endpoint(endpoint, &ctx)?;
        let fields = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(EngineError::FetchCancelled {
                    action: action.name.clone(),
                });
            }
            fetched = self.api.fetch(&path) => fetched?,
        };
        debug!(
            action = %action.name,
            path = %path,
            fields = fields.len(),
            "Merged API response into context"
        );

        Ok(ctx.extend().layer(fields_to_context(&fields)).build())
    }
}

/// Resolve every parameter mapping of `action` against `ctx`
///
/// A mapping value containing `{placeholder}` tokens is expanded as a
/// template; anything else names a context key.
pub fn resolve_parameters(action: &ActionDefinition, ctx: &EventContext) -> ResolvedParameters {
    let mut resolved = ResolvedParameters::default();

    for (param, source) in &action.parameters {
        let value = if template::is_template(source) {
            template::expand(source, ctx).ok()
        } else {
            ctx.get(source).map(str::to_string)
        };

        match value {
            Some(v) => resolved.params.push((param.clone(), v)),
            None => resolved.missing.push(param.clone()),
        }
    }

    resolved
}

fn build_result(
    event: &TriggeredEvent,
    outcome: Result<Option<ScriptOutput>>,
    missing_parameters: Vec<String>,
    duration: Duration,
) -> ActionExecutionResult {
    let mut result = ActionExecutionResult {
        action: event.action.clone(),
        event: event.event.clone(),
        monitor: event.monitor.clone(),
        outcome: ActionOutcome::Succeeded,
        exit_code: 0,
        stdout: String::new(),
        stderr: String::new(),
        output_truncated: false,
        duration,
        missing_parameters,
        error_kind: None,
        error: None,
    };

    let fill_output = |result: &mut ActionExecutionResult, output: &ScriptOutput| {
        result.stdout = output.stdout.clone();
        result.stderr = output.stderr.clone();
        result.output_truncated = output.truncated();
    };

    match outcome {
        Ok(Some(output)) => {
            result.exit_code = output.exit_code.unwrap_or(0);
            fill_output(&mut result, &output);
        }
        Ok(None) => {}
        Err(e) => {
            if let Some(output) = e.script_output() {
                fill_output(&mut result, output);
            }
            result.outcome = match &e {
                EngineError::ScriptExecution { .. } => ActionOutcome::Failed,
                EngineError::ScriptTimeout { .. } => ActionOutcome::TimedOut,
                _ => ActionOutcome::Aborted,
            };
            result.exit_code = match &e {
                EngineError::ScriptExecution { exit_code, .. } => *exit_code,
                _ => SYNTHETIC_EXIT_CODE,
            };
            result.error_kind = Some(e.kind().to_string());
            result.error = Some(e.to_string());
        }
    }

    result
}
