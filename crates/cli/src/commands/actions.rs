//! Trigger dry-runs and hand-run actions

use super::{client_for, load_config, pairs, KeyValue, CLI_EVENT, CLI_MONITOR};
use crate::output::{color_status, print_info, print_table, print_warning, OutputFormat};
use agent_lib::action::{resolve_parameters, ActionExecutor};
use agent_lib::models::{EventContext, TriggeredEvent};
use agent_lib::monitor::TriggerSet;
use agent_lib::script::{ScriptRunner, ScriptRunnerConfig};
use agent_lib::template;
use anyhow::{anyhow, bail, Result};
use colored::Colorize;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tabled::Tabled;
use tokio_util::sync::CancellationToken;

#[derive(Tabled, Serialize)]
pub struct ParameterRow {
    #[tabled(rename = "Parameter")]
    pub name: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

/// Dry-run result of `match`
#[derive(Serialize)]
pub struct MatchReport {
    pub event: TriggeredEvent,
    /// Endpoint after expansion, or the raw template when a key is missing
    pub api_endpoint: Option<String>,
    pub script: Option<String>,
    pub parameters: Vec<ParameterRow>,
    pub missing_parameters: Vec<String>,
}

/// Evaluate `line` against a monitor's triggers without calling the API or a script
pub fn match_line(config_path: &Path, monitor: &str, line: &str, format: OutputFormat) -> Result<()> {
    let config = load_config(config_path)?;
    let definition = config
        .monitor(monitor)
        .ok_or_else(|| anyhow!("no monitor named '{monitor}' in configuration"))?;
    let triggers = TriggerSet::compile(&definition.triggers)?;

    let Some(event) = triggers.evaluate(monitor, line) else {
        match format {
            OutputFormat::Json => println!("null"),
            OutputFormat::Table => print_info(&format!(
                "No trigger of monitor '{}' matches the line",
                monitor
            )),
        }
        return Ok(());
    };

    let action = config
        .action(&event.action)
        .ok_or_else(|| anyhow!("trigger references unknown action '{}'", event.action))?;
    let ctx = EventContext::builder()
        .identity(&config.identity(), &event.monitor, &event.event)
        .layer(event.captures.iter().map(|(k, v)| (k.clone(), v.clone())))
        .build();
    let resolved = resolve_parameters(action, &ctx);

    let report = MatchReport {
        api_endpoint: action
            .api_endpoint
            .as_ref()
            .map(|endpoint| template::expand_endpoint(endpoint, &ctx).unwrap_or_else(|_| endpoint.clone())),
        script: action.script.clone(),
        parameters: resolved
            .params
            .into_iter()
            .map(|(name, value)| ParameterRow { name, value })
            .collect(),
        missing_parameters: resolved.missing,
        event,
    };

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Table => print_match_report(&report, format),
    }

    Ok(())
}

fn print_match_report(report: &MatchReport, format: OutputFormat) {
    println!("{}", "Trigger Match".bold());
    println!("{}", "=".repeat(50));
    println!("Monitor:      {}", report.event.monitor.cyan());
    println!("Event:        {}", report.event.event.cyan());
    println!("Action:       {}", report.event.action.cyan());
    if let Some(endpoint) = &report.api_endpoint {
        println!("API Endpoint: {}", endpoint);
    }
    println!(
        "Script:       {}",
        report.script.as_deref().unwrap_or("(none)")
    );

    println!();
    println!("{}", "Captures".bold());
    println!("{}", "-".repeat(50));
    let captures: Vec<ParameterRow> = report
        .event
        .captures
        .iter()
        .map(|(name, value)| ParameterRow {
            name: name.clone(),
            value: value.clone(),
        })
        .collect();
    print_table(&captures, format);

    println!();
    println!("{}", "Parameters".bold());
    println!("{}", "-".repeat(50));
    print_table(&report.parameters, format);

    if !report.missing_parameters.is_empty() {
        println!();
        print_warning(&format!(
            "Missing from context: {}",
            report.missing_parameters.join(", ")
        ));
        if report.api_endpoint.is_some() {
            print_info("These may be filled from the API response at run time");
        }
    }
}

/// Execute one action with `--set` values as captures
///
/// Ctrl-C cancels the running script. Fails when the outcome is not success.
pub async fn run_action(
    config_path: &Path,
    action: &str,
    set: Vec<KeyValue>,
    format: OutputFormat,
) -> Result<()> {
    let config = load_config(config_path)?;
    if config.action(action).is_none() {
        bail!("no action named '{action}' in configuration");
    }

    let client = client_for(&config)?;
    let runner = ScriptRunner::new(ScriptRunnerConfig::from_settings(
        &config.scripts_dir,
        &config.engine.script,
    ));
    let executor = ActionExecutor::new(
        config.actions.clone(),
        config.identity(),
        Arc::new(client),
        Arc::new(runner),
    );

    let event = TriggeredEvent {
        monitor: CLI_MONITOR.to_string(),
        event: CLI_EVENT.to_string(),
        action: action.to_string(),
        captures: pairs(set).collect(),
        line: String::new(),
    };

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };
    let result = executor.execute(&event, cancel).await;
    interrupt.abort();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        OutputFormat::Table => {
            println!("{}", "Action Result".bold());
            println!("{}", "=".repeat(50));
            println!("Action:       {}", result.action.cyan());
            println!("Outcome:      {}", color_status(result.outcome.as_str()));
            println!("Exit Code:    {}", result.exit_code);
            println!("Duration:     {}ms", result.duration.as_millis());
            if let Some(error) = &result.error {
                println!(
                    "Error:        {} ({})",
                    error,
                    result.error_kind.as_deref().unwrap_or("unknown")
                );
            }
            if !result.stdout.is_empty() {
                println!();
                println!("{}", "stdout".bold());
                println!("{}", "-".repeat(50));
                println!("{}", result.stdout.trim_end());
            }
            if !result.stderr.is_empty() {
                println!();
                println!("{}", "stderr".bold());
                println!("{}", "-".repeat(50));
                println!("{}", result.stderr.trim_end());
            }
            if result.output_truncated {
                print_warning("Output was truncated");
            }
        }
    }

    if !result.succeeded() {
        bail!(
            "action '{}' finished with outcome {}",
            result.action,
            result.outcome.as_str()
        );
    }
    Ok(())
}
