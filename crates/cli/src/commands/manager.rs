//! Commands that talk to the manager API

use super::{client_for, load_config, pairs, KeyValue, CLI_EVENT, CLI_MONITOR};
use crate::output::{color_status, print_success, print_table, print_warning, OutputFormat};
use agent_lib::api::{fields_to_context, KeyStatus, ManagerApi};
use agent_lib::models::EventContext;
use agent_lib::template;
use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use std::path::Path;
use tabled::Tabled;
use tracing::debug;

#[derive(Tabled, Serialize)]
pub struct FieldRow {
    #[tabled(rename = "Field")]
    pub field: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

/// Run the startup API key probe and print its classification
pub async fn probe(config_path: &Path, format: OutputFormat) -> Result<()> {
    let config = load_config(config_path)?;
    let client = client_for(&config)?;
    let status = client.test_api_key().await;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        OutputFormat::Table => {
            println!("{}", "API Key Probe".bold());
            println!("{}", "=".repeat(50));
            println!("Manager:      {}", client.base_url().cyan());
            match &status {
                KeyStatus::Valid { http_status } => {
                    println!("HTTP Status:  {}", http_status);
                    print_success("API key accepted");
                }
                KeyStatus::InvalidOrServerIssue { http_status } => {
                    println!("HTTP Status:  {}", http_status);
                    print_warning("API key rejected or manager error");
                }
                KeyStatus::Unreachable { error } => {
                    println!("Error:        {}", error);
                    print_warning(&format!("Manager {}", color_status("unreachable")));
                }
            }
        }
    }

    Ok(())
}

/// Expand `endpoint` against the VM identity plus `--set` values and fetch it
pub async fn get_endpoint(
    config_path: &Path,
    endpoint: &str,
    set: Vec<KeyValue>,
    format: OutputFormat,
) -> Result<()> {
    let config = load_config(config_path)?;
    let client = client_for(&config)?;

    let ctx = EventContext::builder()
        .identity(&config.identity(), CLI_MONITOR, CLI_EVENT)
        .layer(pairs(set))
        .build();
    let path = template::expand_endpoint(endpoint, &ctx)?;
    debug!(path = %path, "Fetching manager endpoint");
    let fields = client
        .fetch(&path)
        .await
        .with_context(|| format!("request to {path} failed"))?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&fields)?);
        }
        OutputFormat::Table => {
            let rows: Vec<FieldRow> = fields_to_context(&fields)
                .into_iter()
                .map(|(field, value)| FieldRow { field, value })
                .collect();
            println!("{} {}", "GET".bold(), path.cyan());
            print_table(&rows, format);
        }
    }

    Ok(())
}
