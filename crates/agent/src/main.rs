//! VM Agent - log event monitoring and action dispatch
//!
//! Runs as a service on each managed VM, tailing local log files, enriching
//! matched events from the manager API and running local scripts.

use agent_lib::{
    action::{ActionExecutor, ActionPool, PoolConfig},
    api::{ManagerClient, ManagerClientConfig},
    config::AgentConfig,
    health::{components, HealthRegistry},
    monitor::{MonitorRuntime, Supervisor},
    observability::{AgentMetrics, StructuredLogger},
    script::{ScriptRunner, ScriptRunnerConfig},
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vm_agent::api;
use vm_agent::settings::{AgentSettings, LogFormat};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let settings = AgentSettings::load()?;
    init_tracing(settings.log_format);

    info!(config_path = %settings.config_path.display(), "Starting vm-agent");

    let config = AgentConfig::load(&settings.config_path).with_context(|| {
        format!(
            "failed to load agent configuration from {}",
            settings.config_path.display()
        )
    })?;
    info!(
        vm_id = %config.vm_id,
        monitors = config.monitors.len(),
        actions = config.actions.len(),
        "Agent configured"
    );

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::SUPERVISOR).await;
    health_registry.register(components::ACTION_POOL).await;
    health_registry.register(components::MANAGER_API).await;

    let metrics = AgentMetrics::new();
    let logger = StructuredLogger::new(&config.vm_id);
    logger.log_startup(AGENT_VERSION, config.monitors.len(), config.actions.len());

    // Manager client and startup key probe
    let client = ManagerClient::new(ManagerClientConfig::from_settings(
        &config.manager_url,
        &config.api_key,
        &config.engine.api,
    ))
    .context("invalid manager URL")?;

    let key_status = client.test_api_key().await;
    logger.log_api_key_probe(&key_status);
    if !key_status.is_valid() {
        // Keep running; actions without an endpoint still work
        health_registry
            .set_degraded(components::MANAGER_API, format!("{key_status:?}"))
            .await;
    }

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
    let pool = ActionPool::new(
        Arc::new(executor),
        PoolConfig {
            max_concurrent: config.engine.max_concurrent_actions,
            queue_capacity: config.engine.action_queue_capacity,
        },
    );

    let mut supervisor = Supervisor::new(
        config.monitors.clone(),
        config.engine.clone(),
        pool.clone(),
        MonitorRuntime::new(health_registry.clone(), logger.clone()),
    );
    supervisor.start().await.context("failed to start monitors")?;

    let app_state = Arc::new(
        api::AppState::new(health_registry.clone(), metrics.clone()).with_pool(pool),
    );
    let (api_shutdown_tx, api_shutdown_rx) = broadcast::channel(1);
    let api_handle = tokio::spawn(api::serve(settings.api_port, app_state, api_shutdown_rx));

    // Mark agent as ready after initialization
    health_registry.set_ready(true).await;

    let reason = shutdown_signal().await;
    logger.log_shutdown(reason);
    health_registry.set_ready(false).await;

    let outcome = supervisor.shutdown().await;
    let _ = api_shutdown_tx.send(());
    match api_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "API server exited with error"),
        Err(e) => warn!(error = %e, "API server task failed"),
    }

    info!(outcome = ?outcome, "Shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
    }
}

/// Wait for Ctrl-C, or SIGTERM on Unix
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT received",
                    _ = term.recv() => "SIGTERM received",
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM, waiting for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT received"
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "Ctrl-C received"
    }
}
