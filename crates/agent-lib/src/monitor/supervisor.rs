//! Monitor supervisor
//!
//! Runs one supervised task per monitor definition. A monitor that returns an
//! error or panics is restarted on its own after an exponential backoff; the
//! other monitors keep running. Shutdown stops every monitor cooperatively and
//! then drains the action pool.

use super::{run_monitor, MonitorRuntime, TriggerSet};
use crate::action::{ActionDispatcher, ActionPool, ShutdownOutcome};
use crate::config::{EngineSettings, MonitorDefinition};
use crate::error::Result;
use crate::health::{components, monitor_component};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Upper bound on waiting for monitors to notice the stop signal
const MONITOR_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff between restarts of a failed monitor
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// A run lasting at least this long resets the backoff to `initial`
    pub stable_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from_engine(&EngineSettings::default())
    }
}

impl RestartPolicy {
    pub fn from_engine(engine: &EngineSettings) -> Self {
        Self {
            initial: Duration::from_millis(engine.restart_backoff_initial_ms),
            max: Duration::from_millis(engine.restart_backoff_max_ms),
            stable_after: Duration::from_millis(engine.restart_backoff_max_ms),
        }
    }

    pub fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }

    /// Backoff to wait after a run that lasted `ran_for`
    pub fn after_run(&self, current: Duration, ran_for: Duration) -> Duration {
        if ran_for >= self.stable_after {
            self.initial
        } else {
            current
        }
    }
}

/// Owns the configured monitors and coordinates their shutdown
pub struct Supervisor {
    monitors: Vec<MonitorDefinition>,
    engine: Arc<EngineSettings>,
    pool: ActionPool,
    runtime: MonitorRuntime,
    policy: RestartPolicy,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(
        monitors: Vec<MonitorDefinition>,
        engine: EngineSettings,
        pool: ActionPool,
        runtime: MonitorRuntime,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        let policy = RestartPolicy::from_engine(&engine);
        Self {
            monitors,
            engine: Arc::new(engine),
            pool,
            runtime,
            policy,
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    pub fn pool(&self) -> &ActionPool {
        &self.pool
    }

    /// Compile every trigger set, then start one supervised task per monitor
    ///
    /// Nothing is started when any pattern fails to compile.
    pub async fn start(&mut self) -> Result<()> {
        let compiled = self
            .monitors
            .iter()
            .map(|def| Ok((def.clone(), TriggerSet::compile(&def.triggers)?)))
            .collect::<Result<Vec<_>>>()?;

        for (definition, triggers) in compiled {
            let name = definition.name.clone();
            let definition = Arc::new(definition);
            let engine = self.engine.clone();
            let runtime = self.runtime.clone();
            let run = move |dispatcher: ActionDispatcher,
                            restarted: bool,
                            shutdown: broadcast::Receiver<()>| {
                let definition = definition.clone();
                let triggers = triggers.clone();
                let engine = engine.clone();
                let runtime = runtime.clone();
                async move {
                    run_monitor(
                        &definition,
                        triggers,
                        dispatcher,
                        &engine,
                        runtime,
                        restarted,
                        shutdown,
                    )
                    .await
                }
            };

            let task = tokio::spawn(supervise(
                name,
                self.pool.clone(),
                self.runtime.clone(),
                self.policy,
                self.shutdown_tx.clone(),
                self.shutdown_tx.subscribe(),
                run,
            ));
            self.tasks.push(task);
        }

        self.runtime.health.set_healthy(components::SUPERVISOR).await;
        self.runtime.health.set_healthy(components::ACTION_POOL).await;
        info!(monitors = self.tasks.len(), "Supervisor started");
        Ok(())
    }

    /// Stop all monitors, then drain the action pool within the grace period
    pub async fn shutdown(self) -> ShutdownOutcome {
        info!(monitors = self.tasks.len(), "Supervisor stopping monitors");
        // No receivers just means nothing is running
        let _ = self.shutdown_tx.send(());

        for task in self.tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(MONITOR_STOP_TIMEOUT, task).await.is_err() {
                warn!("Monitor did not stop in time, aborting it");
                abort.abort();
            }
        }

        let outcome = self.pool.shutdown(self.engine.shutdown_grace()).await;
        self.runtime
            .health
            .set_unhealthy(components::SUPERVISOR, "Stopped")
            .await;
        self.runtime
            .health
            .set_unhealthy(components::ACTION_POOL, "Shut down")
            .await;
        info!(outcome = ?outcome, "Supervisor stopped");
        outcome
    }
}

/// Run `run` until it stops cleanly, restarting it after failures
///
/// `run` receives the monitor's dispatcher, whether this is a restart, and a
/// fresh shutdown receiver.
pub(super) async fn supervise<F, Fut>(
    name: String,
    pool: ActionPool,
    runtime: MonitorRuntime,
    policy: RestartPolicy,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown: broadcast::Receiver<()>,
    run: F,
) where
    F: Fn(ActionDispatcher, bool, broadcast::Receiver<()>) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let component = monitor_component(&name);
    let (mut dispatcher, _) = pool.dispatcher(name.clone());
    let mut backoff = policy.initial;
    let mut restarted = false;

    loop {
        // Subscribe before checking so a stop sent in between is not lost
        let run_shutdown = shutdown_tx.subscribe();
        if !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
            break;
        }

        if dispatcher.is_closed() {
            warn!(monitor = %name, "Action worker gone, starting a new one");
            dispatcher = pool.dispatcher(name.clone()).0;
        }

        let started = Instant::now();
        let task = tokio::spawn(run(dispatcher.clone(), restarted, run_shutdown));

        let failure = match task.await {
            Ok(Ok(())) => break,
            Ok(Err(e)) => e.to_string(),
            Err(e) if e.is_panic() => {
                format!("monitor panicked: {}", panic_message(e.into_panic()))
            }
            Err(_) => break,
        };
        backoff = policy.after_run(backoff, started.elapsed());

        error!(
            monitor = %name,
            error = %failure,
            restart_in_ms = backoff.as_millis() as u64,
            "Monitor failed, restarting after backoff"
        );
        runtime.metrics.inc_monitor_restarts(&name);
        runtime
            .health
            .set_degraded(&component, format!("restarting: {failure}"))
            .await;

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.recv() => break,
        }
        backoff = policy.next(backoff);
        restarted = true;
    }

    debug!(monitor = %name, "Supervised monitor finished");
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_policy_doubles_to_max() {
        let policy = RestartPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(300),
            stable_after: Duration::from_secs(1),
        };
        assert_eq!(policy.next(policy.initial), Duration::from_millis(200));
        assert_eq!(policy.next(Duration::from_millis(200)), Duration::from_millis(300));
        assert_eq!(policy.next(Duration::from_millis(300)), Duration::from_millis(300));
    }

    #[test]
    fn test_long_run_resets_backoff() {
        let policy = RestartPolicy::from_engine(&EngineSettings::default());
        assert_eq!(policy.stable_after, policy.max);

        let grown = Duration::from_secs(32);
        assert_eq!(policy.after_run(grown, Duration::from_millis(500)), grown);
        assert_eq!(policy.after_run(grown, policy.max), policy.initial);
        assert_eq!(
            policy.after_run(grown, Duration::from_secs(3600)),
            policy.initial
        );
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("bang".to_string())), "bang");
        assert_eq!(panic_message(Box::new(42u8)), "unknown panic payload");
    }
}
