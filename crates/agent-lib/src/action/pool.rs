//! Bounded action execution pool
//!
//! All monitors share one pool of executor slots so a global cap bounds the
//! number of concurrently running scripts. Each monitor gets its own
//! [`ActionDispatcher`] backed by a queue and a worker task that runs events
//! one at a time, which keeps events from one file in file order while the
//! monitor's poll loop never waits on a script.

use super::ActionExecutor;
use crate::error::{EngineError, Result};
use crate::models::{ActionExecutionResult, TriggeredEvent};
use crate::observability::AgentMetrics;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time allowed for killed scripts to be reaped after a hard cancel
const HARD_CANCEL_REAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the action pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum concurrently executing actions across all monitors
    pub max_concurrent: usize,
    /// Pending events per monitor before new ones are dropped
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            queue_capacity: 256,
        }
    }
}

/// How the pool came to rest on shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// All in-flight actions finished within the grace period
    Drained,
    /// Grace period expired; running scripts were killed
    HardCancelled,
}

struct PoolInner {
    executor: Arc<ActionExecutor>,
    permits: Arc<Semaphore>,
    config: PoolConfig,
    accepting: AtomicBool,
    hard_cancel: CancellationToken,
    metrics: AgentMetrics,
}

/// Shared pool of executor slots
#[derive(Clone)]
pub struct ActionPool {
    inner: Arc<PoolInner>,
}

impl ActionPool {
    pub fn new(executor: Arc<ActionExecutor>, config: PoolConfig) -> Self {
        let max = config.max_concurrent.max(1);
        Self {
            inner: Arc::new(PoolInner {
                executor,
                permits: Arc::new(Semaphore::new(max)),
                config: PoolConfig {
                    max_concurrent: max,
                    ..config
                },
                accepting: AtomicBool::new(true),
                hard_cancel: CancellationToken::new(),
                metrics: AgentMetrics::new(),
            }),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Number of actions currently holding an executor slot
    pub fn in_flight(&self) -> usize {
        self.inner.config.max_concurrent - self.inner.permits.available_permits()
    }

    /// Create the ordered dispatch queue for one monitor
    ///
    /// The worker task ends once every clone of the returned dispatcher is
    /// dropped and the queue is drained.
    pub fn dispatcher(&self, monitor: impl Into<String>) -> (ActionDispatcher, JoinHandle<()>) {
        let monitor = monitor.into();
        let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity.max(1));
        let worker = tokio::spawn(run_worker(self.clone(), monitor.clone(), rx));

        (
            ActionDispatcher {
                tx,
                monitor,
                metrics: self.inner.metrics.clone(),
            },
            worker,
        )
    }

    /// Run one event in an executor slot
    ///
    /// Returns `None` when the pool is shutting down and the event was not run.
    pub async fn execute(&self, event: TriggeredEvent) -> Option<ActionExecutionResult> {
        if !self.is_accepting() {
            return None;
        }

        let permit = tokio::select! {
            permit = self.inner.permits.clone().acquire_owned() => permit.ok()?,
            _ = self.inner.hard_cancel.cancelled() => return None,
        };

        // Shutdown may have started while waiting for the slot
        if !self.is_accepting() {
            return None;
        }

        self.inner.metrics.set_actions_in_flight(self.in_flight() as i64);
        let result = self
            .inner
            .executor
            .execute(&event, self.inner.hard_cancel.clone())
            .await;
        drop(permit);
        self.inner.metrics.set_actions_in_flight(self.in_flight() as i64);

        Some(result)
    }

    /// Stop accepting work, wait for in-flight actions, then hard-cancel
    pub async fn shutdown(&self, grace: Duration) -> ShutdownOutcome {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let total = self.inner.config.max_concurrent as u32;

        info!(
            in_flight = self.in_flight(),
            grace_secs = grace.as_secs(),
            "Action pool shutting down"
        );

        let drained = tokio::time::timeout(grace, self.inner.permits.acquire_many(total)).await;
        let outcome = match drained {
            Ok(_) => ShutdownOutcome::Drained,
            Err(_) => {
                warn!(
                    in_flight = self.in_flight(),
                    "Grace period expired, killing running scripts"
                );
                self.inner.hard_cancel.cancel();
                if tokio::time::timeout(
                    HARD_CANCEL_REAP_TIMEOUT,
                    self.inner.permits.acquire_many(total),
                )
                .await
                .is_err()
                {
                    warn!(in_flight = self.in_flight(), "Actions still running after hard cancel");
                }
                ShutdownOutcome::HardCancelled
            }
        };

        self.inner.permits.close();
        self.inner.metrics.set_actions_in_flight(0);
        outcome
    }
}

/// Per-monitor handle for queueing events in file order
#[derive(Clone)]
pub struct ActionDispatcher {
    tx: mpsc::Sender<TriggeredEvent>,
    monitor: String,
    metrics: AgentMetrics,
}

impl ActionDispatcher {
    /// Queue an event without waiting
    ///
    /// Returns `Ok(false)` when the queue is full and the event was dropped,
    /// and an error once the worker consuming the queue is gone.
    pub fn dispatch(&self, event: TriggeredEvent) -> Result<bool> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    monitor = %self.monitor,
                    event = %event.event,
                    action = %event.action,
                    "Action queue full, dropping event"
                );
                self.metrics.inc_events_dropped(&self.monitor);
                Ok(false)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.inc_events_dropped(&self.monitor);
                Err(EngineError::DispatchClosed {
                    monitor: self.monitor.clone(),
                })
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn monitor(&self) -> &str {
        &self.monitor
    }
}

async fn run_worker(pool: ActionPool, monitor: String, mut rx: mpsc::Receiver<TriggeredEvent>) {
    debug!(monitor = %monitor, "Action worker started");

    while let Some(event) = rx.recv().await {
        let name = event.event.clone();
        if pool.execute(event).await.is_none() {
            debug!(monitor = %monitor, event = %name, "Pool shutting down, event not executed");
        }
    }

    debug!(monitor = %monitor, "Action worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActionDefinition;
    use crate::models::VmIdentity;
    use crate::testing::{FakeApi, RecordingLauncher};
    use std::collections::BTreeMap;

    fn action() -> ActionDefinition {
        ActionDefinition {
            name: "notify".to_string(),
            script: Some("notify.ps1".to_string()),
            parameters: BTreeMap::from([("Seq".to_string(), "seq".to_string())]),
            ..ActionDefinition::default()
        }
    }

    fn event(monitor: &str, seq: usize) -> TriggeredEvent {
        TriggeredEvent {
            monitor: monitor.to_string(),
            event: "tick".to_string(),
            action: "notify".to_string(),
            captures: BTreeMap::from([("seq".to_string(), seq.to_string())]),
            line: format!("tick {seq}"),
        }
    }

    fn pool(launcher: Arc<RecordingLauncher>, config: PoolConfig) -> ActionPool {
        let executor = ActionExecutor::new(
            [action()],
            VmIdentity::new("vm-1", None),
            Arc::new(FakeApi::default()),
            launcher,
        );
        ActionPool::new(Arc::new(executor), config)
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.queue_capacity, 256);
    }

    #[tokio::test]
    async fn test_dispatcher_preserves_order() {
        let launcher = Arc::new(RecordingLauncher::default());
        let pool = pool(launcher.clone(), PoolConfig::default());
        let (dispatcher, worker) = pool.dispatcher("app");

        for seq in 0..20 {
            assert!(dispatcher.dispatch(event("app", seq)).unwrap());
        }
        drop(dispatcher);
        worker.await.unwrap();

        let requests = launcher.requests.lock().unwrap();
        let seqs: Vec<String> = requests.iter().map(|r| r.params[0].1.clone()).collect();
        let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        assert_eq!(seqs, expected);
    }

    #[tokio::test]
    async fn test_full_queue_drops_events() {
        let launcher = Arc::new(RecordingLauncher {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let pool = pool(
            launcher.clone(),
            PoolConfig {
                max_concurrent: 1,
                queue_capacity: 1,
            },
        );
        let (dispatcher, _worker) = pool.dispatcher("app");

        let accepted = (0..10)
            .filter(|i| dispatcher.dispatch(event("app", *i)).unwrap())
            .count();
        assert!(accepted < 10);
    }

    #[tokio::test]
    async fn test_concurrency_is_capped() {
        let launcher = Arc::new(RecordingLauncher {
            delay: Some(Duration::from_millis(300)),
            ..Default::default()
        });
        let pool = pool(
            launcher.clone(),
            PoolConfig {
                max_concurrent: 2,
                queue_capacity: 16,
            },
        );

        let mut workers = Vec::new();
        let mut dispatchers = Vec::new();
        for name in ["a", "b", "c", "d"] {
            let (d, w) = pool.dispatcher(name);
            d.dispatch(event(name, 0)).unwrap();
            dispatchers.push(d);
            workers.push(w);
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.in_flight(), 2);
        assert_eq!(launcher.count(), 2);

        drop(dispatchers);
        for w in workers {
            w.await.unwrap();
        }
        assert_eq!(launcher.count(), 4);
    }

    #[tokio::test]
    async fn test_dispatch_after_worker_exit_is_error() {
        let launcher = Arc::new(RecordingLauncher::default());
        let pool = pool(launcher, PoolConfig::default());
        let (dispatcher, worker) = pool.dispatcher("app");
        worker.abort();
        let _ = worker.await;

        assert!(dispatcher.is_closed());
        let err = dispatcher.dispatch(event("app", 0)).unwrap_err();
        assert_eq!(err.kind(), "dispatch_error");
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight() {
        let launcher = Arc::new(RecordingLauncher {
            delay: Some(Duration::from_millis(100)),
            ..Default::default()
        });
        let pool = pool(launcher.clone(), PoolConfig::default());
        let (dispatcher, _worker) = pool.dispatcher("app");
        dispatcher.dispatch(event("app", 0)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let outcome = pool.shutdown(Duration::from_secs(5)).await;
        assert_eq!(outcome, ShutdownOutcome::Drained);
        assert!(!pool.is_accepting());
        assert!(pool.execute(event("app", 1)).await.is_none());
        assert_eq!(launcher.count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_hard_cancels_after_grace() {
        let launcher = Arc::new(RecordingLauncher {
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let pool = pool(launcher.clone(), PoolConfig::default());
        let (dispatcher, _worker) = pool.dispatcher("app");
        dispatcher.dispatch(event("app", 0)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let start = std::time::Instant::now();
        let outcome = pool.shutdown(Duration::from_millis(100)).await;
        assert_eq!(outcome, ShutdownOutcome::HardCancelled);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(pool.in_flight(), 0);
    }
}
