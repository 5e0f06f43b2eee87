//! Keeps a watcher running for the lifetime of the engine

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::status::ActivityLog;
use super::worker::WorkerCommand;
use crate::core_watch::{create_watcher, WatchConfig, WatchError, WatchStrategy, WatchStream, Watcher};
use crate::health::{checks, ComponentHealth, HealthChecker};
use crate::metrics::SyncMetrics;
use crate::shutdown::Shutdown;

const INITIAL_RESTART_DELAY: Duration = Duration::from_millis(500);
const MAX_RESTART_DELAY: Duration = Duration::from_secs(30);

pub(crate) fn restart_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(INITIAL_RESTART_DELAY)
        .with_max_interval(MAX_RESTART_DELAY)
        .with_max_elapsed_time(None)
        .build()
}

enum PumpEnd {
    Shutdown,
    WorkerGone,
    Failed(String),
}

pub(crate) struct WatcherSupervisor {
    root: PathBuf,
    strategy: WatchStrategy,
    config: WatchConfig,
    worker: mpsc::Sender<WorkerCommand>,
    health: HealthChecker,
    metrics: Arc<SyncMetrics>,
    activity: ActivityLog,
}

impl WatcherSupervisor {
    pub fn new(
        root: PathBuf,
        strategy: WatchStrategy,
        config: WatchConfig,
        worker: mpsc::Sender<WorkerCommand>,
        health: HealthChecker,
        metrics: Arc<SyncMetrics>,
        activity: ActivityLog,
    ) -> Self {
        Self {
            root,
            strategy,
            config,
            worker,
            health,
            metrics,
            activity,
        }
    }

    /// Run until shutdown. `ready` receives the outcome of the first start
    /// attempt; later failures only restart the watcher.
    ///
    /// A fresh watcher only reports changes made after it started, so every
    /// start that follows a failure asks the worker for a rescan.
    pub async fn run(self, ready: oneshot::Sender<Result<(), WatchError>>, shutdown: Shutdown) {
        let mut ready = Some(ready);
        let mut backoff = restart_backoff();
        let mut missed_changes = false;
        self.activity.set_watch_strategy(self.strategy);

        loop {
            match self.start_once().await {
                Ok((mut watcher, stream)) => {
                    self.health
                        .set(ComponentHealth::running(checks::WATCHER))
                        .await;
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }
                    info!(root = %self.root.display(), strategy = %self.strategy, "Watcher started");
                    if std::mem::take(&mut missed_changes) {
                        debug!("Requesting rescan for changes made while the watcher was down");
                        if self.worker.send(WorkerCommand::Rescan).await.is_err() {
                            break;
                        }
                    }

                    let end = self.pump(stream, &shutdown).await;
                    watcher.stop();
                    match end {
                        PumpEnd::Shutdown | PumpEnd::WorkerGone => break,
                        PumpEnd::Failed(reason) => {
                            // Reset after a successful run
                            backoff.reset();
                            missed_changes = true;
                            self.record_failure(&reason).await;
                        }
                    }
                }
                Err(e) => {
                    missed_changes = true;
                    self.record_failure(&e.to_string()).await;
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(e));
                    }
                }
            }

            let delay = backoff.next_backoff().unwrap_or(MAX_RESTART_DELAY);
            debug!(?delay, "Restarting watcher after delay");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("Watcher supervisor stopped");
    }

    async fn start_once(&self) -> Result<(Box<dyn Watcher>, WatchStream), WatchError> {
        let mut watcher = create_watcher(self.strategy, &self.config)?;
        let stream = watcher.start(&self.root).await?;
        Ok((watcher, stream))
    }

    async fn pump(&self, mut stream: WatchStream, shutdown: &Shutdown) -> PumpEnd {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return PumpEnd::Shutdown,
                item = stream.recv() => match item {
                    Some(Ok(event)) => {
                        if self.worker.send(WorkerCommand::Local(event)).await.is_err() {
                            return PumpEnd::WorkerGone;
                        }
                    }
                    Some(Err(e)) => return PumpEnd::Failed(e.to_string()),
                    None => return PumpEnd::Failed("event stream ended".to_string()),
                },
            }
        }
    }

    async fn record_failure(&self, reason: &str) {
        warn!(root = %self.root.display(), reason, "Watcher failed");
        self.metrics.inc_watcher_restart();
        self.health.set(checks::check_watcher(Some(reason))).await;
    }
}
