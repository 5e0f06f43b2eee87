/*
  MirrorEngine - wires watcher, ledger, sync manager and comms together

  start():
    root check -> ledger -> SyncManager -> comms (handlers, listen, dial)
      -> watcher supervisor -> sync worker -> initial reconciliation

  All sync work funnels through one worker task, so ledger updates for a
  path never interleave. Read loops only drop frames into the inbox, and
  each new connection's resync runs in its own task, so neither side of a
  link ever waits on the other's worker.

┌──────────────┐ ChangeEvent ┌──────────────┐ broadcast ┌──────────────┐
│ Watcher      │────────────►│              │──────────►│              │
│ Supervisor   │   Rescan    │ Sync Worker  │           │ Comms        │
└──────────────┘             │ (SyncQueue)  │◄──────────│ (handlers)   │
                             │              │   Inbox   │              │
┌──────────────┐ Established └──────┬───────┘           │              │
│ Event Fwd    │────► resync task ──┼──────────────────►│              │
└──────────────┘                    │                   └──────────────┘
                             ┌──────▼───────┐
                             │ SyncManager  │── SqlLedger
                             └──────────────┘
*/
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::handlers::{InboundHandler, Inbox};
use super::reconcile;
use super::state::SharedState;
use super::status::{ActivityLog, EngineStatus};
use super::supervisor::WatcherSupervisor;
use super::worker::{resync, SyncWorker, WorkerCommand, WorkerSettings};
use super::{EngineError, EngineState, NoopVersionControl, VersionControl};
use crate::config::MirrorConfig;
use crate::core_comms::{CommsConfig, CommunicationManager, ConnectionEvent};
use crate::core_ledger::{LedgerError, SqlLedger, SyncLedger};
use crate::core_sync::{
    message_types, resolver_for, ContentMerger, EchoGuard, PendingConflict, Resolution,
    SyncManager, SyncRecord,
};
use crate::core_watch::{probe_strategy, WatchConfig, WatchStrategy};
use crate::health::{checks, ComponentHealth, HealthChecker, HealthStatus};
use crate::metrics::SyncMetrics;
use crate::shutdown::{Shutdown, ShutdownTrigger};

/// How long `start` waits for the first watcher start attempt
const WATCHER_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Pieces that only exist while the engine runs
struct Running {
    sync: Arc<SyncManager>,
    comms: CommunicationManager,
    worker: mpsc::Sender<WorkerCommand>,
    trigger: ShutdownTrigger,
    tasks: Vec<JoinHandle<()>>,
    listen_address: Option<SocketAddr>,
}

/// One side of a mirrored workspace
pub struct MirrorEngine {
    config: MirrorConfig,
    session_id: String,
    vcs: Arc<dyn VersionControl>,
    merger: Option<Arc<dyn ContentMerger>>,
    metrics: Arc<SyncMetrics>,
    health: HealthChecker,
    activity: ActivityLog,
    state: SharedState,
    running: Mutex<Option<Running>>,
}

impl MirrorEngine {
    pub fn new(config: MirrorConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config,
            session_id: Uuid::new_v4().to_string(),
            vcs: Arc::new(NoopVersionControl),
            merger: None,
            metrics: Arc::new(SyncMetrics::new()),
            health: HealthChecker::new(),
            activity: ActivityLog::default(),
            state: SharedState::new(EngineState::Stopped),
            running: Mutex::new(None),
        })
    }

    pub fn with_version_control(mut self, vcs: Arc<dyn VersionControl>) -> Self {
        self.vcs = vcs;
        self
    }

    /// Merge hook used by the `merge` conflict strategy
    pub fn with_merger(mut self, merger: Arc<dyn ContentMerger>) -> Self {
        self.merger = Some(merger);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    #[instrument(skip(self), fields(session = %self.session_id))]
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut running = self.running.lock().await;
        let current = self.state.get();
        if !current.can_start() || running.is_some() {
            return Err(EngineError::InvalidState { actual: current });
        }
        self.state.set(EngineState::Starting);

        let comms = CommunicationManager::new(self.session_id.clone(), CommsConfig::from(&self.config));
        let trigger = ShutdownTrigger::new();
        match self.launch(comms.clone(), &trigger).await {
            Ok(started) => {
                *running = Some(started);
                self.state.set(EngineState::Running);
                info!(root = %self.config.workspace_root.display(), "Mirror engine running");
                Ok(())
            }
            Err(e) => {
                trigger.trigger();
                comms.shutdown().await;
                self.state.set(EngineState::Error);
                error!(error = %e, "Mirror engine failed to start");
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        comms: CommunicationManager,
        trigger: &ShutdownTrigger,
    ) -> Result<Running, EngineError> {
        let root = validate_root(&self.config.workspace_root).await?;

        let ledger = open_ledger(self.config.ledger_path()).await?;
        self.health
            .set(ComponentHealth::running(checks::LEDGER))
            .await;

        let strategy = probe_strategy(&root, self.config.watch_mode)?;
        let resolver = resolver_for(self.config.conflict_strategy, self.merger.clone());
        let sync = Arc::new(
            SyncManager::new(ledger, self.session_id.clone(), root.clone(), resolver)
                .with_echo_guard(EchoGuard::new(echo_latency(strategy, &self.config)))
                .with_metrics(self.metrics.clone()),
        );

        let (worker_tx, worker_rx) = mpsc::channel(self.config.queue_capacity);
        let inbox = Inbox::default();
        let mut tasks = Vec::new();

        // Handlers and the event subscription go in before any connection
        // exists so the first peer gets a resync too.
        let inbound = Arc::new(InboundHandler::new(inbox.clone()));
        comms
            .register_handler(message_types::FILE_SYNC, inbound.clone())
            .await;
        comms
            .register_handler(message_types::FILE_DELETE, inbound)
            .await;
        tasks.push(tokio::spawn(forward_connection_events(
            comms.subscribe(),
            sync.clone(),
            comms.clone(),
            trigger.listener(),
        )));

        let listen_address = if self.config.listen_address.is_empty() {
            None
        } else {
            let addr = comms
                .listen(&self.config.listen_address)
                .await
                .map_err(EngineError::Listen)?;
            Some(addr)
        };

        if let Some(endpoint) = &self.config.remote_endpoint {
            if let Err(e) = comms.dial(endpoint, true).await {
                if !self.config.offline_mode {
                    return Err(EngineError::Dial(e));
                }
                warn!(endpoint = %endpoint, error = %e, "Remote unreachable, starting offline");
                comms.reconnect_in_background(endpoint).await;
            }
        }
        self.health
            .set(checks::check_comms(
                comms.active_count().await,
                self.config.remote_endpoint.is_some(),
            ))
            .await;

        let supervisor = WatcherSupervisor::new(
            root.clone(),
            strategy,
            WatchConfig::from(&self.config),
            worker_tx.clone(),
            self.health.clone(),
            self.metrics.clone(),
            self.activity.clone(),
        );
        let (ready_tx, ready_rx) = oneshot::channel();
        tasks.push(tokio::spawn(supervisor.run(ready_tx, trigger.listener())));
        match tokio::time::timeout(WATCHER_READY_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "Watcher not started yet, supervisor will retry"),
            Ok(Err(_)) | Err(_) => warn!("Watcher start did not report in time"),
        }

        let worker = SyncWorker::new(
            sync.clone(),
            comms.clone(),
            self.vcs.clone(),
            WorkerSettings {
                batch_size: self.config.sync_batch_size,
                queue_capacity: self.config.queue_capacity,
                drain_interval: self.config.drain_interval(),
                auto_commit: self.config.auto_commit,
                history_retention: self.config.history_retention,
                ignore_patterns: self.config.effective_ignore_patterns(),
            },
            self.metrics.clone(),
            self.activity.clone(),
            self.health.clone(),
            self.state.clone(),
        );
        tasks.push(tokio::spawn(worker.run(
            worker_rx,
            inbox,
            trigger.listener(),
        )));

        let changes = reconcile::plan(&sync, &root, &self.config.effective_ignore_patterns()).await?;
        let queued = changes.len();
        for change in changes {
            if worker_tx.send(WorkerCommand::Local(change)).await.is_err() {
                break;
            }
        }
        info!(queued, "Initial reconciliation queued");

        Ok(Running {
            sync,
            comms,
            worker: worker_tx,
            trigger: trigger.clone(),
            tasks,
            listen_address,
        })
    }

    /// Stop every task and close all connections. Stopping a stopped engine
    /// is a no-op.
    #[instrument(skip(self), fields(session = %self.session_id))]
    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut running = self.running.lock().await;
        let Some(current) = running.take() else {
            if self.state.get() == EngineState::Error {
                self.state.set(EngineState::Stopped);
            }
            return Ok(());
        };
        self.state.set(EngineState::Stopping);

        current.trigger.trigger();
        current.comms.shutdown().await;
        for task in current.tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.config.shutdown_timeout, task)
                .await
                .is_err()
            {
                warn!("Task did not stop within the shutdown timeout, aborting");
                abort.abort();
            }
        }

        self.state.set(EngineState::Stopped);
        info!("Mirror engine stopped");
        Ok(())
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .await
            .as_ref()
            .and_then(|r| r.listen_address)
    }

    pub async fn status(&self) -> EngineStatus {
        let running = self.running.lock().await;
        let (active_connections, pending_conflicts, listen_address) = match running.as_ref() {
            Some(r) => (
                r.comms.active_count().await,
                r.sync.pending_count(),
                r.listen_address,
            ),
            None => (0, 0, None),
        };
        drop(running);

        let state = self.state.get();
        if state == EngineState::Running {
            self.health
                .set(checks::check_comms(
                    active_connections,
                    self.config.remote_endpoint.is_some(),
                ))
                .await;
        }
        let report = self.health.report().await;
        let health = match state {
            EngineState::Error => HealthStatus::Error,
            _ => report.status,
        };

        EngineStatus {
            state,
            health,
            session_id: self.session_id.clone(),
            listen_address,
            watch_strategy: self.activity.watch_strategy(),
            active_connections,
            pending_conflicts,
            last_sync: self.activity.last_sync(),
            last_successful_sync_at: self.activity.last_successful_sync_at(),
            metrics: self.metrics.snapshot(),
            components: report.components,
        }
    }

    async fn sync_manager(&self) -> Result<Arc<SyncManager>, EngineError> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.sync.clone())
            .ok_or(EngineError::InvalidState {
                actual: self.state.get(),
            })
    }

    /// Current ledger record for `path`
    pub async fn sync_status(&self, path: &str) -> Result<Option<SyncRecord>, EngineError> {
        Ok(self.sync_manager().await?.get_sync_status(path).await?)
    }

    pub async fn pending_conflicts(&self) -> Vec<PendingConflict> {
        match self.sync_manager().await {
            Ok(sync) => sync.pending_conflicts(),
            Err(_) => Vec::new(),
        }
    }

    pub async fn ledger_snapshot(&self) -> Result<Vec<SyncRecord>, EngineError> {
        Ok(self.sync_manager().await?.ledger_snapshot().await?)
    }

    /// Settle a paused path. Runs on the sync worker so it is ordered with
    /// queued work for the same path.
    pub async fn resolve_conflict(
        &self,
        path: &str,
        resolution: Resolution,
    ) -> Result<SyncRecord, EngineError> {
        let worker = self
            .running
            .lock()
            .await
            .as_ref()
            .map(|r| r.worker.clone())
            .ok_or(EngineError::InvalidState {
                actual: self.state.get(),
            })?;

        let (reply, response) = oneshot::channel();
        let command = WorkerCommand::Resolve {
            path: path.to_string(),
            resolution,
            reply,
        };
        let stopped = || EngineError::InvalidState {
            actual: self.state.get(),
        };
        worker.send(command).await.map_err(|_| stopped())?;
        Ok(response.await.map_err(|_| stopped())??)
    }
}

async fn validate_root(root: &Path) -> Result<PathBuf, EngineError> {
    let invalid = |reason: String| EngineError::InvalidRoot(format!("{}: {}", root.display(), reason));
    let meta = tokio::fs::metadata(root)
        .await
        .map_err(|e| invalid(e.to_string()))?;
    if !meta.is_dir() {
        return Err(invalid("not a directory".to_string()));
    }
    tokio::fs::canonicalize(root)
        .await
        .map_err(|e| invalid(e.to_string()))
}

async fn open_ledger(path: PathBuf) -> Result<Arc<dyn SyncLedger>, EngineError> {
    let ledger = tokio::task::spawn_blocking(move || SqlLedger::open(&path))
        .await
        .map_err(|e| LedgerError::Io(std::io::Error::other(e)))??;
    debug!(location = ?ledger.location(), "Ledger opened");
    Ok(Arc::new(ledger))
}

/// Longest a change we wrote can take to reach the worker's echo check
fn echo_latency(strategy: WatchStrategy, config: &MirrorConfig) -> Duration {
    let watcher = match strategy {
        WatchStrategy::Native => config.debounce_window(),
        // Polling reports a change on the first scan after it
        WatchStrategy::Polling => config.debounce_window().max(config.poll_interval()),
    };
    watcher + config.drain_interval()
}

/// Start a resync task for every new connection
async fn forward_connection_events(
    mut events: broadcast::Receiver<ConnectionEvent>,
    sync: Arc<SyncManager>,
    comms: CommunicationManager,
    shutdown: Shutdown,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(ConnectionEvent::Established { id, endpoint, .. }) => {
                    debug!(conn_id = id, endpoint = %endpoint, "Connection established, starting resync");
                    let sync = sync.clone();
                    let comms = comms.clone();
                    let stop = shutdown.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = stop.cancelled() => {}
                            _ = resync(sync, comms, id) => {}
                        }
                    });
                }
                Ok(ConnectionEvent::Closed { id, endpoint }) => {
                    debug!(conn_id = id, endpoint = %endpoint, "Connection closed");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Connection events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
