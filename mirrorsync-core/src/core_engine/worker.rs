//! The single task that applies sync work, one item at a time

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use super::handlers::Inbox;
use super::reconcile;
use super::status::ActivityLog;
use super::state::SharedState;
use super::{EngineState, VersionControl};
use crate::core_comms::{CommunicationManager, ConnectionId};
use crate::core_sync::{
    content_hash, read_local, resolve_path, ApplyResult, OutboundOutcome, QueueKey, Resolution,
    SyncError, SyncManager, SyncMessage, SyncQueue, SyncRecord,
};
use crate::core_watch::{unix_now, ChangeEvent};
use crate::health::{checks, ComponentHealth, HealthChecker};
use crate::metrics::SyncMetrics;
use crate::shutdown::Shutdown;

/// Ledger writes between retention passes
const PRUNE_EVERY: usize = 200;

/// Work submitted to the worker
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    /// A debounced local change
    Local(ChangeEvent),
    /// Compare the whole tree against the ledger, e.g. after the watcher
    /// was down
    Rescan,
    Resolve {
        path: String,
        resolution: Resolution,
        reply: oneshot::Sender<Result<SyncRecord, SyncError>>,
    },
}

#[derive(Debug)]
enum SyncTask {
    Outbound(ChangeEvent),
    Inbound {
        conn_id: ConnectionId,
        message: SyncMessage,
    },
}

pub(crate) struct WorkerSettings {
    pub batch_size: usize,
    pub queue_capacity: usize,
    pub drain_interval: Duration,
    pub auto_commit: bool,
    pub history_retention: usize,
    pub ignore_patterns: Vec<String>,
}

pub(crate) struct SyncWorker {
    sync: Arc<SyncManager>,
    comms: CommunicationManager,
    vcs: Arc<dyn VersionControl>,
    queue: SyncQueue<SyncTask>,
    settings: WorkerSettings,
    metrics: Arc<SyncMetrics>,
    activity: ActivityLog,
    health: HealthChecker,
    state: SharedState,
    writes_since_prune: usize,
}

impl SyncWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sync: Arc<SyncManager>,
        comms: CommunicationManager,
        vcs: Arc<dyn VersionControl>,
        settings: WorkerSettings,
        metrics: Arc<SyncMetrics>,
        activity: ActivityLog,
        health: HealthChecker,
        state: SharedState,
    ) -> Self {
        Self {
            queue: SyncQueue::new(settings.queue_capacity),
            sync,
            comms,
            vcs,
            settings,
            metrics,
            activity,
            health,
            state,
            writes_since_prune: 0,
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<WorkerCommand>,
        inbox: Inbox,
        shutdown: Shutdown,
    ) {
        let mut ticker = tokio::time::interval(self.settings.drain_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.accept(command).await,
                    None => break,
                },
                _ = inbox.ready() => self.take_inbound(&inbox).await,
                _ = ticker.tick() => self.drain().await,
            }
        }
        debug!(
            queued = self.queue.len(),
            inbound_waiting = inbox.len(),
            "Sync worker stopped"
        );
    }

    async fn accept(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Local(event) => {
                let key = QueueKey::outbound(event.path.clone());
                self.enqueue(key, SyncTask::Outbound(event)).await;
            }
            WorkerCommand::Rescan => self.rescan().await,
            WorkerCommand::Resolve {
                path,
                resolution,
                reply,
            } => {
                let result = self.resolve(&path, resolution).await;
                // Caller may have given up waiting
                let _ = reply.send(result);
            }
        }
    }

    async fn take_inbound(&mut self, inbox: &Inbox) {
        for (conn_id, message) in inbox.take() {
            let key = QueueKey::inbound(message.path.clone());
            self.enqueue(key, SyncTask::Inbound { conn_id, message })
                .await;
        }
    }

    async fn enqueue(&mut self, key: QueueKey, task: SyncTask) {
        let mut task = task;
        loop {
            match self.queue.push(key.clone(), task) {
                Ok(_) => return,
                Err(rejected) => {
                    trace!("Queue full, draining early");
                    task = rejected;
                    self.drain().await;
                }
            }
        }
    }

    async fn drain(&mut self) {
        self.sync.echo_guard().sweep();
        if self.queue.is_empty() {
            return;
        }

        let batch = self.queue.drain_batch(self.settings.batch_size);
        let mut synced = Vec::new();
        for task in batch {
            match task {
                SyncTask::Outbound(event) => {
                    if let Some(path) = self.process_outbound(event).await {
                        synced.push(path);
                    }
                }
                SyncTask::Inbound { conn_id, message } => {
                    self.process_inbound(conn_id, message).await;
                }
            }
        }

        if !synced.is_empty() {
            self.notify_version_control(&synced).await;
        }
        if self.writes_since_prune >= PRUNE_EVERY {
            self.writes_since_prune = 0;
            match self.sync.prune_history(self.settings.history_retention).await {
                Ok(removed) => debug!(removed, "Ledger retention pass"),
                Err(e) => self.handle_error("prune", &e).await,
            }
        }
    }

    /// Returns the path when a local change was recorded and broadcast
    async fn process_outbound(&mut self, event: ChangeEvent) -> Option<String> {
        let path = event.path.clone();
        let abs = match resolve_path(self.sync.workspace_root(), &path) {
            Ok(abs) => abs,
            Err(e) => {
                warn!(path = %path, error = %e, "Ignoring change outside the workspace");
                return None;
            }
        };

        // The final state on disk decides; a "deleted" path may have come back
        let on_disk = match read_local(&abs).await {
            Ok(on_disk) => on_disk,
            Err(e) => {
                self.handle_error(&path, &e).await;
                return None;
            }
        };
        let disk_hash = on_disk.as_ref().map(|(content, _)| content_hash(content));
        if self.sync.echo_guard().is_echo(&path, disk_hash.as_deref()) {
            self.metrics.inc_echo_suppressed();
            trace!(path = %path, "Echo of an inbound write suppressed");
            return None;
        }

        let result = match on_disk {
            Some((content, _)) => {
                self.sync
                    .sync_outbound(&path, content, event.observed_at)
                    .await
            }
            None => self.sync.sync_delete(&path, event.observed_at).await,
        };

        match result {
            Ok(OutboundOutcome::Broadcast { record, content }) => {
                self.writes_since_prune += 1;
                let message = SyncMessage::for_record(&record, &content);
                let delivered = self.comms.broadcast(&message, &HashSet::new()).await;
                self.metrics.add_broadcast_deliveries(delivered);
                self.activity.record_sync(&path, record.timestamp);
                debug!(
                    path = %path,
                    deleted = record.deleted,
                    delivered,
                    kind = ?event.kind,
                    "Local change synced"
                );
                Some(path)
            }
            Ok(OutboundOutcome::Unchanged { .. }) => {
                trace!(path = %path, "Local change matches ledger");
                None
            }
            Ok(OutboundOutcome::Superseded(decision)) => {
                info!(path = %path, reason = %decision.reason, "Local change superseded by newer remote state");
                None
            }
            Err(e) => {
                self.handle_error(&path, &e).await;
                None
            }
        }
    }

    async fn process_inbound(&mut self, conn_id: ConnectionId, message: SyncMessage) {
        let path = message.path.clone();
        match self.sync.apply_inbound(&message).await {
            Ok(result @ ApplyResult::Applied { .. }) => {
                self.writes_since_prune += 1;
                if let ApplyResult::Applied { record, .. } = &result {
                    self.activity.record_sync(&path, record.timestamp);
                    if let Some(merged) = result.merged_content() {
                        let outgoing = SyncMessage::file_sync(record, merged);
                        let delivered = self.comms.broadcast(&outgoing, &HashSet::new()).await;
                        self.metrics.add_broadcast_deliveries(delivered);
                    }
                }
            }
            Ok(ApplyResult::Unchanged { .. }) => {
                trace!(path = %path, conn_id, "Inbound change already applied");
            }
            Ok(ApplyResult::Rejected { decision, local }) => {
                info!(path = %path, conn_id, reason = %decision.reason, "Inbound change rejected");
                if local.timestamp > message.timestamp {
                    send_state(&self.sync, &self.comms, conn_id, &local).await;
                }
            }
            Err(e) => self.handle_error(&path, &e).await,
        }
    }

    async fn rescan(&mut self) {
        let sync = self.sync.clone();
        match reconcile::plan(&sync, sync.workspace_root(), &self.settings.ignore_patterns).await {
            Ok(changes) => {
                let queued = changes.len();
                for change in changes {
                    let key = QueueKey::outbound(change.path.clone());
                    self.enqueue(key, SyncTask::Outbound(change)).await;
                }
                info!(queued, "Rescan queued");
            }
            Err(e) => warn!(error = %e, "Rescan failed"),
        }
    }

    async fn resolve(&mut self, path: &str, resolution: Resolution) -> Result<SyncRecord, SyncError> {
        let record = self.sync.resolve_conflict(path, resolution).await?;
        self.activity.record_sync(path, record.timestamp);
        if resolution == Resolution::KeepLocal {
            let exclude = HashSet::new();
            let message = if record.deleted {
                Some(SyncMessage::file_delete(&record))
            } else {
                let abs = resolve_path(self.sync.workspace_root(), path)?;
                read_local(&abs)
                    .await?
                    .map(|(content, _)| SyncMessage::file_sync(&record, &content))
            };
            if let Some(message) = message {
                let delivered = self.comms.broadcast(&message, &exclude).await;
                self.metrics.add_broadcast_deliveries(delivered);
            }
        }
        Ok(record)
    }

    async fn notify_version_control(&self, paths: &[String]) {
        match self.vcs.track_changes(paths).await {
            Ok(outcome) => trace!(detail = %outcome.detail, "Version control tracked changes"),
            Err(e) => warn!(error = %e, "Version control tracking failed"),
        }
        if self.settings.auto_commit {
            let message = format!("mirrorsync: {} file(s) at {:.0}", paths.len(), unix_now());
            if let Err(e) = self.vcs.commit(&message).await {
                warn!(error = %e, "Version control commit failed");
            }
        }
    }

    async fn handle_error(&self, context: &str, e: &SyncError) {
        match e {
            SyncError::Integrity { .. } => warn!(path = context, error = %e, "Inbound change dropped"),
            SyncError::ConflictUnresolved { .. } => {
                info!(path = context, "Path paused pending conflict resolution")
            }
            _ if e.is_fatal() => {
                error!(context, error = %e, "Ledger failure; engine entering error state");
                self.health
                    .set(ComponentHealth::error(checks::LEDGER, e.to_string()))
                    .await;
                self.state.set(EngineState::Error);
            }
            _ => warn!(context, error = %e, "Sync task failed"),
        }
    }
}

/// Send our state for `record` to one connection. Live records are only
/// sent while the disk still holds the recorded bytes.
async fn send_state(
    sync: &SyncManager,
    comms: &CommunicationManager,
    conn_id: ConnectionId,
    record: &SyncRecord,
) -> bool {
    let message = if record.deleted {
        SyncMessage::file_delete(record)
    } else {
        let Ok(abs) = resolve_path(sync.workspace_root(), &record.path) else {
            return false;
        };
        match read_local(&abs).await {
            Ok(Some((content, _))) if content_hash(&content) == record.content_hash => {
                SyncMessage::file_sync(record, &content)
            }
            _ => {
                trace!(path = %record.path, "Disk moved on since record; skipping");
                return false;
            }
        }
    };
    comms.send(conn_id, &message).await
}

/// Send the full ledger state to a newly established connection.
///
/// Runs beside the worker: a peer that is slow to read only holds up its own
/// resync.
pub(crate) async fn resync(sync: Arc<SyncManager>, comms: CommunicationManager, conn_id: ConnectionId) {
    let records = match sync.ledger_snapshot().await {
        Ok(records) => records,
        Err(e) => {
            warn!(conn_id, error = %e, "Resync skipped, ledger unreadable");
            return;
        }
    };

    let mut sent = 0;
    for record in &records {
        if send_state(&sync, &comms, conn_id, record).await {
            sent += 1;
        }
    }
    info!(conn_id, sent, total = records.len(), "Resync sent to connection");
}
