//! Sync manager: ledger bookkeeping, conflict detection and inbound applies

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use super::conflict::{Candidate, ConflictDecision, ConflictResolver, PendingConflict, Resolution, Winner};
use super::echo::EchoGuard;
use super::message::{message_types, SyncMessage};
use super::workspace::{read_local, remove_file, resolve_path, write_atomic};
use super::{content_hash, SyncError};
use crate::core_ledger::{LedgerError, SyncLedger, SyncRecord};
use crate::core_watch::unix_now;
use crate::metrics::{SyncMetrics, Timer, APPLY_DURATION_MS};

/// Result of a local change
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundOutcome {
    /// Ledger updated; send `record` (with `content`) to peers
    Broadcast { record: SyncRecord, content: Vec<u8> },
    /// Ledger already holds this state
    Unchanged { path: String },
    /// A newer remote state won the conflict; nothing to send
    Superseded(ConflictDecision),
}

/// Result of an inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyResult {
    /// Workspace and ledger now hold `record`
    Applied {
        record: SyncRecord,
        previous: Option<SyncRecord>,
        decision: Option<ConflictDecision>,
    },
    /// Already in this state; no write happened
    Unchanged { path: String },
    /// Local state kept
    Rejected {
        decision: ConflictDecision,
        local: SyncRecord,
    },
}

impl ApplyResult {
    /// Bytes produced by a merge that peers have not seen yet
    pub fn merged_content(&self) -> Option<&[u8]> {
        match self {
            ApplyResult::Applied {
                decision:
                    Some(ConflictDecision {
                        winner: Winner::Merged(bytes),
                        ..
                    }),
                ..
            } => Some(bytes),
            _ => None,
        }
    }
}

pub struct SyncManager {
    ledger: Arc<dyn SyncLedger>,
    session_id: String,
    root: PathBuf,
    resolver: Arc<dyn ConflictResolver>,
    echo: EchoGuard,
    pending: Mutex<HashMap<String, PendingConflict>>,
    metrics: Arc<SyncMetrics>,
}

impl SyncManager {
    pub fn new(
        ledger: Arc<dyn SyncLedger>,
        session_id: impl Into<String>,
        workspace_root: impl Into<PathBuf>,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Self {
        Self {
            ledger,
            session_id: session_id.into(),
            root: workspace_root.into(),
            resolver,
            echo: EchoGuard::default(),
            pending: Mutex::new(HashMap::new()),
            metrics: Arc::new(SyncMetrics::new()),
        }
    }

    pub fn with_echo_guard(mut self, echo: EchoGuard) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn workspace_root(&self) -> &Path {
        &self.root
    }

    pub fn echo_guard(&self) -> &EchoGuard {
        &self.echo
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingConflict>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_not_paused(&self, path: &str) -> Result<(), SyncError> {
        if self.pending().contains_key(path) {
            return Err(SyncError::ConflictUnresolved {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    async fn ledger_call<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SyncLedger) -> Result<T, LedgerError> + Send + 'static,
    {
        let ledger = self.ledger.clone();
        let result = tokio::task::spawn_blocking(move || f(ledger.as_ref()))
            .await
            .map_err(|e| LedgerError::Io(std::io::Error::other(e.to_string())))?;
        Ok(result?)
    }

    async fn current(&self, path: &str) -> Result<Option<SyncRecord>, SyncError> {
        let path = path.to_string();
        self.ledger_call(move |ledger| ledger.current(&path)).await
    }

    async fn store(&self, record: SyncRecord) -> Result<SyncRecord, SyncError> {
        let stored = record.clone();
        self.ledger_call(move |ledger| ledger.record(&stored)).await?;
        Ok(record)
    }

    fn hold_conflict(&self, local: SyncRecord, remote: SyncRecord, remote_content: Option<Vec<u8>>) -> SyncError {
        let path = local.path.clone();
        warn!(path = %path, local_ts = local.timestamp, remote_ts = remote.timestamp, "Conflict held for manual resolution");
        self.pending().insert(
            path.clone(),
            PendingConflict {
                path: path.clone(),
                local,
                remote,
                remote_content,
                detected_at: unix_now(),
            },
        );
        SyncError::ConflictUnresolved { path }
    }

    /// Write under echo suppression. `None` removes the file.
    async fn write_guarded(&self, rel: &str, abs: &Path, bytes: Option<&[u8]>) -> Result<(), SyncError> {
        self.echo.arm(rel);
        let result = match bytes {
            Some(bytes) => write_atomic(&self.root, abs, bytes).await,
            None => remove_file(abs).await.map(|_| ()),
        };
        let written = bytes.map(content_hash);
        self.echo.release(rel, written.as_deref());
        result
    }

    /// Record a local change to `path` observed at `observed_at`.
    #[instrument(skip(self, content), fields(size = content.len()))]
    pub async fn sync_outbound(
        &self,
        path: &str,
        content: Vec<u8>,
        observed_at: f64,
    ) -> Result<OutboundOutcome, SyncError> {
        self.ensure_not_paused(path)?;

        let hash = content_hash(&content);
        let local = SyncRecord::new(path, hash, observed_at, &self.session_id, content.len() as u64);
        let current = self.current(path).await?;

        if let Some(current) = &current {
            if current.is_live_with_hash(&local.content_hash) {
                self.metrics.inc_unchanged();
                return Ok(OutboundOutcome::Unchanged {
                    path: path.to_string(),
                });
            }
        }

        self.settle_outbound(local, Some(content), current).await
    }

    /// Record a local deletion of `path`.
    #[instrument(skip(self))]
    pub async fn sync_delete(&self, path: &str, observed_at: f64) -> Result<OutboundOutcome, SyncError> {
        self.ensure_not_paused(path)?;

        let current = self.current(path).await?;
        match &current {
            None => {
                return Ok(OutboundOutcome::Unchanged {
                    path: path.to_string(),
                })
            }
            Some(record) if record.deleted => {
                self.metrics.inc_unchanged();
                return Ok(OutboundOutcome::Unchanged {
                    path: path.to_string(),
                });
            }
            Some(_) => {}
        }

        let tombstone = SyncRecord::tombstone(path, observed_at, &self.session_id);
        self.settle_outbound(tombstone, None, current).await
    }

    async fn settle_outbound(
        &self,
        local: SyncRecord,
        content: Option<Vec<u8>>,
        current: Option<SyncRecord>,
    ) -> Result<OutboundOutcome, SyncError> {
        let conflicting = current.filter(|current| {
            current.origin_session != self.session_id
                && current.content_hash != local.content_hash
                && current.timestamp > local.timestamp
        });

        let Some(remote) = conflicting else {
            return self.broadcast_local(local, content).await;
        };

        self.metrics.inc_conflict();
        let decision = self.resolver.resolve(
            Candidate::new(&local, content.as_deref()),
            Candidate::new(&remote, None),
        );
        info!(path = %local.path, winner = ?decision.winner, reason = %decision.reason, "Outbound conflict");

        match decision.winner {
            Winner::Local => self.broadcast_local(local, content).await,
            Winner::Remote => Ok(OutboundOutcome::Superseded(decision)),
            Winner::ManualRequired => Err(self.hold_conflict(local, remote, None)),
            Winner::Merged(merged) => {
                let abs = resolve_path(&self.root, &local.path)?;
                self.write_guarded(&local.path, &abs, Some(&merged)).await?;
                let record = SyncRecord::new(
                    local.path.clone(),
                    content_hash(&merged),
                    unix_now(),
                    &self.session_id,
                    merged.len() as u64,
                );
                self.broadcast_local(record, Some(merged)).await
            }
        }
    }

    async fn broadcast_local(
        &self,
        record: SyncRecord,
        content: Option<Vec<u8>>,
    ) -> Result<OutboundOutcome, SyncError> {
        let record = self.store(record).await?;
        self.metrics.inc_outbound();
        debug!(path = %record.path, hash = %record.content_hash, deleted = record.deleted, "Ledger updated for local change");
        Ok(OutboundOutcome::Broadcast {
            record,
            content: content.unwrap_or_default(),
        })
    }

    /// Apply a `file_sync` or `file_delete` from a peer.
    #[instrument(skip(self, message), fields(path = %message.path, kind = %message.msg_type))]
    pub async fn apply_inbound(&self, message: &SyncMessage) -> Result<ApplyResult, SyncError> {
        let timer = Timer::new(APPLY_DURATION_MS);
        let result = self.apply_inbound_inner(message).await;
        timer.stop();
        result
    }

    async fn apply_inbound_inner(&self, message: &SyncMessage) -> Result<ApplyResult, SyncError> {
        let path = message.path.as_str();

        let (remote, remote_content) = match message.msg_type.as_str() {
            message_types::FILE_SYNC => {
                let bytes = message.decode_content()?;
                let expected = message
                    .content_hash
                    .clone()
                    .ok_or_else(|| SyncError::MissingContent {
                        path: path.to_string(),
                    })?;
                let actual = content_hash(&bytes);
                if actual != expected {
                    self.metrics.inc_integrity_rejection();
                    return Err(SyncError::Integrity {
                        path: path.to_string(),
                        expected,
                        actual,
                    });
                }
                let record = SyncRecord::new(
                    path,
                    actual,
                    message.timestamp,
                    &message.session_id,
                    bytes.len() as u64,
                );
                (record, Some(bytes))
            }
            message_types::FILE_DELETE => (
                SyncRecord::tombstone(path, message.timestamp, &message.session_id),
                None,
            ),
            other => return Err(SyncError::UnexpectedMessage(other.to_string())),
        };

        let abs = resolve_path(&self.root, path)?;
        self.ensure_not_paused(path)?;

        let current = self.current(path).await?;
        if let Some(current) = &current {
            let same_state = current.deleted == remote.deleted
                && (remote.deleted || current.content_hash == remote.content_hash);
            if same_state {
                self.metrics.inc_unchanged();
                return Ok(ApplyResult::Unchanged {
                    path: path.to_string(),
                });
            }
        }

        let disk = read_local(&abs).await?;

        // A file on disk may already match the incoming state
        let disk_hash = disk.as_ref().map(|(bytes, _)| content_hash(bytes));
        let disk_matches = match (&disk_hash, remote.deleted) {
            (Some(hash), false) => *hash == remote.content_hash,
            (None, true) => true,
            _ => false,
        };
        if disk_matches {
            let record = self.store(remote).await?;
            self.metrics.inc_inbound();
            return Ok(ApplyResult::Applied {
                record,
                previous: current,
                decision: None,
            });
        }

        // Local candidate: unsynced disk edits take precedence over the ledger
        let local = match (&disk, &disk_hash, &current) {
            (Some((bytes, mtime)), Some(hash), current)
                if current
                    .as_ref()
                    .map_or(true, |c| !c.is_live_with_hash(hash)) =>
            {
                Some(SyncRecord::new(
                    path,
                    hash.clone(),
                    *mtime,
                    &self.session_id,
                    bytes.len() as u64,
                ))
            }
            _ => current.clone(),
        };
        let local_content = disk.as_ref().map(|(bytes, _)| bytes.as_slice());

        let mut decision = None;
        if let Some(local) = local {
            let verdict = if local.origin_session == remote.origin_session {
                // Successive states from one origin: order by timestamp
                let winner = if remote.timestamp > local.timestamp {
                    Winner::Remote
                } else {
                    Winner::Local
                };
                ConflictDecision {
                    involved_paths: vec![path.to_string()],
                    winner,
                    reason: "same origin".to_string(),
                }
            } else {
                self.metrics.inc_conflict();
                let verdict = self.resolver.resolve(
                    Candidate::new(&local, local_content),
                    Candidate::new(&remote, remote_content.as_deref()),
                );
                info!(path, winner = ?verdict.winner, reason = %verdict.reason, "Inbound conflict");
                verdict
            };

            match &verdict.winner {
                Winner::Local => {
                    return Ok(ApplyResult::Rejected {
                        decision: verdict,
                        local,
                    })
                }
                Winner::Remote => {}
                Winner::ManualRequired => {
                    return Err(self.hold_conflict(local, remote, remote_content));
                }
                Winner::Merged(merged) => {
                    self.write_guarded(path, &abs, Some(merged)).await?;
                    let record = SyncRecord::new(
                        path,
                        content_hash(merged),
                        unix_now(),
                        &self.session_id,
                        merged.len() as u64,
                    );
                    let record = self.store(record).await?;
                    self.metrics.inc_inbound();
                    return Ok(ApplyResult::Applied {
                        record,
                        previous: current,
                        decision: Some(verdict),
                    });
                }
            }
            decision = Some(verdict);
        }

        self.write_guarded(path, &abs, remote_content.as_deref())
            .await?;
        let record = self.store(remote).await?;
        self.metrics.inc_inbound();
        debug!(path, hash = %record.content_hash, deleted = record.deleted, "Inbound change applied");

        Ok(ApplyResult::Applied {
            record,
            previous: current,
            decision,
        })
    }

    pub async fn get_sync_status(&self, path: &str) -> Result<Option<SyncRecord>, SyncError> {
        self.current(path).await
    }

    pub fn pending_conflicts(&self) -> Vec<PendingConflict> {
        let mut conflicts: Vec<_> = self.pending().values().cloned().collect();
        conflicts.sort_by(|a, b| a.path.cmp(&b.path));
        conflicts
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Settle a held conflict and resume syncing the path.
    ///
    /// Returns the record now current in the ledger. After `KeepLocal` the
    /// caller should broadcast it.
    #[instrument(skip(self))]
    pub async fn resolve_conflict(
        &self,
        path: &str,
        resolution: Resolution,
    ) -> Result<SyncRecord, SyncError> {
        let conflict = self
            .pending()
            .get(path)
            .cloned()
            .ok_or_else(|| SyncError::NoPendingConflict {
                path: path.to_string(),
            })?;
        let abs = resolve_path(&self.root, path)?;

        let record = match resolution {
            Resolution::TakeRemote => {
                let remote = conflict.remote.clone();
                if remote.deleted {
                    self.write_guarded(path, &abs, None).await?;
                } else {
                    let bytes = conflict
                        .remote_content
                        .as_deref()
                        .ok_or_else(|| SyncError::MissingContent {
                            path: path.to_string(),
                        })?;
                    self.write_guarded(path, &abs, Some(bytes)).await?;
                }
                self.store(remote).await?
            }
            Resolution::KeepLocal => {
                let record = match read_local(&abs).await? {
                    Some((bytes, _)) => SyncRecord::new(
                        path,
                        content_hash(&bytes),
                        unix_now(),
                        &self.session_id,
                        bytes.len() as u64,
                    ),
                    None => SyncRecord::tombstone(path, unix_now(), &self.session_id),
                };
                self.store(record).await?
            }
        };

        self.pending().remove(path);
        info!(path, ?resolution, "Conflict resolved");
        Ok(record)
    }

    pub async fn ledger_snapshot(&self) -> Result<Vec<SyncRecord>, SyncError> {
        self.ledger_call(|ledger| ledger.all_current()).await
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<SyncRecord>, SyncError> {
        self.ledger_call(move |ledger| ledger.history(limit)).await
    }

    pub async fn prune_history(&self, keep: usize) -> Result<usize, SyncError> {
        self.ledger_call(move |ledger| ledger.prune_history(keep)).await
    }
}
