//! Sync manager and the pieces it coordinates
//!
//! The manager is the only writer of the ledger and of inbound file
//! content. It decides, per change, whether the local or remote state wins
//! and reports what the engine should send in return.

mod conflict;
mod echo;
mod error;
mod hashing;
mod manager;
mod message;
mod queue;
mod workspace;

pub use conflict::{
    resolver_for, Candidate, ConflictDecision, ConflictResolver, ConflictStrategy, ContentMerger,
    LatestWins, ManualResolver, MergeResolver, PendingConflict, Resolution, Winner,
};
pub use echo::{EchoGuard, ECHO_MARGIN};
pub use error::SyncError;
pub use hashing::{content_hash, empty_hash};
pub use manager::{ApplyResult, OutboundOutcome, SyncManager};
pub use message::{message_types, ContentEncoding, SyncMessage};
pub use queue::{Direction, Enqueued, QueueKey, SyncQueue};
pub use workspace::{read_local, resolve_path};

pub use crate::core_ledger::SyncRecord;
