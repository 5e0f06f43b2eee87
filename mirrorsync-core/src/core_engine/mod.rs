//! Mirror engine
//!
//! Owns the lifecycle of one mirrored workspace: opens the ledger, starts the
//! peer link and the watcher, and runs the single sync worker that applies
//! local and remote changes in order.

mod collaborators;
mod engine;
mod error;
mod handlers;
mod reconcile;
mod state;
mod status;
mod supervisor;
mod worker;

pub use collaborators::{CollaboratorError, NoopVersionControl, VcsOutcome, VersionControl};
pub use engine::MirrorEngine;
pub use error::EngineError;
pub use state::EngineState;
pub use status::EngineStatus;
