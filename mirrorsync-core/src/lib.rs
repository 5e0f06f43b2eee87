//! MirrorSync keeps two copies of a workspace directory identical across a
//! TCP link. Each side watches its tree, records what it last synced in a
//! SQLite ledger and exchanges framed JSON messages with its peer.

pub mod config;
pub mod core_comms;
pub mod core_engine;
pub mod core_ledger;
pub mod core_sync;
pub mod core_watch;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod shutdown;

pub use config::MirrorConfig;
pub use core_engine::{EngineError, EngineState, EngineStatus, MirrorEngine};
pub use core_sync::{ConflictStrategy, Resolution, SyncRecord};
pub use logging::{init_logging, LogLevel};
