//! Peer communication: TCP connections carrying framed [`SyncMessage`]s
//!
//! [`SyncMessage`]: crate::core_sync::SyncMessage

mod codec;
mod connection;
mod error;
mod handler;
mod manager;

pub use codec::{decode_frame, encode_frame, read_frame, write_frame};
pub use connection::{Connection, ConnectionEvent, ConnectionId, SESSION_ID_KEY};
pub use error::ConnectionError;
pub use handler::{MessageHandler, PingHandler, PongHandler, UnsupportedHandler};
pub use manager::{CommsConfig, CommunicationManager};
