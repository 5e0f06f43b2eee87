//! Message dispatch by `type`

use async_trait::async_trait;
use tracing::{debug, warn};

use super::Connection;
use crate::core_sync::SyncMessage;

/// Handles one message type. A returned message is sent back on the same
/// connection.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, connection: &Connection, message: SyncMessage) -> Option<SyncMessage>;
}

pub struct PingHandler {
    session_id: String,
}

impl PingHandler {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }
}

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(&self, _connection: &Connection, _message: SyncMessage) -> Option<SyncMessage> {
        Some(SyncMessage::pong(&self.session_id))
    }
}

/// Pongs only refresh liveness, which the read loop already did
pub struct PongHandler;

#[async_trait]
impl MessageHandler for PongHandler {
    async fn handle(&self, _connection: &Connection, _message: SyncMessage) -> Option<SyncMessage> {
        None
    }
}

/// Logs a peer's complaint without replying
pub struct UnsupportedHandler;

#[async_trait]
impl MessageHandler for UnsupportedHandler {
    async fn handle(&self, connection: &Connection, message: SyncMessage) -> Option<SyncMessage> {
        warn!(
            conn_id = connection.id,
            endpoint = %connection.endpoint,
            offending = message.detail.as_deref().unwrap_or(""),
            "Peer does not support a message we sent"
        );
        None
    }
}

/// Response for types with no registered handler
pub(crate) fn unhandled(session_id: &str, connection: &Connection, message: &SyncMessage) -> SyncMessage {
    debug!(
        conn_id = connection.id,
        msg_type = %message.msg_type,
        "No handler registered"
    );
    SyncMessage::unsupported(session_id, &message.msg_type)
}
