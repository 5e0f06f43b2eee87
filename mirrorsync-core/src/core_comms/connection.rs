use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};
use tokio::net::tcp::OwnedWriteHalf;

use crate::shutdown::ShutdownTrigger;

pub type ConnectionId = u64;

/// Metadata key filled from the first frame a peer sends
pub const SESSION_ID_KEY: &str = "session_id";

/// Read-only view of a live connection
#[derive(Debug, Clone, Serialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub endpoint: String,
    pub established_at: SystemTime,
    pub last_heartbeat_at: SystemTime,
    pub is_active: bool,
    /// True when this side dialed
    pub outbound: bool,
    pub session_metadata: HashMap<String, String>,
}

impl Connection {
    pub fn peer_session(&self) -> Option<&str> {
        self.session_metadata.get(SESSION_ID_KEY).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Established {
        id: ConnectionId,
        endpoint: String,
        outbound: bool,
    },
    Closed {
        id: ConnectionId,
        endpoint: String,
    },
}

#[derive(Debug)]
struct Liveness {
    last_heartbeat_at: SystemTime,
    last_seen: Instant,
    session_metadata: HashMap<String, String>,
}

/// State touched by the read loop and inspected by the heartbeat sweep
#[derive(Debug, Clone)]
pub(crate) struct LivenessHandle(Arc<Mutex<Liveness>>);

impl LivenessHandle {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Liveness {
            last_heartbeat_at: SystemTime::now(),
            last_seen: Instant::now(),
            session_metadata: HashMap::new(),
        })))
    }

    fn lock(&self) -> MutexGuard<'_, Liveness> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn touch(&self, peer_session: &str) {
        let mut state = self.lock();
        state.last_heartbeat_at = SystemTime::now();
        state.last_seen = Instant::now();
        if !peer_session.is_empty() {
            state
                .session_metadata
                .entry(SESSION_ID_KEY.to_string())
                .or_insert_with(|| peer_session.to_string());
        }
    }

    pub(crate) fn silent_for(&self) -> Duration {
        self.lock().last_seen.elapsed()
    }
}

/// Entry in the connection table
pub(crate) struct ConnectionEntry {
    pub id: ConnectionId,
    pub endpoint: String,
    pub outbound: bool,
    pub established_at: SystemTime,
    pub writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    pub liveness: LivenessHandle,
    /// Stops this connection's read loop
    pub closer: ShutdownTrigger,
}

impl ConnectionEntry {
    pub fn new(id: ConnectionId, endpoint: String, outbound: bool, writer: OwnedWriteHalf) -> Self {
        Self {
            id,
            endpoint,
            outbound,
            established_at: SystemTime::now(),
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            liveness: LivenessHandle::new(),
            closer: ShutdownTrigger::new(),
        }
    }

    pub fn snapshot(&self) -> Connection {
        let state = self.liveness.lock();
        Connection {
            id: self.id,
            endpoint: self.endpoint.clone(),
            established_at: self.established_at,
            last_heartbeat_at: state.last_heartbeat_at,
            is_active: !self.closer.is_triggered(),
            outbound: self.outbound,
            session_metadata: state.session_metadata.clone(),
        }
    }
}
