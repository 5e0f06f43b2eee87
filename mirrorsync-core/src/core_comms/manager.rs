/*
  CommunicationManager - framed peer links over TCP

  Owns every peer connection: accepts inbound sockets, dials configured
  endpoints, frames SyncMessages on the wire and dispatches decoded frames to
  the handler registered for their `type`.

  Tasks:
    - accept loop per listen address
    - read loop per connection (decode, touch liveness, dispatch)
    - heartbeat: ping everyone, evict connections silent for 2x the interval
    - reconnect supervisor per auto-reconnect endpoint

  Outputs:
    ConnectionEvent::Established / Closed on `subscribe()`.
    Handler return values are written back on the originating connection.

┌──────────────┐   accept/dial   ┌──────────────────────────────┐
│ Accept Loop  │────────────────►│ connections (tokio Mutex)    │
│ Supervisor   │                 │   id -> writer, liveness     │
└──────────────┘                 └──────────────┬───────────────┘
                                                │ snapshot
┌──────────────┐   frames        ┌──────────────▼───────────────┐
│ Read Loop #n │────────────────►│ handlers[type] or unhandled  │
└──────────────┘                 └──────────────────────────────┘
*/
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::codec::{decode_frame, encode_frame, read_frame, write_frame};
use super::connection::ConnectionEntry;
use super::handler::{unhandled, PingHandler, PongHandler, UnsupportedHandler};
use super::{Connection, ConnectionError, ConnectionEvent, ConnectionId, MessageHandler};
use crate::config::MirrorConfig;
use crate::core_sync::{message_types, SyncMessage};
use crate::metrics::{record_counter, record_gauge, ACTIVE_CONNECTIONS, MESSAGES_RECEIVED};
use crate::shutdown::{Shutdown, ShutdownTrigger};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct CommsConfig {
    pub heartbeat_interval: Duration,
    pub reconnect_interval: Duration,
    pub max_frame_bytes: usize,
    /// A frame that cannot be written within this long closes its connection
    pub write_timeout: Duration,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(5),
            max_frame_bytes: 32 * 1024 * 1024,
            write_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&MirrorConfig> for CommsConfig {
    fn from(config: &MirrorConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            reconnect_interval: config.reconnect_interval(),
            max_frame_bytes: config.max_frame_bytes,
            // Same limit the heartbeat gives a silent peer
            write_timeout: config.heartbeat_interval() * 2,
        }
    }
}

struct Inner {
    session_id: String,
    config: CommsConfig,
    connections: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    next_conn_id: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
    shutdown: ShutdownTrigger,
    supervisors: Mutex<HashMap<String, ShutdownTrigger>>,
    heartbeat_started: AtomicBool,
}

/// Cheap to clone; clones share the same connection table
#[derive(Clone)]
pub struct CommunicationManager {
    inner: Arc<Inner>,
}

impl CommunicationManager {
    pub fn new(session_id: impl Into<String>, config: CommsConfig) -> Self {
        let session_id = session_id.into();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let mut handlers: HashMap<String, Arc<dyn MessageHandler>> = HashMap::new();
        handlers.insert(
            message_types::PING.to_string(),
            Arc::new(PingHandler::new(&session_id)),
        );
        handlers.insert(message_types::PONG.to_string(), Arc::new(PongHandler));
        handlers.insert(
            message_types::UNSUPPORTED.to_string(),
            Arc::new(UnsupportedHandler),
        );

        Self {
            inner: Arc::new(Inner {
                session_id,
                config,
                connections: Mutex::new(HashMap::new()),
                handlers: RwLock::new(handlers),
                next_conn_id: AtomicU64::new(1),
                events,
                shutdown: ShutdownTrigger::new(),
                supervisors: Mutex::new(HashMap::new()),
                heartbeat_started: AtomicBool::new(false),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Bind `addr` and accept peers until shutdown; returns the bound address
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr, ConnectionError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ConnectionError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local = listener.local_addr()?;
        self.ensure_heartbeat();

        let inner = self.inner.clone();
        let shutdown = self.inner.shutdown.listener();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, peer_addr)) => {
                            register_stream(&inner, socket, peer_addr.to_string(), false).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }
            debug!(%local, "Accept loop stopped");
        });

        info!(%local, "Listening for peers");
        Ok(local)
    }

    /// Connect to `endpoint`. With `auto_reconnect`, a supervisor redials
    /// whenever the connection drops.
    pub async fn dial(&self, endpoint: &str, auto_reconnect: bool) -> Result<ConnectionId, ConnectionError> {
        let socket = TcpStream::connect(endpoint)
            .await
            .map_err(|source| ConnectionError::Dial {
                endpoint: endpoint.to_string(),
                source,
            })?;
        self.ensure_heartbeat();

        let id = register_stream(&self.inner, socket, endpoint.to_string(), true).await;
        if auto_reconnect {
            self.spawn_supervisor(endpoint, Some(id)).await;
        }
        Ok(id)
    }

    /// Keep dialing `endpoint` in the background with no live connection yet
    pub async fn reconnect_in_background(&self, endpoint: &str) {
        self.ensure_heartbeat();
        self.spawn_supervisor(endpoint, None).await;
    }

    async fn spawn_supervisor(&self, endpoint: &str, current: Option<ConnectionId>) {
        let stop = ShutdownTrigger::new();
        if let Some(previous) = self
            .inner
            .supervisors
            .lock()
            .await
            .insert(endpoint.to_string(), stop.clone())
        {
            previous.trigger();
        }
        tokio::spawn(supervise(
            self.inner.clone(),
            endpoint.to_string(),
            current,
            stop.listener(),
        ));
    }

    /// Best effort; a failed write closes the connection
    pub async fn send(&self, conn_id: ConnectionId, message: &SyncMessage) -> bool {
        let frame = match encode_frame(message, self.inner.config.max_frame_bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(conn_id, path = %message.path, error = %e, "Cannot encode message");
                return false;
            }
        };
        let writer = {
            let connections = self.inner.connections.lock().await;
            match connections.get(&conn_id) {
                Some(entry) => entry.writer.clone(),
                None => return false,
            }
        };
        deliver(&self.inner, conn_id, &writer, &frame).await
    }

    /// Send to every connection not in `exclude`; returns successful deliveries
    pub async fn broadcast(&self, message: &SyncMessage, exclude: &HashSet<ConnectionId>) -> usize {
        let frame = match encode_frame(message, self.inner.config.max_frame_bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(path = %message.path, error = %e, "Cannot encode broadcast");
                return 0;
            }
        };

        let targets: Vec<_> = {
            let connections = self.inner.connections.lock().await;
            connections
                .values()
                .filter(|entry| !exclude.contains(&entry.id))
                .map(|entry| (entry.id, entry.writer.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (id, writer) in targets {
            if deliver(&self.inner, id, &writer, &frame).await {
                delivered += 1;
            }
        }
        trace!(msg_type = %message.msg_type, delivered, "Broadcast complete");
        delivered
    }

    /// Route frames of `msg_type` to `handler`, replacing any earlier one
    pub async fn register_handler(&self, msg_type: &str, handler: Arc<dyn MessageHandler>) {
        self.inner
            .handlers
            .write()
            .await
            .insert(msg_type.to_string(), handler);
    }

    pub async fn disconnect(&self, conn_id: ConnectionId) -> bool {
        close_connection(&self.inner, conn_id, "requested").await
    }

    /// Stop reconnecting to `endpoint` and close its outbound connections
    pub async fn shutdown_endpoint(&self, endpoint: &str) {
        if let Some(stop) = self.inner.supervisors.lock().await.remove(endpoint) {
            stop.trigger();
        }
        let ids: Vec<_> = {
            let connections = self.inner.connections.lock().await;
            connections
                .values()
                .filter(|entry| entry.outbound && entry.endpoint == endpoint)
                .map(|entry| entry.id)
                .collect()
        };
        for id in ids {
            close_connection(&self.inner, id, "endpoint shut down").await;
        }
    }

    /// Stop every task and close every connection
    pub async fn shutdown(&self) {
        self.inner.shutdown.trigger();
        for (_, stop) in self.inner.supervisors.lock().await.drain() {
            stop.trigger();
        }
        let ids: Vec<_> = self.inner.connections.lock().await.keys().copied().collect();
        for id in ids {
            close_connection(&self.inner, id, "shutdown").await;
        }
        info!("Communication manager stopped");
    }

    pub async fn connections(&self) -> Vec<Connection> {
        let connections = self.inner.connections.lock().await;
        let mut snapshot: Vec<_> = connections.values().map(ConnectionEntry::snapshot).collect();
        snapshot.sort_by_key(|c| c.id);
        snapshot
    }

    pub async fn active_count(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    fn ensure_heartbeat(&self) {
        if self.inner.heartbeat_started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(heartbeat(self.inner.clone(), self.inner.shutdown.listener()));
    }
}

async fn register_stream(
    inner: &Arc<Inner>,
    socket: TcpStream,
    endpoint: String,
    outbound: bool,
) -> ConnectionId {
    if let Err(e) = socket.set_nodelay(true) {
        debug!(error = %e, "Could not set TCP_NODELAY");
    }
    let (reader, writer) = socket.into_split();
    let id = inner.next_conn_id.fetch_add(1, Ordering::SeqCst);
    let entry = ConnectionEntry::new(id, endpoint.clone(), outbound, writer);
    let closed = entry.closer.listener();

    let active = {
        let mut connections = inner.connections.lock().await;
        connections.insert(id, entry);
        connections.len()
    };
    record_gauge(ACTIVE_CONNECTIONS, active as f64);

    tokio::spawn(read_loop(
        inner.clone(),
        id,
        reader,
        closed,
        inner.shutdown.listener(),
    ));

    info!(conn_id = id, %endpoint, outbound, "Connection established");
    // No subscribers is fine
    let _ = inner.events.send(ConnectionEvent::Established {
        id,
        endpoint,
        outbound,
    });
    id
}

async fn read_loop(
    inner: Arc<Inner>,
    id: ConnectionId,
    reader: OwnedReadHalf,
    closed: Shutdown,
    shutdown: Shutdown,
) {
    let mut reader = BufReader::new(reader);
    let max = inner.config.max_frame_bytes;

    let reason = loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break "shutdown",
            _ = closed.cancelled() => break "closed locally",
            frame = read_frame(&mut reader, max) => frame,
        };

        match frame {
            Ok(Some(body)) => match decode_frame(&body) {
                Ok(message) => dispatch(&inner, id, message).await,
                Err(e) => warn!(conn_id = id, error = %e, "Skipping undecodable frame"),
            },
            Ok(None) => break "peer closed",
            Err(e) => {
                debug!(conn_id = id, error = %e, "Read failed");
                break "read error";
            }
        }
    };

    close_connection(&inner, id, reason).await;
}

async fn dispatch(inner: &Arc<Inner>, id: ConnectionId, message: SyncMessage) {
    record_counter(MESSAGES_RECEIVED, 1);

    let connection = {
        let connections = inner.connections.lock().await;
        let Some(entry) = connections.get(&id) else {
            return;
        };
        entry.liveness.touch(&message.session_id);
        entry.snapshot()
    };
    trace!(conn_id = id, msg_type = %message.msg_type, path = %message.path, "Frame received");

    let handler = inner.handlers.read().await.get(&message.msg_type).cloned();
    let response = match handler {
        Some(handler) => handler.handle(&connection, message).await,
        None => Some(unhandled(&inner.session_id, &connection, &message)),
    };

    if let Some(response) = response {
        let writer = {
            let connections = inner.connections.lock().await;
            connections.get(&id).map(|entry| entry.writer.clone())
        };
        let Some(writer) = writer else {
            return;
        };
        match encode_frame(&response, inner.config.max_frame_bytes) {
            Ok(frame) => {
                // The writer may be busy with a large frame; keep reading meanwhile
                let inner = inner.clone();
                tokio::spawn(async move {
                    deliver(&inner, id, &writer, &frame).await;
                });
            }
            Err(e) => warn!(conn_id = id, error = %e, "Cannot encode response"),
        }
    }
}

async fn deliver(
    inner: &Arc<Inner>,
    id: ConnectionId,
    writer: &Arc<Mutex<tokio::net::tcp::OwnedWriteHalf>>,
    frame: &[u8],
) -> bool {
    let limit = inner.config.write_timeout;
    let result = {
        let mut writer = writer.lock().await;
        match tokio::time::timeout(limit, write_frame(&mut *writer, frame)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::WriteStalled(limit)),
        }
    };
    match result {
        Ok(()) => true,
        Err(e) => {
            debug!(conn_id = id, error = %e, "Write failed");
            close_connection(inner, id, "write error").await;
            false
        }
    }
}

/// Remove `id` from the table; returns false if it was already gone
async fn close_connection(inner: &Arc<Inner>, id: ConnectionId, reason: &str) -> bool {
    let (entry, remaining) = {
        let mut connections = inner.connections.lock().await;
        let entry = connections.remove(&id);
        (entry, connections.len())
    };
    let Some(entry) = entry else {
        return false;
    };

    entry.closer.trigger();
    {
        let mut writer = entry.writer.lock().await;
        let _ = writer.shutdown().await;
    }
    record_gauge(ACTIVE_CONNECTIONS, remaining as f64);

    info!(conn_id = id, endpoint = %entry.endpoint, reason, "Connection closed");
    let _ = inner.events.send(ConnectionEvent::Closed {
        id,
        endpoint: entry.endpoint,
    });
    true
}

async fn heartbeat(inner: Arc<Inner>, shutdown: Shutdown) {
    let period = inner.config.heartbeat_interval;
    let limit = period * 2;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let ping = SyncMessage::ping(&inner.session_id);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let (targets, silent): (Vec<_>, Vec<_>) = {
            let connections = inner.connections.lock().await;
            let targets = connections
                .values()
                .map(|entry| (entry.id, entry.writer.clone()))
                .collect();
            let silent = connections
                .values()
                .filter(|entry| entry.liveness.silent_for() > limit)
                .map(|entry| entry.id)
                .collect();
            (targets, silent)
        };

        for id in silent {
            warn!(conn_id = id, limit_ms = limit.as_millis() as u64, "Evicting silent connection");
            close_connection(&inner, id, "heartbeat timeout").await;
        }

        if let Ok(frame) = encode_frame(&ping, inner.config.max_frame_bytes) {
            for (id, writer) in targets {
                if inner.connections.lock().await.contains_key(&id) {
                    deliver(&inner, id, &writer, &frame).await;
                }
            }
        }
    }
    debug!("Heartbeat stopped");
}

async fn supervise(
    inner: Arc<Inner>,
    endpoint: String,
    mut current: Option<ConnectionId>,
    stop: Shutdown,
) {
    let shutdown = inner.shutdown.listener();
    let mut events = inner.events.subscribe();

    loop {
        if let Some(id) = current.take() {
            if inner.connections.lock().await.contains_key(&id) {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = stop.cancelled() => return,
                        event = events.recv() => match event {
                            Ok(ConnectionEvent::Closed { id: closed, .. }) if closed == id => break,
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(_)) => {
                                if !inner.connections.lock().await.contains_key(&id) {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(inner.config.reconnect_interval) => {}
        }

        match TcpStream::connect(&endpoint).await {
            Ok(socket) => {
                if stop.is_triggered() || shutdown.is_triggered() {
                    return;
                }
                info!(%endpoint, "Reconnected");
                current = Some(register_stream(&inner, socket, endpoint.clone(), true).await);
            }
            Err(e) => debug!(%endpoint, error = %e, "Reconnect attempt failed"),
        }
    }
}
