use async_trait::async_trait;
use hashlink::LinkedHashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::trace;

use crate::core_comms::{Connection, ConnectionId, MessageHandler};
use crate::core_sync::SyncMessage;

/// Inbound changes waiting for the sync worker, at most one per path.
///
/// Pushing never waits, so a connection's read loop keeps draining its socket
/// however far behind the worker is.
#[derive(Clone, Default)]
pub(crate) struct Inbox {
    pending: Arc<Mutex<LinkedHashMap<String, (ConnectionId, SyncMessage)>>>,
    ready: Arc<Notify>,
}

impl Inbox {
    fn pending(&self) -> MutexGuard<'_, LinkedHashMap<String, (ConnectionId, SyncMessage)>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Keep `message` unless an equally new one for the path is already waiting
    pub fn push(&self, conn_id: ConnectionId, message: SyncMessage) {
        {
            let mut pending = self.pending();
            if let Some((_, waiting)) = pending.get(&message.path) {
                if waiting.timestamp > message.timestamp {
                    trace!(path = %message.path, conn_id, "Older inbound change dropped");
                    return;
                }
            }
            // Re-inserting moves the path to the back, behind earlier arrivals
            pending.remove(&message.path);
            pending.insert(message.path.clone(), (conn_id, message));
        }
        self.ready.notify_one();
    }

    /// Everything waiting, in arrival order
    pub fn take(&self) -> Vec<(ConnectionId, SyncMessage)> {
        let mut pending = self.pending();
        let mut taken = Vec::with_capacity(pending.len());
        while let Some((_, entry)) = pending.pop_front() {
            taken.push(entry);
        }
        taken
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub async fn ready(&self) {
        self.ready.notified().await
    }
}

/// Hands `file_sync` and `file_delete` messages to the sync worker's inbox
pub(crate) struct InboundHandler {
    inbox: Inbox,
}

impl InboundHandler {
    pub fn new(inbox: Inbox) -> Self {
        Self { inbox }
    }
}

#[async_trait]
impl MessageHandler for InboundHandler {
    async fn handle(&self, connection: &Connection, message: SyncMessage) -> Option<SyncMessage> {
        self.inbox.push(connection.id, message);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_sync::SyncRecord;
    use std::collections::HashMap;
    use std::time::Duration;

    fn connection(id: u64) -> Connection {
        Connection {
            id,
            endpoint: "127.0.0.1:1".to_string(),
            established_at: std::time::SystemTime::now(),
            last_heartbeat_at: std::time::SystemTime::now(),
            is_active: true,
            outbound: false,
            session_metadata: HashMap::new(),
        }
    }

    fn change(path: &str, ts: f64) -> SyncMessage {
        let record = SyncRecord::new(path, "h", ts, "peer", 1);
        SyncMessage::file_sync(&record, b"x")
    }

    #[tokio::test]
    async fn test_forwards_to_inbox() {
        let inbox = Inbox::default();
        let handler = InboundHandler::new(inbox.clone());

        let reply = handler.handle(&connection(7), change("a.txt", 1.0)).await;
        assert!(reply.is_none());

        tokio::time::timeout(Duration::from_secs(1), inbox.ready())
            .await
            .unwrap();
        let taken = inbox.take();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].0, 7);
        assert_eq!(taken[0].1.path, "a.txt");
        assert_eq!(inbox.len(), 0);
    }

    #[tokio::test]
    async fn test_never_waits_on_a_busy_worker() {
        let inbox = Inbox::default();
        let handler = InboundHandler::new(inbox.clone());

        // Nobody is taking; every push still returns at once
        let pushes = async {
            for i in 0..10_000 {
                handler
                    .handle(&connection(1), change(&format!("f{}.txt", i), 1.0))
                    .await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), pushes)
            .await
            .unwrap();
        assert_eq!(inbox.len(), 10_000);
    }

    #[test]
    fn test_keeps_newest_change_per_path() {
        let inbox = Inbox::default();
        inbox.push(1, change("a.txt", 5.0));
        inbox.push(1, change("b.txt", 1.0));
        // Older state for a waiting path is dropped
        inbox.push(2, change("a.txt", 4.0));
        assert_eq!(inbox.len(), 2);

        inbox.push(2, change("a.txt", 6.0));
        let taken = inbox.take();
        let order: Vec<_> = taken
            .iter()
            .map(|(id, m)| (*id, m.path.as_str(), m.timestamp))
            .collect();
        assert_eq!(order, vec![(1, "b.txt", 1.0), (2, "a.txt", 6.0)]);
    }
}
