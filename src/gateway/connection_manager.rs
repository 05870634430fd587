use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

/// What a connection's socket task should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Send this JSON text frame to the client.
    Frame(String),
    /// Send a control ping (emitted by the connection's keepalive loop).
    Ping,
    /// Close the socket with the given reason (superseded, shutdown).
    Close(&'static str),
}

struct ConnectionHandle {
    conn_id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
}

/// Tracks active socket connections keyed by user id (hex).
///
/// At most one live connection per user: registering a second connection for
/// the same user closes the first while the write lock is held, so there is
/// no window in which both are registered. Cheaply cloneable — all clones
/// share the same underlying map via `Arc`.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    connections: Arc<RwLock<HashMap<String, ConnectionHandle>>>,
    next_conn_id: Arc<AtomicU64>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection for the given user and return its
    /// connection id.
    ///
    /// Any previous connection for the same user is told to close before the
    /// new sender is inserted; the lock is held across both steps, and the
    /// channel send is synchronous, so no I/O happens inside the critical
    /// section.
    pub async fn register(&self, user_id: &str, tx: mpsc::UnboundedSender<Outbound>) -> u64 {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let mut conns = self.connections.write().await;
        if let Some(old) = conns.get(user_id) {
            let _ = old.tx.send(Outbound::Close("connection superseded"));
        }
        conns.insert(user_id.to_string(), ConnectionHandle { conn_id, tx });
        conn_id
    }

    /// Remove the connection for the given user, but only if it is still the
    /// one identified by `conn_id`. Returns `true` if an entry was removed.
    ///
    /// The guard matters on forced reconnection: the superseded connection's
    /// cleanup must not evict the replacement that took its slot.
    pub async fn remove(&self, user_id: &str, conn_id: u64) -> bool {
        let mut conns = self.connections.write().await;
        match conns.get(user_id) {
            Some(handle) if handle.conn_id == conn_id => {
                conns.remove(user_id);
                true
            }
            _ => false,
        }
    }

    /// Send a JSON frame to a single user. Returns `true` if a local
    /// connection existed; sends to absent or closed connections are no-ops
    /// (another gateway may hold the user).
    pub async fn send_to_user(&self, user_id: &str, frame: &str) -> bool {
        let conns = self.connections.read().await;
        match conns.get(user_id) {
            Some(handle) => {
                let _ = handle.tx.send(Outbound::Frame(frame.to_owned()));
                true
            }
            None => false,
        }
    }

    /// Send a JSON frame to every locally connected user except `subject`
    /// (presence fan-out never echoes to the user it describes).
    pub async fn broadcast_except(&self, subject: &str, frame: &str) {
        let conns = self.connections.read().await;
        for (user_id, handle) in conns.iter() {
            if user_id != subject {
                let _ = handle.tx.send(Outbound::Frame(frame.to_owned()));
            }
        }
    }

    /// Ask every connection to close and return the affected user ids.
    /// Used on graceful shutdown.
    pub async fn drain(&self, reason: &'static str) -> Vec<String> {
        let mut conns = self.connections.write().await;
        let users: Vec<String> = conns.keys().cloned().collect();
        for handle in conns.values() {
            let _ = handle.tx.send(Outbound::Close(reason));
        }
        conns.clear();
        users
    }

    pub async fn is_connected(&self, user_id: &str) -> bool {
        self.connections.read().await.contains_key(user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_channel() -> (
        mpsc::UnboundedSender<Outbound>,
        mpsc::UnboundedReceiver<Outbound>,
    ) {
        mpsc::unbounded_channel()
    }

    fn user() -> String {
        bson::oid::ObjectId::new().to_hex()
    }

    #[tokio::test]
    async fn register_and_is_connected() {
        let mgr = ConnectionManager::new();
        let uid = user();
        let (tx, _rx) = make_channel();

        assert!(!mgr.is_connected(&uid).await);
        mgr.register(&uid, tx).await;
        assert!(mgr.is_connected(&uid).await);
    }

    #[tokio::test]
    async fn remove_clears_connection() {
        let mgr = ConnectionManager::new();
        let uid = user();
        let (tx, _rx) = make_channel();

        let conn_id = mgr.register(&uid, tx).await;
        assert!(mgr.remove(&uid, conn_id).await);
        assert!(!mgr.is_connected(&uid).await);
    }

    #[tokio::test]
    async fn second_register_force_closes_first() {
        let mgr = ConnectionManager::new();
        let uid = user();
        let (tx1, mut rx1) = make_channel();
        let (tx2, _rx2) = make_channel();

        mgr.register(&uid, tx1).await;
        mgr.register(&uid, tx2).await;

        // The first connection is told to close, and exactly one entry
        // remains in the table.
        assert_eq!(
            rx1.recv().await.unwrap(),
            Outbound::Close("connection superseded")
        );
        assert_eq!(mgr.connection_count().await, 1);
    }

    #[tokio::test]
    async fn superseded_cleanup_does_not_evict_replacement() {
        let mgr = ConnectionManager::new();
        let uid = user();
        let (tx1, _rx1) = make_channel();
        let (tx2, _rx2) = make_channel();

        let old_id = mgr.register(&uid, tx1).await;
        mgr.register(&uid, tx2).await;

        // The old connection's disconnect path runs after the new one is in
        // place; its removal must be a no-op.
        assert!(!mgr.remove(&uid, old_id).await);
        assert!(mgr.is_connected(&uid).await);
    }

    #[tokio::test]
    async fn send_to_user_delivers_frame() {
        let mgr = ConnectionManager::new();
        let uid = user();
        let (tx, mut rx) = make_channel();

        mgr.register(&uid, tx).await;
        assert!(mgr.send_to_user(&uid, "hello").await);

        assert_eq!(rx.recv().await.unwrap(), Outbound::Frame("hello".into()));
    }

    #[tokio::test]
    async fn send_to_disconnected_user_is_noop() {
        let mgr = ConnectionManager::new();
        assert!(!mgr.send_to_user(&user(), "dropped").await);
    }

    #[tokio::test]
    async fn broadcast_except_skips_subject() {
        let mgr = ConnectionManager::new();
        let subject = user();
        let other = user();

        let (tx1, mut rx1) = make_channel();
        let (tx2, mut rx2) = make_channel();
        mgr.register(&subject, tx1).await;
        mgr.register(&other, tx2).await;

        mgr.broadcast_except(&subject, "presence").await;

        assert_eq!(rx2.recv().await.unwrap(), Outbound::Frame("presence".into()));
        assert!(rx1.try_recv().is_err(), "subject must not receive its own presence");
    }

    #[tokio::test]
    async fn drain_closes_everyone_and_empties_table() {
        let mgr = ConnectionManager::new();
        let u1 = user();
        let u2 = user();
        let (tx1, mut rx1) = make_channel();
        let (tx2, mut rx2) = make_channel();

        mgr.register(&u1, tx1).await;
        mgr.register(&u2, tx2).await;

        let mut drained = mgr.drain("server shutting down").await;
        drained.sort();
        let mut expected = vec![u1.clone(), u2.clone()];
        expected.sort();

        assert_eq!(drained, expected);
        assert_eq!(mgr.connection_count().await, 0);
        assert_eq!(
            rx1.recv().await.unwrap(),
            Outbound::Close("server shutting down")
        );
        assert_eq!(
            rx2.recv().await.unwrap(),
            Outbound::Close("server shutting down")
        );
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let mgr = ConnectionManager::new();
        let clone = mgr.clone();
        let uid = user();
        let (tx, _rx) = make_channel();

        mgr.register(&uid, tx).await;
        assert!(clone.is_connected(&uid).await);
    }
}
