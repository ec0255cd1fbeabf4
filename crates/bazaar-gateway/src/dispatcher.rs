use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use bazaar_types::events::GatewayEvent;

/// Owns the live connection registry and the chat-room membership map.
/// Created once at process start, injected into every connection handler and
/// REST state; torn down with the process. Rooms are ephemeral: membership
/// lives only as long as the underlying connections.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// conn_id -> outbound event channel for that socket
    connections: RwLock<HashMap<Uuid, mpsc::UnboundedSender<GatewayEvent>>>,

    /// chat_id -> connections currently joined to the chat's room
    rooms: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                connections: RwLock::new(HashMap::new()),
                rooms: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a connection. Returns its id and the receiving half of its
    /// outbound channel.
    pub async fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.connections.write().await.insert(conn_id, tx);
        (conn_id, rx)
    }

    /// Drop a connection and every room membership it held.
    pub async fn unregister(&self, conn_id: Uuid) {
        self.inner.connections.write().await.remove(&conn_id);
        let mut rooms = self.inner.rooms.write().await;
        rooms.retain(|_, members| {
            members.remove(&conn_id);
            !members.is_empty()
        });
    }

    /// Add a connection to a chat's room. The caller has already checked the
    /// connection's user is a participant of the chat.
    pub async fn join_room(&self, chat_id: Uuid, conn_id: Uuid) {
        self.inner
            .rooms
            .write()
            .await
            .entry(chat_id)
            .or_default()
            .insert(conn_id);
    }

    /// Targeted event to one connection (acks, rejections).
    pub async fn send_to_conn(&self, conn_id: Uuid, event: GatewayEvent) {
        if let Some(tx) = self.inner.connections.read().await.get(&conn_id) {
            let _ = tx.send(event);
        }
    }

    /// Fan an event out to every connection joined to the chat's room,
    /// the originator included. Closed receivers are skipped.
    pub async fn send_to_room(&self, chat_id: Uuid, event: GatewayEvent) {
        let rooms = self.inner.rooms.read().await;
        let Some(members) = rooms.get(&chat_id) else {
            return;
        };
        let connections = self.inner.connections.read().await;
        for conn_id in members {
            if let Some(tx) = connections.get(conn_id) {
                let _ = tx.send(event.clone());
            }
        }
    }

    pub async fn room_size(&self, chat_id: Uuid) -> usize {
        self.inner
            .rooms
            .read()
            .await
            .get(&chat_id)
            .map_or(0, HashSet::len)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
