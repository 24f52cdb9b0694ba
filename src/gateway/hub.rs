//! Connection hub: multiplexes every websocket of every user.
//!
//! Stream events go to connections subscribed to the stream's conversation;
//! `pending` goes to every connection of the owning user, whatever they view.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::ServerEvent;

/// Size of the per-connection send buffer.
const CONNECTION_BUFFER_SIZE: usize = 256;

pub type ConnectionId = u64;

struct Connection {
    user_id: String,
    tx: mpsc::Sender<ServerEvent>,
    subscriptions: HashSet<String>,
}

pub struct Hub {
    connections: DashMap<ConnectionId, Connection>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a connection for `user_id` and returns its id plus the
    /// receiver the socket writer drains.
    pub fn register_connection(&self, user_id: &str) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections.insert(
            conn_id,
            Connection {
                user_id: user_id.to_string(),
                tx,
                subscriptions: HashSet::new(),
            },
        );
        info!("Registered connection {conn_id} for user {user_id}");
        (conn_id, rx)
    }

    pub fn unregister_connection(&self, conn_id: ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(&conn_id) {
            info!("Unregistered connection {conn_id} for user {}", conn.user_id);
        }
    }

    pub fn subscribe(&self, conn_id: ConnectionId, conversation_id: &str) {
        if let Some(mut conn) = self.connections.get_mut(&conn_id) {
            if conn.subscriptions.insert(conversation_id.to_string()) {
                debug!("Connection {conn_id} subscribed to conversation {conversation_id}");
            }
        }
    }

    #[cfg(test)]
    pub fn is_subscribed(&self, conn_id: ConnectionId, conversation_id: &str) -> bool {
        self.connections
            .get(&conn_id)
            .is_some_and(|conn| conn.subscriptions.contains(conversation_id))
    }

    #[cfg(test)]
    pub fn connection_count(&self, user_id: &str) -> usize {
        self.connections
            .iter()
            .filter(|conn| conn.user_id == user_id)
            .count()
    }

    /// Sends an event to one connection.
    pub async fn send_to(&self, conn_id: ConnectionId, event: ServerEvent) {
        let tx = self.connections.get(&conn_id).map(|conn| conn.tx.clone());
        if let Some(tx) = tx {
            if tx.send(event).await.is_err() {
                warn!("Failed to send event to connection {conn_id}");
            }
        }
    }

    /// Sends an event to every connection subscribed to `conversation_id`.
    pub async fn send_to_subscribers(&self, conversation_id: &str, event: ServerEvent) {
        let targets = self.senders(|conn| conn.subscriptions.contains(conversation_id));
        Self::deliver(targets, event).await;
    }

    /// Sends an event to every connection of `user_id`.
    pub async fn send_to_user(&self, user_id: &str, event: ServerEvent) {
        let targets = self.senders(|conn| conn.user_id == user_id);
        Self::deliver(targets, event).await;
    }

    pub async fn broadcast_pending(&self, user_id: &str, conversation_id: &str, pending: bool) {
        self.send_to_user(
            user_id,
            ServerEvent::Pending {
                conversation_id: conversation_id.to_string(),
                pending,
            },
        )
        .await;
    }

    // Senders are cloned out first so no map shard stays locked across an await.
    fn senders(
        &self,
        filter: impl Fn(&Connection) -> bool,
    ) -> Vec<(ConnectionId, mpsc::Sender<ServerEvent>)> {
        self.connections
            .iter()
            .filter(|conn| filter(conn.value()))
            .map(|conn| (*conn.key(), conn.tx.clone()))
            .collect()
    }

    async fn deliver(targets: Vec<(ConnectionId, mpsc::Sender<ServerEvent>)>, event: ServerEvent) {
        for (conn_id, tx) in targets {
            if tx.send(event.clone()).await.is_err() {
                warn!("Failed to send event to connection {conn_id}");
            }
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
