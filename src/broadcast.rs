//! Fan-out of progress events to connected clients, keyed by user.
//!
//! Delivery is fire-and-forget: no backpressure, no acknowledgment, and a
//! dropped event is fine as long as the terminal state eventually arrives.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::job::JobStatus;

/// One row of a `job_updates` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobUpdate {
    pub job_id: i64,
    pub status: JobStatus,
    pub current: u64,
    pub total: u64,
    pub percent: u8,
}

/// Everything the server pushes to a browser, in wire shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    JobUpdates {
        updates: Vec<JobUpdate>,
    },
    JobCompletion {
        status: &'static str,
    },
    TransferProgress {
        progress: i64,
        current_file: Option<String>,
        bytes_transferred: Option<u64>,
        total_bytes: Option<u64>,
        estimated_time_remaining: Option<u64>,
        error: Option<String>,
    },
}

impl Event {
    pub fn completion() -> Self {
        Event::JobCompletion { status: "SUCCESS" }
    }
}

struct ClientConnection {
    id: Uuid,
    tx: mpsc::UnboundedSender<Event>,
}

/// Registry of live client connections per user.
///
/// Registration changes may race an in-flight broadcast; the registry lock
/// only guards the connection set, never the sends themselves.
pub struct Broadcaster {
    connections: RwLock<HashMap<i64, Vec<ClientConnection>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Broadcaster {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a new connection for a user. The returned receiver yields
    /// every event broadcast to that user from this moment forward.
    pub fn register(&self, user_id: i64) -> (Uuid, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.connections
            .write()
            .entry(user_id)
            .or_default()
            .push(ClientConnection { id, tx });
        debug!(user = user_id, conn = %id, "client registered");
        (id, rx)
    }

    /// Detach a connection. Unregistering twice is a no-op.
    pub fn unregister(&self, user_id: i64, conn_id: Uuid) {
        let mut connections = self.connections.write();
        if let Some(list) = connections.get_mut(&user_id) {
            list.retain(|c| c.id != conn_id);
            if list.is_empty() {
                connections.remove(&user_id);
            }
        }
    }

    /// Send an event to every connection registered for a user. A user with
    /// no connections is a no-op. Dead connections are pruned as they are
    /// discovered.
    pub fn broadcast_to_user(&self, user_id: i64, event: Event) {
        let mut connections = self.connections.write();
        if let Some(list) = connections.get_mut(&user_id) {
            list.retain(|c| c.tx.send(event.clone()).is_ok());
            if list.is_empty() {
                connections.remove(&user_id);
            }
        }
    }

    #[cfg(test)]
    fn connection_count(&self, user_id: i64) -> usize {
        self.connections
            .read()
            .get(&user_id)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}
