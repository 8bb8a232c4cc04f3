//! Process-wide table of connected clients and the vehicles they own
//!
//! This module holds the server-side view of every live connection:
//! - Client identity derived from the remote address
//! - The ordered list of vehicle handles each client owns
//! - The last device telemetry payload each client pushed
//! - Whether the client is already on its way out
//!
//! The registry carries no business logic. It only guarantees that every
//! insert, removal, per-entry update and iteration is serialized against the
//! others, so sessions, the cleanup coordinator, the control surface and the
//! resource monitor can all share one instance.

use crate::backend::ActorId;
use crate::session::Connection;
use serde_json::Value;
use shared::ControlMode;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Identity of one client connection, derived from its remote address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(SocketAddr);

impl ClientId {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ClientId {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(ClientId)
    }
}

/// A simulation actor owned by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VehicleHandle {
    pub actor: ActorId,
    pub control_mode: ControlMode,
}

impl VehicleHandle {
    pub fn autopilot(actor: ActorId) -> Self {
        Self {
            actor,
            control_mode: ControlMode::Autopilot,
        }
    }
}

/// Server-side state for one live connection.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub client: ClientId,
    pub connection: Arc<Connection>,
    /// Owned vehicles in spawn order.
    pub vehicles: Vec<VehicleHandle>,
    /// Last `send_device_info` payload, stored verbatim.
    pub device_info: Option<Value>,
    /// Set once a forced disconnect has been scheduled.
    pub closing: bool,
    pub connected_at: Instant,
}

impl SessionRecord {
    pub fn new(client: ClientId, connection: Arc<Connection>) -> Self {
        Self {
            client,
            connection,
            vehicles: Vec::new(),
            device_info: None,
            closing: false,
            connected_at: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct FleetRegistry {
    sessions: RwLock<HashMap<ClientId, SessionRecord>>,
}

impl FleetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record, returning the one it replaced.
    pub async fn put(&self, record: SessionRecord) -> Option<SessionRecord> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(record.client, record)
    }

    /// Returns a snapshot of one record.
    pub async fn get(&self, client: &ClientId) -> Option<SessionRecord> {
        let sessions = self.sessions.read().await;
        sessions.get(client).cloned()
    }

    /// Removes a record. Removing an absent client is a no-op.
    pub async fn remove(&self, client: &ClientId) -> Option<SessionRecord> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(client)
    }

    /// Removes a record only while it still belongs to `connection`. A newer
    /// session registered under the same client id is left alone.
    pub async fn remove_connection(
        &self,
        client: &ClientId,
        connection: &Arc<Connection>,
    ) -> Option<SessionRecord> {
        let mut sessions = self.sessions.write().await;
        let current = sessions
            .get(client)
            .is_some_and(|record| Arc::ptr_eq(&record.connection, connection));
        if current {
            sessions.remove(client)
        } else {
            None
        }
    }

    /// Visits every record under one read lock.
    pub async fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&ClientId, &SessionRecord),
    {
        let sessions = self.sessions.read().await;
        for (client, record) in sessions.iter() {
            visit(client, record);
        }
    }

    /// Applies `change` to one record atomically. Returns `None` if the client
    /// is not registered.
    pub async fn update<T, F>(&self, client: &ClientId, change: F) -> Option<T>
    where
        F: FnOnce(&mut SessionRecord) -> T,
    {
        let mut sessions = self.sessions.write().await;
        sessions.get_mut(client).map(change)
    }

    /// Offers each record to `search` under one write lock and stops at the
    /// first `Some`.
    pub async fn find_map<T, F>(&self, mut search: F) -> Option<T>
    where
        F: FnMut(&mut SessionRecord) -> Option<T>,
    {
        let mut sessions = self.sessions.write().await;
        sessions.values_mut().find_map(|record| search(record))
    }

    pub async fn client_ids(&self) -> Vec<ClientId> {
        let sessions = self.sessions.read().await;
        let mut ids: Vec<ClientId> = sessions.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn vehicle_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.values().map(|record| record.vehicles.len()).sum()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
