use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use teamwire_models::gateway::EVENT_PRESENCE_UPDATE;
use teamwire_models::presence::{PresenceStatus, PresenceUpdate};
use teamwire_models::{ConnectionId, UserId};
use teamwire_util::snowflake::Snowflake;

use crate::error::CoreError;
use crate::events::{EventBus, EventSink, ServerEvent};

/// Who is making a request: one live connection of one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Caller {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
}

/// A live, authenticated gateway connection. Owned by the registry; dropping the
/// registry's handle closes the outbound stream.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub connected_at: DateTime<Utc>,
    sink: EventSink,
}

impl Connection {
    pub fn caller(&self) -> Caller {
        Caller {
            connection_id: self.id,
            user_id: self.user_id,
        }
    }

    /// Queue an event for delivery. Returns false once the gateway task has gone away.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.sink.send(event).is_ok()
    }
}

#[derive(Debug)]
struct UserPresence {
    connections: HashSet<ConnectionId>,
    status: PresenceStatus,
}

/// Live connections per user and the presence derived from them.
///
/// The user's entry guard is the per-user critical section: the connection set and
/// the status change together, and presence events are emitted before the guard is
/// released so that edges are announced in the order they happened.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    users: DashMap<UserId, UserPresence>,
    ids: Arc<Snowflake>,
    bus: EventBus,
    max_connections_per_user: usize,
}

impl ConnectionRegistry {
    pub fn new(ids: Arc<Snowflake>, bus: EventBus, max_connections_per_user: usize) -> Self {
        Self {
            connections: DashMap::new(),
            users: DashMap::new(),
            ids,
            bus,
            max_connections_per_user: max_connections_per_user.max(1),
        }
    }

    /// Add a connection for an already-verified user.
    pub fn register(&self, user_id: UserId, sink: EventSink) -> Result<Arc<Connection>, CoreError> {
        let mut user = self.users.entry(user_id).or_insert_with(|| UserPresence {
            connections: HashSet::new(),
            status: PresenceStatus::Offline,
        });
        if user.connections.len() >= self.max_connections_per_user {
            return Err(CoreError::Conflict(format!(
                "user {user_id} already has {} connections",
                user.connections.len()
            )));
        }

        let connection = Arc::new(Connection {
            id: self.ids.next_id(),
            user_id,
            connected_at: Utc::now(),
            sink,
        });
        self.connections.insert(connection.id, connection.clone());
        user.connections.insert(connection.id);

        if user.connections.len() == 1 {
            user.status = PresenceStatus::Online;
            self.emit_presence(user_id, PresenceStatus::Online);
        }
        tracing::debug!(user_id, connection_id = connection.id, sessions = user.connections.len(), "connection registered");
        Ok(connection)
    }

    /// Remove a connection. Returns it if it was still registered.
    pub fn deregister(&self, connection_id: ConnectionId) -> Option<Arc<Connection>> {
        let (_, connection) = self.connections.remove(&connection_id)?;
        let user_id = connection.user_id;

        let went_offline = match self.users.get_mut(&user_id) {
            Some(mut user) => {
                user.connections.remove(&connection_id);
                if user.connections.is_empty() && user.status != PresenceStatus::Offline {
                    user.status = PresenceStatus::Offline;
                    self.emit_presence(user_id, PresenceStatus::Offline);
                    true
                } else {
                    false
                }
            }
            None => false,
        };

        if went_offline {
            self.users
                .remove_if(&user_id, |_, user| user.connections.is_empty());
        }
        tracing::debug!(user_id, connection_id, went_offline, "connection deregistered");
        Some(connection)
    }

    /// Change an online user's status. `offline` is derived, never set.
    pub fn set_status(&self, user_id: UserId, status: PresenceStatus) -> Result<(), CoreError> {
        if status == PresenceStatus::Offline {
            return Err(CoreError::State(
                "offline is derived from having no connections".into(),
            ));
        }
        let mut user = self
            .users
            .get_mut(&user_id)
            .filter(|user| !user.connections.is_empty())
            .ok_or_else(|| CoreError::State(format!("user {user_id} is not online")))?;
        if user.status != status {
            user.status = status;
            self.emit_presence(user_id, status);
        }
        Ok(())
    }

    pub fn snapshot(&self, user_id: UserId) -> HashSet<ConnectionId> {
        self.users
            .get(&user_id)
            .map(|user| user.connections.clone())
            .unwrap_or_default()
    }

    pub fn presence(&self, user_id: UserId) -> PresenceStatus {
        self.users
            .get(&user_id)
            .map(|user| user.status)
            .unwrap_or(PresenceStatus::Offline)
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&connection_id).map(|c| c.clone())
    }

    pub fn is_live(&self, connection_id: ConnectionId) -> bool {
        self.connections.contains_key(&connection_id)
    }

    /// Deliver to one connection. Silently drops events for connections that are gone.
    pub fn send_to(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        match self.connections.get(&connection_id) {
            Some(connection) => connection.send(event),
            None => false,
        }
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|c| *c.key()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of users with at least one connection.
    pub fn user_count(&self) -> usize {
        self.users
            .iter()
            .filter(|user| !user.connections.is_empty())
            .count()
    }

    fn emit_presence(&self, user_id: UserId, status: PresenceStatus) {
        let payload = PresenceUpdate { user_id, status };
        match serde_json::to_value(&payload) {
            Ok(value) => self.bus.dispatch(EVENT_PRESENCE_UPDATE, value),
            Err(e) => tracing::error!(user_id, "failed to encode presence update: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use tokio::sync::broadcast::error::TryRecvError;

    fn registry(cap: usize) -> (ConnectionRegistry, tokio::sync::broadcast::Receiver<ServerEvent>) {
        let bus = EventBus::new(64);
        let rx = bus.subscribe();
        (ConnectionRegistry::new(Arc::new(Snowflake::new(1)), bus, cap), rx)
    }

    fn statuses(rx: &mut tokio::sync::broadcast::Receiver<ServerEvent>) -> Vec<String> {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => out.push(event.payload["status"].as_str().unwrap_or("").to_string()),
                Err(TryRecvError::Empty) => return out,
                Err(e) => panic!("unexpected bus error: {e}"),
            }
        }
    }

    #[test]
    fn first_connection_goes_online_once() {
        let (registry, mut rx) = registry(5);
        let (a, _a_rx) = event_channel();
        let (b, _b_rx) = event_channel();
        let c1 = registry.register(7, a).unwrap();
        let c2 = registry.register(7, b).unwrap();
        assert_ne!(c1.id, c2.id);
        assert_eq!(registry.presence(7), PresenceStatus::Online);
        assert_eq!(registry.snapshot(7).len(), 2);
        assert_eq!(statuses(&mut rx), vec!["online"]);
    }

    #[test]
    fn last_disconnect_goes_offline_once() {
        let (registry, mut rx) = registry(5);
        let (a, _a_rx) = event_channel();
        let (b, _b_rx) = event_channel();
        let c1 = registry.register(7, a).unwrap();
        let c2 = registry.register(7, b).unwrap();
        registry.deregister(c1.id).unwrap();
        assert_eq!(registry.presence(7), PresenceStatus::Online);
        registry.deregister(c2.id).unwrap();
        assert_eq!(registry.presence(7), PresenceStatus::Offline);
        assert!(registry.deregister(c2.id).is_none());
        assert_eq!(statuses(&mut rx), vec!["online", "offline"]);
        assert_eq!(registry.user_count(), 0);
    }

    #[test]
    fn connection_cap_rejects_newest() {
        let (registry, _rx) = registry(1);
        let (a, _a_rx) = event_channel();
        let (b, _b_rx) = event_channel();
        registry.register(7, a).unwrap();
        assert!(matches!(registry.register(7, b), Err(CoreError::Conflict(_))));
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn status_changes_only_while_online() {
        let (registry, mut rx) = registry(5);
        assert!(matches!(
            registry.set_status(7, PresenceStatus::Dnd),
            Err(CoreError::State(_))
        ));
        let (a, _a_rx) = event_channel();
        registry.register(7, a).unwrap();
        registry.set_status(7, PresenceStatus::Dnd).unwrap();
        registry.set_status(7, PresenceStatus::Dnd).unwrap();
        assert!(registry.set_status(7, PresenceStatus::Offline).is_err());
        assert_eq!(registry.presence(7), PresenceStatus::Dnd);
        assert_eq!(statuses(&mut rx), vec!["online", "dnd"]);
    }

    #[test]
    fn dropped_registry_handle_closes_stream() {
        let (registry, _rx) = registry(5);
        let (a, mut a_rx) = event_channel();
        let conn = registry.register(7, a).unwrap();
        let id = conn.id;
        drop(conn);
        assert!(registry.send_to(id, ServerEvent::direct("ack", serde_json::json!({}))));
        registry.deregister(id);
        assert!(a_rx.try_recv().is_ok());
        assert!(matches!(
            a_rx.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
