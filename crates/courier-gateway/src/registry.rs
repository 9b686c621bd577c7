use std::collections::{HashMap, HashSet};
use std::fmt;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use courier_types::events::ServerEvent;

/// Identity of one live connection, minted per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Result of pushing one event into one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// The receiving half is gone; the connection should be pruned.
    Dead,
}

/// Routing handle for a connection. The session owns the receiving half
/// and drains it to the socket in order; the registry only keeps this.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    sender: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnectionHandle {
    /// Create a handle together with the receiver its session will drain.
    pub fn open() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (sender, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: ConnectionId::new(),
                sender,
            },
            rx,
        )
    }

    pub fn send(&self, event: ServerEvent) -> SendOutcome {
        match self.sender.send(event) {
            Ok(()) => SendOutcome::Delivered,
            Err(_) => SendOutcome::Dead,
        }
    }
}

/// Live mapping of user -> connections. Single process, in memory.
///
/// All mutations take the write lock; critical sections never await or do
/// I/O, so the lock is only held for map updates.
#[derive(Default)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    users: HashMap<Uuid, HashMap<ConnectionId, ConnectionHandle>>,
    /// Users whose last connection was pruned after a failed send. The
    /// owning session's `unregister` claims the offline transition.
    pruned_offline: HashSet<Uuid>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Returns true if this is the user's first live
    /// connection (0 -> 1).
    ///
    /// Also clears a pending offline mark left by `prune`. A user whose only
    /// connection was pruned and who reconnects before the old session
    /// detaches is reported online again with no offline in between.
    pub async fn register(&self, user_id: Uuid, handle: ConnectionHandle) -> bool {
        let mut state = self.state.write().await;
        state.pruned_offline.remove(&user_id);
        let connections = state.users.entry(user_id).or_default();
        let first = connections.is_empty();
        connections.insert(handle.id, handle);
        first
    }

    /// Remove a connection. Returns true if the user has just gone
    /// offline (1 -> 0). Removing an unknown connection is a no-op, unless
    /// a failed send already emptied the user's set, in which case this
    /// call reports that transition exactly once.
    pub async fn unregister(&self, user_id: Uuid, conn_id: ConnectionId) -> bool {
        let mut state = self.state.write().await;

        if let Some(connections) = state.users.get_mut(&user_id) {
            if connections.remove(&conn_id).is_none() {
                return false;
            }
            if connections.is_empty() {
                state.users.remove(&user_id);
                return true;
            }
            return false;
        }

        state.pruned_offline.remove(&user_id)
    }

    /// Drop connections whose sends failed. Returns how many were removed.
    pub async fn prune(&self, user_id: Uuid, dead: &[ConnectionId]) -> usize {
        let mut state = self.state.write().await;
        let Some(connections) = state.users.get_mut(&user_id) else {
            return 0;
        };

        let removed = dead
            .iter()
            .filter(|id| connections.remove(id).is_some())
            .count();

        if removed > 0 && connections.is_empty() {
            state.users.remove(&user_id);
            state.pruned_offline.insert(user_id);
        }
        removed
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.state
            .read()
            .await
            .users
            .get(&user_id)
            .is_some_and(|c| !c.is_empty())
    }

    /// Snapshot of a user's connections, safe to iterate while other
    /// sessions register and unregister.
    pub async fn connections_of(&self, user_id: Uuid) -> Vec<ConnectionHandle> {
        self.state
            .read()
            .await
            .users
            .get(&user_id)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn connection_count(&self, user_id: Uuid) -> usize {
        self.state
            .read()
            .await
            .users
            .get(&user_id)
            .map_or(0, |c| c.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn presence_transitions_only_on_first_and_last() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let (phone, _phone_rx) = ConnectionHandle::open();
        let (laptop, _laptop_rx) = ConnectionHandle::open();
        let (phone_id, laptop_id) = (phone.id, laptop.id);

        assert!(!registry.is_online(user).await);
        assert!(registry.register(user, phone).await);
        assert!(!registry.register(user, laptop).await);
        assert!(registry.is_online(user).await);
        assert_eq!(registry.connection_count(user).await, 2);

        assert!(!registry.unregister(user, phone_id).await);
        assert!(registry.is_online(user).await);

        assert!(registry.unregister(user, laptop_id).await);
        assert!(!registry.is_online(user).await);
        assert!(registry.connections_of(user).await.is_empty());
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let (conn, _rx) = ConnectionHandle::open();
        let id = conn.id;

        registry.register(user, conn).await;
        assert!(registry.unregister(user, id).await);
        assert!(!registry.unregister(user, id).await);
        assert!(!registry.unregister(Uuid::new_v4(), ConnectionId::new()).await);
        assert!(!registry.is_online(user).await);
    }

    #[tokio::test]
    async fn is_online_tracks_interleaved_sequences() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let mut live = Vec::new();
        let mut receivers = Vec::new();

        // register, register, drop one, register, drop all
        for step in [true, true, false, true, false, false, false] {
            if step {
                let (conn, rx) = ConnectionHandle::open();
                live.push(conn.id);
                receivers.push(rx);
                registry.register(user, conn).await;
            } else if let Some(id) = live.pop() {
                registry.unregister(user, id).await;
            }
            assert_eq!(registry.is_online(user).await, !live.is_empty());
            assert_eq!(registry.connection_count(user).await, live.len());
        }
    }

    #[tokio::test]
    async fn pruned_last_connection_reports_offline_once() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let (a, _a_rx) = ConnectionHandle::open();
        let (b, _b_rx) = ConnectionHandle::open();
        let (a_id, b_id) = (a.id, b.id);
        registry.register(user, a).await;
        registry.register(user, b).await;

        assert_eq!(registry.prune(user, &[a_id, b_id]).await, 2);
        assert!(!registry.is_online(user).await);

        // First owning session to clean up claims the transition.
        assert!(registry.unregister(user, a_id).await);
        assert!(!registry.unregister(user, b_id).await);
    }

    #[tokio::test]
    async fn reconnect_clears_pending_offline() {
        let registry = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let (old, _old_rx) = ConnectionHandle::open();
        let old_id = old.id;
        registry.register(user, old).await;
        registry.prune(user, &[old_id]).await;

        let (fresh, _fresh_rx) = ConnectionHandle::open();
        assert!(registry.register(user, fresh).await);

        // The stale session's cleanup must not flip the user offline.
        assert!(!registry.unregister(user, old_id).await);
        assert!(registry.is_online(user).await);
    }

    #[test]
    fn send_reports_dead_receiver() {
        let (conn, rx) = ConnectionHandle::open();
        let user_id = Uuid::new_v4();
        let event = ServerEvent::Presence {
            user_id,
            online: true,
        };
        assert_eq!(conn.send(event.clone()), SendOutcome::Delivered);
        drop(rx);
        assert_eq!(conn.send(event), SendOutcome::Dead);
    }
}
