use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use courier_types::events::ServerEvent;

use crate::registry::{ConnectionRegistry, SendOutcome};

/// Routes events to users' live connections.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Push an event to every live connection of a user. Returns how many
    /// connections accepted it; an offline user is a silent 0. Connections
    /// that fail are pruned and do not stop delivery to the others.
    pub async fn send_to_user(&self, user_id: Uuid, event: &ServerEvent) -> usize {
        let connections = self.registry.connections_of(user_id).await;
        if connections.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        let mut dead = Vec::new();
        for conn in &connections {
            match conn.send(event.clone()) {
                SendOutcome::Delivered => delivered += 1,
                SendOutcome::Dead => dead.push(conn.id),
            }
        }

        if !dead.is_empty() {
            let pruned = self.registry.prune(user_id, &dead).await;
            debug!(
                "Pruned {} dead connection(s) of {} while sending {}",
                pruned,
                user_id,
                event.kind()
            );
        }

        delivered
    }

    /// Fan an event out to every member except `exclude`. Returns the total
    /// number of connections reached.
    pub async fn broadcast_to_members(
        &self,
        member_ids: &[Uuid],
        event: &ServerEvent,
        exclude: Option<Uuid>,
    ) -> usize {
        let mut delivered = 0;
        for &uid in member_ids {
            if Some(uid) == exclude {
                continue;
            }
            delivered += self.send_to_user(uid, event).await;
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionHandle;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(ConnectionRegistry::new()))
    }

    fn typing(chat_id: Uuid, user_id: Uuid) -> ServerEvent {
        ServerEvent::Typing { chat_id, user_id }
    }

    #[tokio::test]
    async fn offline_user_is_a_silent_noop() {
        let dispatcher = dispatcher();
        let user = Uuid::new_v4();
        let sent = dispatcher
            .send_to_user(user, &typing(Uuid::new_v4(), Uuid::new_v4()))
            .await;
        assert_eq!(sent, 0);
        assert!(!dispatcher.registry().is_online(user).await);
    }

    #[tokio::test]
    async fn delivers_to_every_device() {
        let dispatcher = dispatcher();
        let user = Uuid::new_v4();
        let (a, mut a_rx) = ConnectionHandle::open();
        let (b, mut b_rx) = ConnectionHandle::open();
        dispatcher.registry().register(user, a).await;
        dispatcher.registry().register(user, b).await;

        let event = typing(Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(dispatcher.send_to_user(user, &event).await, 2);
        assert_eq!(a_rx.try_recv().unwrap(), event);
        assert_eq!(b_rx.try_recv().unwrap(), event);
    }

    #[tokio::test]
    async fn dead_connection_is_pruned_without_blocking_others() {
        let dispatcher = dispatcher();
        let user = Uuid::new_v4();
        let (alive, mut alive_rx) = ConnectionHandle::open();
        let (dead, dead_rx) = ConnectionHandle::open();
        let dead_id = dead.id;
        dispatcher.registry().register(user, alive).await;
        dispatcher.registry().register(user, dead).await;
        drop(dead_rx);

        let event = typing(Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(dispatcher.send_to_user(user, &event).await, 1);
        assert_eq!(alive_rx.try_recv().unwrap(), event);
        assert_eq!(dispatcher.registry().connection_count(user).await, 1);

        // Later cleanup by the dead connection's session is harmless.
        assert!(!dispatcher.registry().unregister(user, dead_id).await);
        assert!(dispatcher.registry().is_online(user).await);
    }

    #[tokio::test]
    async fn broadcast_skips_excluded_member() {
        let dispatcher = dispatcher();
        let (me, other) = (Uuid::new_v4(), Uuid::new_v4());
        let (mine, mut mine_rx) = ConnectionHandle::open();
        let (theirs, mut theirs_rx) = ConnectionHandle::open();
        dispatcher.registry().register(me, mine).await;
        dispatcher.registry().register(other, theirs).await;

        let event = typing(Uuid::new_v4(), me);
        let reached = dispatcher
            .broadcast_to_members(&[me, other, Uuid::new_v4()], &event, Some(me))
            .await;
        assert_eq!(reached, 1);
        assert!(mine_rx.try_recv().is_err());
        assert_eq!(theirs_rx.try_recv().unwrap(), event);
    }

    #[tokio::test]
    async fn same_connection_preserves_call_order() {
        let dispatcher = dispatcher();
        let user = Uuid::new_v4();
        let (conn, mut rx) = ConnectionHandle::open();
        dispatcher.registry().register(user, conn).await;

        let chat_id = Uuid::new_v4();
        let events: Vec<ServerEvent> = (0..5).map(|_| typing(chat_id, Uuid::new_v4())).collect();
        for event in &events {
            dispatcher.send_to_user(user, event).await;
        }
        for expected in events {
            assert_eq!(rx.try_recv().unwrap(), expected);
        }
    }
}
