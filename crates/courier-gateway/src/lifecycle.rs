//! Delivery-status lifecycle: sent -> delivered -> read.
//!
//! Status only moves forward. Every transition that changes what the sender
//! should see is followed by a `status_update` to the sender's connections.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;
use uuid::Uuid;

use courier_db::Database;
use courier_types::events::ServerEvent;
use courier_types::models::{MessageOut, MessageStatus};

use crate::dispatcher::Dispatcher;
use crate::store::run_blocking;

#[derive(Clone)]
pub struct MessageLifecycle {
    db: Arc<Database>,
    dispatcher: Dispatcher,
}

impl MessageLifecycle {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    /// Fan a freshly persisted message out to every member (the sender
    /// included, for their other devices), then run the sent -> delivered
    /// check. Returns the message with its status after the check.
    pub async fn publish_new(&self, mut message: MessageOut, member_ids: &[Uuid]) -> Result<MessageOut> {
        let event = ServerEvent::NewMessage {
            message: message.clone(),
        };

        let mut reached_recipient = false;
        for &uid in member_ids {
            let delivered = self.dispatcher.send_to_user(uid, &event).await;
            if Some(uid) != message.sender_id && delivered > 0 {
                reached_recipient = true;
            }
        }

        if reached_recipient && self.advance(message.id, MessageStatus::Delivered).await? {
            message.status = MessageStatus::Delivered;
            self.notify_sender(&message, MessageStatus::Delivered).await;
        }

        Ok(message)
    }

    /// Handle a read acknowledgement from `reader`. Returns `None` if the
    /// message does not exist in that chat.
    ///
    /// Only recipients can mark a message read: an ack from the message's
    /// own sender writes no receipt and leaves the status alone.
    pub async fn mark_read(&self, reader: Uuid, chat_id: Uuid, message_id: Uuid) -> Result<Option<MessageOut>> {
        let Some(message) = self.load(chat_id, message_id).await? else {
            debug!("Read ack for unknown message {} in chat {}", message_id, chat_id);
            return Ok(None);
        };

        if message.sender_id == Some(reader) {
            return Ok(Some(message));
        }

        let message = run_blocking(&self.db, move |db| {
            db.ensure_read_receipt(message_id, reader)?;
            db.advance_message_status(message_id, MessageStatus::Read)?;
            Ok(db.get_message(message_id)?.map(|row| row.into_out()))
        })
        .await?;

        let Some(message) = message else {
            // Deleted between the lookup and the update.
            return Ok(None);
        };

        self.notify_sender(&message, MessageStatus::Read).await;
        Ok(Some(message))
    }

    /// Status change requested outside the live protocol. `read` behaves
    /// exactly like a read ack; `delivered` only advances a `sent` message
    /// and creates no receipt; `sent` never regresses anything.
    pub async fn set_status(
        &self,
        actor: Uuid,
        chat_id: Uuid,
        message_id: Uuid,
        status: MessageStatus,
    ) -> Result<Option<MessageOut>> {
        match status {
            MessageStatus::Read => self.mark_read(actor, chat_id, message_id).await,
            MessageStatus::Delivered => {
                let Some(mut message) = self.load(chat_id, message_id).await? else {
                    return Ok(None);
                };
                if self.advance(message_id, MessageStatus::Delivered).await? {
                    message.status = MessageStatus::Delivered;
                    self.notify_sender(&message, MessageStatus::Delivered).await;
                }
                Ok(Some(message))
            }
            MessageStatus::Sent => self.load(chat_id, message_id).await,
        }
    }

    async fn load(&self, chat_id: Uuid, message_id: Uuid) -> Result<Option<MessageOut>> {
        run_blocking(&self.db, move |db| {
            Ok(db
                .get_message_in_chat(message_id, chat_id)?
                .map(|row| row.into_out()))
        })
        .await
    }

    async fn advance(&self, message_id: Uuid, status: MessageStatus) -> Result<bool> {
        run_blocking(&self.db, move |db| db.advance_message_status(message_id, status)).await
    }

    async fn notify_sender(&self, message: &MessageOut, status: MessageStatus) {
        // Sender removed: status still changes, nobody to tell.
        let Some(sender_id) = message.sender_id else {
            return;
        };
        let event = ServerEvent::StatusUpdate {
            message_id: message.id,
            chat_id: message.chat_id,
            status,
        };
        self.dispatcher.send_to_user(sender_id, &event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionHandle, ConnectionRegistry};
    use courier_db::NewMessage;
    use courier_types::models::ChatType;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        db: Arc<Database>,
        dispatcher: Dispatcher,
        lifecycle: MessageLifecycle,
        alice: Uuid,
        bob: Uuid,
        chat_id: Uuid,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        db.create_user(alice, "+1000", Some("alice"), "x").unwrap();
        db.create_user(bob, "+2000", Some("bob"), "x").unwrap();
        let chat_id = Uuid::new_v4();
        db.create_chat(chat_id, ChatType::Private, None, alice, &[bob]).unwrap();

        let dispatcher = Dispatcher::new(Arc::new(ConnectionRegistry::new()));
        let lifecycle = MessageLifecycle::new(db.clone(), dispatcher.clone());
        Fixture {
            db,
            dispatcher,
            lifecycle,
            alice,
            bob,
            chat_id,
        }
    }

    impl Fixture {
        fn store(&self, sender: Option<Uuid>) -> MessageOut {
            self.db
                .insert_message(&NewMessage {
                    id: Uuid::new_v4(),
                    chat_id: self.chat_id,
                    sender_id: sender,
                    content: Some("hi".into()),
                    image_url: None,
                    forwarded_from_id: None,
                })
                .unwrap()
                .into_out()
        }

        async fn connect(&self, user: Uuid) -> UnboundedReceiver<ServerEvent> {
            let (conn, rx) = ConnectionHandle::open();
            self.dispatcher.registry().register(user, conn).await;
            rx
        }

        fn members(&self) -> Vec<Uuid> {
            vec![self.alice, self.bob]
        }
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn status_updates(events: &[ServerEvent]) -> Vec<MessageStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::StatusUpdate { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn online_recipient_marks_delivered_once() {
        let f = fixture();
        let mut alice_rx = f.connect(f.alice).await;
        let mut bob_phone = f.connect(f.bob).await;
        let mut bob_laptop = f.connect(f.bob).await;

        let message = f.store(Some(f.alice));
        let published = f.lifecycle.publish_new(message.clone(), &f.members()).await.unwrap();
        assert_eq!(published.status, MessageStatus::Delivered);

        for rx in [&mut bob_phone, &mut bob_laptop] {
            let events = drain(rx);
            assert_eq!(events.len(), 1);
            assert!(matches!(
                &events[0],
                ServerEvent::NewMessage { message: m } if m.status == MessageStatus::Sent
            ));
        }

        let alice_events = drain(&mut alice_rx);
        assert!(matches!(alice_events[0], ServerEvent::NewMessage { .. }));
        assert_eq!(status_updates(&alice_events), vec![MessageStatus::Delivered]);

        // Re-running the check for the same message does not notify again.
        f.lifecycle.publish_new(message, &f.members()).await.unwrap();
        let again = drain(&mut alice_rx);
        assert!(status_updates(&again).is_empty());
    }

    #[tokio::test]
    async fn group_with_several_online_recipients_delivers_once() {
        let f = fixture();
        let carol = Uuid::new_v4();
        let dave = Uuid::new_v4();
        f.db.create_user(carol, "+3000", Some("carol"), "x").unwrap();
        f.db.create_user(dave, "+4000", Some("dave"), "x").unwrap();
        let group = Uuid::new_v4();
        f.db.create_chat(group, ChatType::Group, Some("crew"), f.alice, &[f.bob, carol, dave])
            .unwrap();
        let members = f.db.member_ids(group).unwrap();
        assert_eq!(members.len(), 4);

        let mut alice_rx = f.connect(f.alice).await;
        let mut others = vec![
            f.connect(f.bob).await,
            f.connect(carol).await,
            f.connect(dave).await,
        ];

        let message = f
            .db
            .insert_message(&NewMessage {
                id: Uuid::new_v4(),
                chat_id: group,
                sender_id: Some(f.alice),
                content: Some("x".into()),
                image_url: None,
                forwarded_from_id: None,
            })
            .unwrap()
            .into_out();
        let published = f.lifecycle.publish_new(message, &members).await.unwrap();
        assert_eq!(published.status, MessageStatus::Delivered);

        assert_eq!(
            status_updates(&drain(&mut alice_rx)),
            vec![MessageStatus::Delivered]
        );
        for rx in others.iter_mut() {
            let events = drain(rx);
            assert_eq!(events.len(), 1);
            assert!(status_updates(&events).is_empty());
        }
    }

    #[tokio::test]
    async fn offline_recipient_leaves_message_sent() {
        let f = fixture();
        let mut alice_rx = f.connect(f.alice).await;

        let message = f.store(Some(f.alice));
        let published = f.lifecycle.publish_new(message.clone(), &f.members()).await.unwrap();
        assert_eq!(published.status, MessageStatus::Sent);

        let events = drain(&mut alice_rx);
        assert_eq!(events.len(), 1);
        assert!(status_updates(&events).is_empty());
        let stored = f.db.get_message(message.id).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn read_twice_keeps_one_receipt() {
        let f = fixture();
        let mut alice_rx = f.connect(f.alice).await;
        let message = f.store(Some(f.alice));

        for _ in 0..2 {
            let read = f
                .lifecycle
                .mark_read(f.bob, f.chat_id, message.id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(read.status, MessageStatus::Read);
        }

        assert_eq!(f.db.read_receipt_count(message.id).unwrap(), 1);
        assert_eq!(
            status_updates(&drain(&mut alice_rx)),
            vec![MessageStatus::Read, MessageStatus::Read]
        );
    }

    #[tokio::test]
    async fn read_of_unknown_message_is_silent() {
        let f = fixture();
        let mut alice_rx = f.connect(f.alice).await;
        let message = f.store(Some(f.alice));

        let missing = f
            .lifecycle
            .mark_read(f.bob, f.chat_id, Uuid::new_v4())
            .await
            .unwrap();
        assert!(missing.is_none());

        // Right message, wrong chat.
        let wrong_chat = f
            .lifecycle
            .mark_read(f.bob, Uuid::new_v4(), message.id)
            .await
            .unwrap();
        assert!(wrong_chat.is_none());
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn message_without_sender_still_updates() {
        let f = fixture();
        let mut bob_rx = f.connect(f.bob).await;
        let message = f.store(None);

        let read = f
            .lifecycle
            .mark_read(f.bob, f.chat_id, message.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.status, MessageStatus::Read);
        assert_eq!(f.db.read_receipt_count(message.id).unwrap(), 1);
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn sender_ack_changes_nothing() {
        let f = fixture();
        let message = f.store(Some(f.alice));

        let same = f
            .lifecycle
            .mark_read(f.alice, f.chat_id, message.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(same.status, MessageStatus::Sent);
        assert_eq!(f.db.read_receipt_count(message.id).unwrap(), 0);
    }

    #[tokio::test]
    async fn manual_delivered_never_demotes_read() {
        let f = fixture();
        let mut alice_rx = f.connect(f.alice).await;
        let message = f.store(Some(f.alice));

        let delivered = f
            .lifecycle
            .set_status(f.bob, f.chat_id, message.id, MessageStatus::Delivered)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.status, MessageStatus::Delivered);
        assert_eq!(f.db.read_receipt_count(message.id).unwrap(), 0);

        f.lifecycle
            .set_status(f.bob, f.chat_id, message.id, MessageStatus::Read)
            .await
            .unwrap();
        let after = f
            .lifecycle
            .set_status(f.bob, f.chat_id, message.id, MessageStatus::Delivered)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, MessageStatus::Read);

        assert_eq!(
            status_updates(&drain(&mut alice_rx)),
            vec![MessageStatus::Delivered, MessageStatus::Read]
        );
    }
}
