use anyhow::Result;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_db::NewMessage;
use courier_types::events::{ClientEvent, ServerEvent};
use courier_types::models::UserOut;

use crate::Gateway;
use crate::presence::broadcast_presence;
use crate::registry::{ConnectionHandle, ConnectionId};
use crate::store::run_blocking;

/// Close code sent when the handshake credential is rejected.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;

/// Close a connection whose credential failed verification. It is never
/// registered.
pub async fn reject_unauthorized(mut socket: WebSocket) {
    let frame = CloseFrame {
        code: CLOSE_UNAUTHORIZED,
        reason: "Unauthorized".into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Drive one authenticated connection until it closes.
///
/// Inbound events are handled one at a time, to completion, in arrival
/// order. Outbound events go through the connection's channel and a writer
/// task, so everything sent to this connection keeps its send order.
pub async fn handle_connection(socket: WebSocket, gateway: Gateway, user: UserOut) {
    let (sink, mut stream) = socket.split();
    let (handle, rx) = ConnectionHandle::open();
    let conn_id = handle.id;
    let user_id = user.id;

    let mut writer = tokio::spawn(writer_task(sink, rx));
    attach(&gateway, user_id, handle).await;
    info!("{} ({}) connected [conn={}]", user.phone, user_id, conn_id);

    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = &mut writer => {
                debug!("{} writer finished [conn={}]", user_id, conn_id);
                break;
            }
        };

        match frame {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => {
                    if let Err(e) = handle_event(&gateway, user_id, event).await {
                        warn!("{} event aborted: {:#}", user_id, e);
                    }
                }
                Err(e) => {
                    warn!(
                        "{} bad event: {} -- raw: {}",
                        user_id,
                        e,
                        text.chars().take(200).collect::<String>()
                    );
                }
            },
            Some(Ok(Message::Binary(data))) => {
                debug!("{} sent {} byte binary frame, ignoring", user_id, data.len());
            }
            Some(Ok(Message::Close(_))) | None => break,
            // Ping/pong are answered by the transport.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("{} transport error: {}", user_id, e);
                break;
            }
        }
    }

    detach(&gateway, user_id, conn_id).await;
    writer.abort();
    info!("{} ({}) disconnected [conn={}]", user.phone, user_id, conn_id);
}

async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<ServerEvent>,
) {
    while let Some(event) = rx.recv().await {
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode {}: {}", event.kind(), e);
                continue;
            }
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
}

/// Register a connection and announce the user if they just came online.
pub async fn attach(gateway: &Gateway, user_id: Uuid, handle: ConnectionHandle) {
    let first = gateway.dispatcher.registry().register(user_id, handle).await;
    if !first {
        return;
    }
    if let Err(e) = broadcast_presence(&gateway.db, &gateway.dispatcher, user_id, true).await {
        warn!("Presence online broadcast for {} failed: {:#}", user_id, e);
    }
}

/// Unregister a connection. If it was the user's last one, record
/// last-seen and announce them offline. Runs once per connection.
pub async fn detach(gateway: &Gateway, user_id: Uuid, conn_id: ConnectionId) {
    let went_offline = gateway.dispatcher.registry().unregister(user_id, conn_id).await;
    if !went_offline {
        return;
    }
    if let Err(e) = run_blocking(&gateway.db, move |db| db.touch_last_seen(user_id)).await {
        warn!("Failed to record last_seen for {}: {:#}", user_id, e);
    }
    if let Err(e) = broadcast_presence(&gateway.db, &gateway.dispatcher, user_id, false).await {
        warn!("Presence offline broadcast for {} failed: {:#}", user_id, e);
    }
}

/// Process one inbound event. Non-members and empty messages are dropped
/// silently; storage failures abort this event only.
pub async fn handle_event(gateway: &Gateway, user_id: Uuid, event: ClientEvent) -> Result<()> {
    match event {
        ClientEvent::SendMessage { chat_id, content } => {
            let content = content.trim().to_string();
            if content.is_empty() {
                return Ok(());
            }
            if !is_member(gateway, chat_id, user_id).await? {
                debug!("{} is not in chat {}, dropping message", user_id, chat_id);
                return Ok(());
            }

            let new = NewMessage {
                id: Uuid::new_v4(),
                chat_id,
                sender_id: Some(user_id),
                content: Some(content),
                image_url: None,
                forwarded_from_id: None,
            };
            let (message, member_ids) = run_blocking(&gateway.db, move |db| {
                let row = db.insert_message(&new)?;
                Ok((row.into_out(), db.member_ids(chat_id)?))
            })
            .await?;

            gateway.lifecycle.publish_new(message, &member_ids).await?;
        }

        ClientEvent::Typing { chat_id } => {
            if !is_member(gateway, chat_id, user_id).await? {
                return Ok(());
            }
            let member_ids = run_blocking(&gateway.db, move |db| db.member_ids(chat_id)).await?;
            gateway
                .dispatcher
                .broadcast_to_members(
                    &member_ids,
                    &ServerEvent::Typing { chat_id, user_id },
                    Some(user_id),
                )
                .await;
        }

        ClientEvent::Read {
            chat_id,
            message_id,
        } => {
            if !is_member(gateway, chat_id, user_id).await? {
                return Ok(());
            }
            gateway.lifecycle.mark_read(user_id, chat_id, message_id).await?;
        }
    }

    Ok(())
}

async fn is_member(gateway: &Gateway, chat_id: Uuid, user_id: Uuid) -> Result<bool> {
    run_blocking(&gateway.db, move |db| db.is_member(chat_id, user_id)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use courier_db::Database;
    use courier_types::models::{ChatType, MessageStatus};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn gateway() -> Gateway {
        Gateway::new(Arc::new(Database::open_in_memory().unwrap()), "secret")
    }

    fn user(gateway: &Gateway, phone: &str) -> Uuid {
        let id = Uuid::new_v4();
        gateway.db.create_user(id, phone, None, "x").unwrap();
        id
    }

    async fn connect(gateway: &Gateway, user_id: Uuid) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
        let (handle, rx) = ConnectionHandle::open();
        let id = handle.id;
        attach(gateway, user_id, handle).await;
        (id, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn kinds(events: &[ServerEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.kind()).collect()
    }

    #[tokio::test]
    async fn send_message_reaches_all_devices_then_marks_delivered() {
        let gw = gateway();
        let a = user(&gw, "+1");
        let b = user(&gw, "+2");
        let chat = Uuid::new_v4();
        gw.db.create_chat(chat, ChatType::Private, None, a, &[b]).unwrap();

        let (_, mut a_sending) = connect(&gw, a).await;
        let (_, mut a_other) = connect(&gw, a).await;
        let (_, mut b_phone) = connect(&gw, b).await;
        let (_, mut b_laptop) = connect(&gw, b).await;
        for rx in [&mut a_sending, &mut a_other, &mut b_phone, &mut b_laptop] {
            drain(rx);
        }

        handle_event(
            &gw,
            a,
            ClientEvent::SendMessage {
                chat_id: chat,
                content: "  hi  ".into(),
            },
        )
        .await
        .unwrap();

        for rx in [&mut b_phone, &mut b_laptop] {
            let events = drain(rx);
            assert_eq!(kinds(&events), vec!["new_message"]);
            let ServerEvent::NewMessage { message } = &events[0] else {
                unreachable!()
            };
            assert_eq!(message.content.as_deref(), Some("hi"));
            assert_eq!(message.status, MessageStatus::Sent);
        }

        for rx in [&mut a_sending, &mut a_other] {
            let events = drain(rx);
            assert_eq!(kinds(&events), vec!["new_message", "status_update"]);
            assert!(matches!(
                events[1],
                ServerEvent::StatusUpdate {
                    status: MessageStatus::Delivered,
                    ..
                }
            ));
        }
    }

    #[tokio::test]
    async fn non_member_message_is_dropped() {
        let gw = gateway();
        let a = user(&gw, "+1");
        let outsider = user(&gw, "+9");
        let chat = Uuid::new_v4();
        gw.db.create_chat(chat, ChatType::Group, None, a, &[]).unwrap();
        let (_, mut a_rx) = connect(&gw, a).await;

        handle_event(
            &gw,
            outsider,
            ClientEvent::SendMessage {
                chat_id: chat,
                content: "let me in".into(),
            },
        )
        .await
        .unwrap();

        assert!(drain(&mut a_rx).is_empty());
        assert!(gw.db.list_messages(chat, 50, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn blank_message_is_ignored() {
        let gw = gateway();
        let a = user(&gw, "+1");
        let chat = Uuid::new_v4();
        gw.db.create_chat(chat, ChatType::Group, None, a, &[]).unwrap();

        handle_event(
            &gw,
            a,
            ClientEvent::SendMessage {
                chat_id: chat,
                content: "   ".into(),
            },
        )
        .await
        .unwrap();
        assert!(gw.db.list_messages(chat, 50, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn typing_goes_to_other_members_only() {
        let gw = gateway();
        let a = user(&gw, "+1");
        let b = user(&gw, "+2");
        let chat = Uuid::new_v4();
        gw.db.create_chat(chat, ChatType::Private, None, a, &[b]).unwrap();
        let (_, mut a_rx) = connect(&gw, a).await;
        let (_, mut b_rx) = connect(&gw, b).await;
        drain(&mut a_rx);

        handle_event(&gw, a, ClientEvent::Typing { chat_id: chat }).await.unwrap();

        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(
            drain(&mut b_rx).last(),
            Some(&ServerEvent::Typing {
                chat_id: chat,
                user_id: a
            })
        );
    }

    #[tokio::test]
    async fn read_event_creates_one_receipt_and_tells_sender() {
        let gw = gateway();
        let a = user(&gw, "+1");
        let b = user(&gw, "+2");
        let chat = Uuid::new_v4();
        gw.db.create_chat(chat, ChatType::Private, None, a, &[b]).unwrap();
        let message = gw
            .db
            .insert_message(&NewMessage {
                id: Uuid::new_v4(),
                chat_id: chat,
                sender_id: Some(a),
                content: Some("ping".into()),
                image_url: None,
                forwarded_from_id: None,
            })
            .unwrap();
        let (_, mut a_rx) = connect(&gw, a).await;

        let read = ClientEvent::Read {
            chat_id: chat,
            message_id: message.id,
        };
        handle_event(&gw, b, read).await.unwrap();

        assert_eq!(gw.db.read_receipt_count(message.id).unwrap(), 1);
        let stored = gw.db.get_message(message.id).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Read);
        assert_eq!(
            drain(&mut a_rx),
            vec![ServerEvent::StatusUpdate {
                message_id: message.id,
                chat_id: chat,
                status: MessageStatus::Read,
            }]
        );
    }

    #[tokio::test]
    async fn storage_failure_aborts_one_event_only() {
        let gw = gateway();
        let a = user(&gw, "+1");
        let b = user(&gw, "+2");
        let chat = Uuid::new_v4();
        gw.db.create_chat(chat, ChatType::Private, None, a, &[b]).unwrap();
        let message = gw
            .db
            .insert_message(&NewMessage {
                id: Uuid::new_v4(),
                chat_id: chat,
                sender_id: Some(a),
                content: Some("ping".into()),
                image_url: None,
                forwarded_from_id: None,
            })
            .unwrap();
        let (_, mut a_rx) = connect(&gw, a).await;
        drain(&mut a_rx);

        gw.db
            .with_conn(|conn| {
                conn.execute_batch("DROP TABLE read_receipts")?;
                Ok(())
            })
            .unwrap();

        let read = ClientEvent::Read {
            chat_id: chat,
            message_id: message.id,
        };
        assert!(handle_event(&gw, b, read).await.is_err());
        assert!(drain(&mut a_rx).is_empty());
        let stored = gw.db.get_message(message.id).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);

        // The next event from the same user still goes through.
        handle_event(&gw, b, ClientEvent::Typing { chat_id: chat }).await.unwrap();
        assert_eq!(
            drain(&mut a_rx),
            vec![ServerEvent::Typing {
                chat_id: chat,
                user_id: b
            }]
        );
    }

    #[tokio::test]
    async fn presence_flips_only_on_first_and_last_connection() {
        let gw = gateway();
        let a = user(&gw, "+1");
        let contact = user(&gw, "+2");
        // Two shared chats: the contact must still hear each change once.
        gw.db.create_chat(Uuid::new_v4(), ChatType::Private, None, a, &[contact]).unwrap();
        gw.db.create_chat(Uuid::new_v4(), ChatType::Group, None, a, &[contact]).unwrap();
        let (_, mut contact_rx) = connect(&gw, contact).await;
        let seen_before = gw.db.get_user_by_id(a).unwrap().unwrap().last_seen;

        let (first, _first_rx) = connect(&gw, a).await;
        assert_eq!(
            drain(&mut contact_rx),
            vec![ServerEvent::Presence {
                user_id: a,
                online: true
            }]
        );

        let (second, _second_rx) = connect(&gw, a).await;
        assert!(drain(&mut contact_rx).is_empty());

        detach(&gw, a, first).await;
        assert!(gw.dispatcher.registry().is_online(a).await);
        assert!(drain(&mut contact_rx).is_empty());

        tokio::time::sleep(Duration::from_millis(5)).await;
        detach(&gw, a, second).await;
        assert!(!gw.dispatcher.registry().is_online(a).await);
        assert_eq!(
            drain(&mut contact_rx),
            vec![ServerEvent::Presence {
                user_id: a,
                online: false
            }]
        );

        let seen_after = gw.db.get_user_by_id(a).unwrap().unwrap().last_seen;
        assert!(seen_after > seen_before);

        // Double cleanup is a no-op.
        detach(&gw, a, second).await;
        assert!(drain(&mut contact_rx).is_empty());
    }
}
