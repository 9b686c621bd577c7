use std::sync::Arc;

use anyhow::Result;
use uuid::Uuid;

use courier_db::Database;
use courier_types::events::ServerEvent;

use crate::dispatcher::Dispatcher;
use crate::store::run_blocking;

/// Send an event to everyone who shares a chat with `user_id`, once each.
pub async fn notify_contacts(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    user_id: Uuid,
    event: &ServerEvent,
) -> Result<usize> {
    let contacts = run_blocking(db, move |db| db.contact_ids(user_id)).await?;
    Ok(dispatcher
        .broadcast_to_members(&contacts, event, Some(user_id))
        .await)
}

/// Announce an online/offline transition to the user's contacts.
pub async fn broadcast_presence(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    user_id: Uuid,
    online: bool,
) -> Result<usize> {
    notify_contacts(db, dispatcher, user_id, &ServerEvent::Presence { user_id, online }).await
}
