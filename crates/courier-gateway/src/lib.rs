//! Real-time delivery core: who is connected, how events reach them, and
//! how message status advances.

pub mod auth;
pub mod dispatcher;
pub mod lifecycle;
pub mod presence;
pub mod registry;
pub mod session;
pub mod store;

use std::sync::Arc;

use courier_db::Database;

use crate::auth::TokenVerifier;
use crate::dispatcher::Dispatcher;
use crate::lifecycle::MessageLifecycle;
use crate::registry::ConnectionRegistry;

/// Everything a session or an HTTP handler needs to push events. Built once
/// at startup; clones share the same registry.
#[derive(Clone)]
pub struct Gateway {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub lifecycle: MessageLifecycle,
    pub verifier: TokenVerifier,
}

impl Gateway {
    pub fn new(db: Arc<Database>, jwt_secret: &str) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Dispatcher::new(registry);
        let lifecycle = MessageLifecycle::new(db.clone(), dispatcher.clone());
        Self {
            db,
            dispatcher,
            lifecycle,
            verifier: TokenVerifier::new(jwt_secret),
        }
    }
}
