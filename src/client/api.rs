//! Session API
//!
//! The request/response surface the client agent talks through.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::GameError;
use crate::game::session::SessionId;
use crate::network::protocol::{ActionAck, SessionAction, SessionSnapshot};
use crate::network::session::SessionManager;

/// Authoritative session endpoint.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Fetch the current snapshot.
    async fn fetch_snapshot(&self, session_id: SessionId) -> Result<SessionSnapshot, GameError>;

    /// Send an action on behalf of `identity`.
    async fn send_action(
        &self,
        session_id: SessionId,
        identity: &str,
        action: SessionAction,
    ) -> Result<ActionAck, GameError>;
}

/// In-process endpoint over a [`SessionManager`].
#[derive(Clone)]
pub struct LocalApi {
    manager: Arc<SessionManager>,
}

impl LocalApi {
    /// Wrap a manager.
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl SessionApi for LocalApi {
    async fn fetch_snapshot(&self, session_id: SessionId) -> Result<SessionSnapshot, GameError> {
        self.manager.snapshot(session_id, Utc::now()).await
    }

    async fn send_action(
        &self,
        session_id: SessionId,
        identity: &str,
        action: SessionAction,
    ) -> Result<ActionAck, GameError> {
        self.manager.dispatch(session_id, identity, action, Utc::now()).await
    }
}
