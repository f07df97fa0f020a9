//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use crate::session::{Collaborators, SessionConfig};
use crate::ws::SessionHub;

/// Everything a request or a new connection needs.
#[derive(Clone)]
pub struct AppState {
    /// Live session registry.
    pub hub: Arc<SessionHub>,
    /// Limits applied to every new session.
    pub session_config: Arc<SessionConfig>,
    /// Agent, content filter and conversation store.
    pub collaborators: Collaborators,
    /// Interval between WebSocket ping frames. `None` disables them.
    pub keepalive: Option<Duration>,
    /// Longest a request waits on the conversation store.
    pub store_timeout: Duration,
}

impl AppState {
    pub fn new(session_config: SessionConfig, collaborators: Collaborators) -> Self {
        Self {
            hub: Arc::new(SessionHub::new()),
            session_config: Arc::new(session_config),
            collaborators,
            keepalive: Some(Duration::from_secs(30)),
            store_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }
}
