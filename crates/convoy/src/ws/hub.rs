//! Registry of live sessions.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::session::{SessionHandle, SessionSnapshot, SessionState};

/// A live session as reported by `GET /sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub turns: u32,
    pub connected_at: DateTime<Utc>,
}

struct LiveSession {
    connected_at: DateTime<Utc>,
    state: watch::Receiver<SessionSnapshot>,
}

/// Tracks every connected session and owns the server-wide shutdown token.
///
/// The hub only observes sessions: each actor publishes its snapshot on a
/// watch channel and the hub reads the latest value on demand.
pub struct SessionHub {
    /// Session ID -> live session
    sessions: DashMap<String, LiveSession>,

    /// Cancelled once on shutdown; every session runs under a child token.
    shutdown: CancellationToken,
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHub {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token for a new session, cancelled when the server shuts down.
    pub fn session_token(&self) -> CancellationToken {
        debug!("Issuing session token");
        self.shutdown.child_token()
    }

    pub fn register(&self, handle: &SessionHandle) {
        self.sessions.insert(
            handle.id.clone(),
            LiveSession {
                connected_at: Utc::now(),
                state: handle.state.clone(),
            },
        );
        info!(
            "Registered session {} ({} live)",
            handle.id,
            self.sessions.len()
        );
    }

    pub fn unregister(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            info!(
                "Unregistered session {} ({} live)",
                session_id,
                self.sessions.len()
            );
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshot of every live session, oldest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| {
                let snapshot = entry.state.borrow().clone();
                SessionSummary {
                    session_id: entry.key().clone(),
                    state: snapshot.state,
                    conversation_id: snapshot.conversation_id,
                    turns: snapshot.turns,
                    connected_at: entry.connected_at,
                }
            })
            .collect();
        summaries.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        summaries
    }

    /// Ask every session to disconnect.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Closing {} live session(s)", self.sessions.len());
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{EchoAgent, PassthroughFilter};
    use crate::history::MemoryConversationStore;
    use crate::session::{Collaborators, Inbound, SessionConfig, spawn_session};
    use std::sync::Arc;
    use std::time::Duration;

    fn collaborators() -> Collaborators {
        Collaborators::new(
            Arc::new(EchoAgent),
            Arc::new(PassthroughFilter),
            Arc::new(MemoryConversationStore::new()),
        )
    }

    #[tokio::test]
    async fn test_register_list_unregister() {
        let hub = SessionHub::new();
        let config = Arc::new(SessionConfig::default());
        let mut first = spawn_session(config.clone(), collaborators(), hub.session_token());
        let second = spawn_session(config, collaborators(), hub.session_token());
        hub.register(&first);
        hub.register(&second);
        assert_eq!(hub.session_count(), 2);

        first
            .state
            .wait_for(|s| s.state == SessionState::Idle)
            .await
            .unwrap();
        let listed = hub.list();
        assert_eq!(listed.len(), 2);
        let entry = listed
            .iter()
            .find(|s| s.session_id == first.id)
            .unwrap();
        assert_eq!(entry.state, SessionState::Idle);
        assert_eq!(entry.turns, 0);

        hub.unregister(&first.id);
        hub.unregister(&first.id);
        assert_eq!(hub.session_count(), 1);
        first.inbound.send(Inbound::Closed).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let hub = SessionHub::new();
        let mut handle = spawn_session(
            Arc::new(SessionConfig::default()),
            collaborators(),
            hub.session_token(),
        );
        hub.register(&handle);

        hub.shutdown();
        assert!(hub.is_shutting_down());
        tokio::time::timeout(Duration::from_secs(5), &mut handle.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.state.borrow().state, SessionState::Disconnecting);
    }
}
