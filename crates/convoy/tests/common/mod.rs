//! Test utilities and common setup.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use convoy::agent::{
    Agent, AgentFault, AgentReply, ContentFilter, EchoAgent, KeywordFilter, PassthroughFilter,
    TurnContext, TurnRequest,
};
use convoy::api::{self, AppState};
use convoy::history::{ConversationStore, MemoryConversationStore};
use convoy::session::{Collaborators, SessionConfig};
use convoy_protocol::{Conversation, EventPayload, ServerEvent};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

/// Waits for cancellation after announcing itself.
pub struct PatientAgent;

#[async_trait]
impl Agent for PatientAgent {
    async fn run(&self, _request: &TurnRequest, ctx: &TurnContext) -> Result<AgentReply, AgentFault> {
        let _analyst = ctx.agent("analyst", "📊")?;
        ctx.cancelled().await;
        Err(AgentFault::Cancelled)
    }
}

/// Store whose loads never complete.
pub struct StalledStore;

#[async_trait]
impl ConversationStore for StalledStore {
    async fn save(&self, _conversation: Conversation) -> anyhow::Result<()> {
        Ok(())
    }

    async fn load(&self, _id: &str) -> anyhow::Result<Option<Conversation>> {
        std::future::pending().await
    }
}

/// App state whose store never answers, with a short store timeout.
pub fn stalled_store_state() -> AppState {
    let collaborators = Collaborators::new(
        Arc::new(EchoAgent),
        Arc::new(PassthroughFilter),
        Arc::new(StalledStore),
    );
    AppState::new(SessionConfig::default(), collaborators)
        .with_keepalive(None)
        .with_store_timeout(Duration::from_millis(50))
}

/// App state with the echo agent and an in-memory store.
pub fn test_state() -> AppState {
    state_with(Arc::new(EchoAgent), Arc::new(PassthroughFilter))
}

pub fn filtered_state(terms: &[&str]) -> AppState {
    let filter = KeywordFilter::new(terms.iter().map(|t| t.to_string()).collect());
    state_with(Arc::new(EchoAgent), Arc::new(filter))
}

pub fn state_with(agent: Arc<dyn Agent>, filter: Arc<dyn ContentFilter>) -> AppState {
    let collaborators = Collaborators::new(agent, filter, Arc::new(MemoryConversationStore::new()));
    let config = SessionConfig {
        max_retries: 1,
        cancel_grace: Duration::from_millis(500),
        ..SessionConfig::default()
    };
    AppState::new(config, collaborators).with_keepalive(None)
}

/// Create a test application router.
pub fn test_app() -> Router {
    api::create_router(test_state())
}

/// Serve `state` on an ephemeral port.
pub async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::create_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Thin WebSocket client speaking the session protocol.
pub struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        Self { ws }
    }

    pub async fn send(&mut self, frame: Value) {
        self.ws
            .send(Message::Text(frame.to_string().into()))
            .await
            .unwrap();
    }

    pub async fn chat(&mut self, message: &str) {
        self.send(serde_json::json!({"type": "chat", "message": message}))
            .await;
    }

    /// Next protocol event, or `None` once the server closes.
    pub async fn next(&mut self) -> Option<ServerEvent> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for an event")?;
            match frame.unwrap() {
                Message::Text(text) => return Some(serde_json::from_str(text.as_str()).unwrap()),
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    /// Collect events up to and including the first one matching `done`.
    pub async fn until(&mut self, done: impl Fn(&ServerEvent) -> bool) -> Vec<ServerEvent> {
        let mut seen = Vec::new();
        while let Some(event) = self.next().await {
            let stop = done(&event);
            seen.push(event);
            if stop {
                return seen;
            }
        }
        panic!("stream closed before the expected event; saw {seen:?}");
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

pub fn is_status(event: &ServerEvent, wanted: &str) -> bool {
    match &event.payload {
        EventPayload::Status { status, .. } => status.to_string() == wanted,
        _ => false,
    }
}
