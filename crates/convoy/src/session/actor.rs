//! Session actor: one task per connection.
//!
//! The actor owns the [`Session`] state machine and is the only writer of
//! session-level and controller events. Inbound frames, turn completion and the
//! cancellation deadline are multiplexed in a single `select!` loop, so every
//! lifecycle decision is taken by exactly one task.

use std::sync::Arc;

use chrono::Utc;
use convoy_protocol::{ClientMessage, Conversation, EventPayload, ProtocolError, ServerEvent, SessionStatus};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::cancel::{ActiveTurn, CancellationController, TurnSignal};
use super::retry::{RetryController, TurnOutcome};
use super::sequencer::{EventSequencer, OutboundStream, Source};
use super::state::{CancelRequest, Session, SessionError, SessionState};
use super::{Collaborators, SessionConfig};
use crate::agent::{TurnEmitter, TurnRequest, TurnScope};
use crate::history::{ConversationAccumulator, ConversationStore};

/// Queued pongs per session. Extra pings are dropped while the client lags.
const OOB_CAPACITY: usize = 16;

/// Frames from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// A binary frame of the given length. Not part of the protocol.
    Binary(usize),
    Closed,
}

/// Observable summary, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub conversation_id: Option<String>,
    pub turns: u32,
}

/// Everything the client should receive, in delivery order.
///
/// Out-of-band pongs take priority over the sequenced stream.
pub struct SessionOutput {
    oob: mpsc::Receiver<ServerEvent>,
    events: OutboundStream,
}

impl SessionOutput {
    /// `None` once the session has closed and its stream is drained.
    pub async fn next(&mut self) -> Option<ServerEvent> {
        tokio::select! {
            biased;
            Some(event) = self.oob.recv() => Some(event),
            event = self.events.next() => event,
        }
    }
}

/// Transport-facing handle to a running session.
pub struct SessionHandle {
    pub id: String,
    pub inbound: mpsc::Sender<Inbound>,
    pub output: SessionOutput,
    pub state: watch::Receiver<SessionSnapshot>,
    pub task: JoinHandle<()>,
}

/// Start a session actor. It stops on [`Inbound::Closed`], when the inbound
/// channel drops, or when `shutdown` is cancelled.
pub fn spawn_session(
    config: Arc<SessionConfig>,
    collaborators: Collaborators,
    shutdown: CancellationToken,
) -> SessionHandle {
    let id = Uuid::new_v4().to_string();
    let (sequencer, events) = EventSequencer::new(config.outbound_capacity);
    let (oob_tx, oob_rx) = mpsc::channel(OOB_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let session = Session::new(id.clone(), config.max_turns);
    let (state_tx, state_rx) = watch::channel(SessionSnapshot {
        state: session.state(),
        conversation_id: None,
        turns: 0,
    });

    let actor = SessionActor {
        cancel: CancellationController::new(config.cancel_grace),
        retry: RetryController::new(config.max_retries),
        persist: spawn_persistence(collaborators.store.clone()),
        session,
        config,
        collaborators,
        sequencer,
        oob: oob_tx,
        inbound: inbound_rx,
        state_tx,
        shutdown,
        active: None,
    };
    let span = info_span!("session", session_id = %id);
    let task = tokio::spawn(actor.run().instrument(span));

    SessionHandle {
        id,
        inbound: inbound_tx,
        output: SessionOutput { oob: oob_rx, events },
        state: state_rx,
        task,
    }
}

/// Saves snapshots in submission order, off the event-delivery path.
fn spawn_persistence(store: Arc<dyn ConversationStore>) -> mpsc::UnboundedSender<Conversation> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Conversation>();
    tokio::spawn(async move {
        while let Some(conversation) = rx.recv().await {
            let id = conversation.id.clone();
            match store.save(conversation).await {
                Ok(()) => debug!(conversation_id = %id, "conversation saved"),
                Err(err) => warn!(conversation_id = %id, error = %err, "failed to save conversation"),
            }
        }
    });
    tx
}

struct SessionActor {
    session: Session,
    config: Arc<SessionConfig>,
    collaborators: Collaborators,
    sequencer: EventSequencer,
    cancel: CancellationController,
    retry: RetryController,
    oob: mpsc::Sender<ServerEvent>,
    inbound: mpsc::Receiver<Inbound>,
    state_tx: watch::Sender<SessionSnapshot>,
    persist: mpsc::UnboundedSender<Conversation>,
    shutdown: CancellationToken,
    active: Option<ActiveTurn>,
}

/// Resolves when the active turn needs attention. Pending forever when idle.
async fn next_turn_signal(active: &mut Option<ActiveTurn>) -> TurnSignal {
    match active {
        Some(turn) => turn.signal().await,
        None => std::future::pending().await,
    }
}

fn settle(result: Result<(), SessionError>) {
    if let Err(err) = result {
        warn!(error = %err, "unexpected session transition");
    }
}

impl SessionActor {
    async fn run(mut self) {
        self.emit(Source::Session, EventPayload::status(SessionStatus::Connected));
        if let Err(err) = self.session.open() {
            warn!(error = %err, "failed to open session");
        }
        self.publish();
        info!("session opened");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("server shutting down, closing session");
                    self.cancel_for_shutdown();
                    break;
                }
                inbound = self.inbound.recv() => match inbound {
                    Some(Inbound::Text(text)) => self.on_text(&text).await,
                    Some(Inbound::Binary(len)) => {
                        self.protocol_error(&ProtocolError::UnsupportedFrame(format!(
                            "binary frame of {len} bytes"
                        )));
                    }
                    Some(Inbound::Closed) | None => break,
                },
                signal = next_turn_signal(&mut self.active) => self.on_turn_signal(signal),
            }
        }

        self.disconnect();
    }

    async fn on_text(&mut self, text: &str) {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(err) => {
                self.protocol_error(&err);
                return;
            }
        };
        debug!(kind = message.kind(), "client message");

        match message {
            ClientMessage::Chat {
                message,
                conversation_id,
            } => self.on_chat(message, conversation_id).await,
            ClientMessage::Cancel => self.on_cancel(),
            ClientMessage::Ping => {
                if self.oob.try_send(ServerEvent::pong()).is_err() {
                    debug!("pong queue full, dropping ping");
                }
            }
        }
    }

    async fn on_chat(&mut self, message: String, requested: Option<String>) {
        if let Err(err) = self.session.check_can_start() {
            self.reject_chat(err);
            return;
        }
        let conversation_id = match self.session.resolve_conversation(requested.as_deref()) {
            Ok(Some(bound)) => bound,
            Ok(None) => self.bind_conversation(requested).await,
            Err(err) => {
                self.reject_chat(err);
                return;
            }
        };
        let turn = match self.session.begin_turn(&conversation_id) {
            Ok(turn) => turn,
            Err(err) => {
                self.reject_chat(err);
                return;
            }
        };
        info!(turn, conversation_id = %conversation_id, "turn started");

        self.sequencer.open_turn(turn);
        self.sequencer.record_user(turn, &message);
        self.emit(
            Source::Controller(turn),
            EventPayload::status(SessionStatus::Processing),
        );

        let token = self.shutdown.child_token();
        let emitter = TurnEmitter::new(turn, self.sequencer.clone(), token.clone());
        let scope = TurnScope::new(
            emitter,
            self.config.max_turns,
            self.collaborators.filter.clone(),
        );
        let request = TurnRequest {
            conversation_id,
            prompt: message,
            max_turns: self.config.max_turns,
        };
        let agent = self.collaborators.agent.clone();
        let retry = self.retry;
        let handle = tokio::spawn(
            async move { retry.drive(agent.as_ref(), &request, &scope).await }
                .instrument(info_span!("turn", turn)),
        );
        self.active = Some(ActiveTurn::new(turn, token, handle));
        self.publish();
    }

    /// Bind the session to a stored conversation or a fresh one.
    async fn bind_conversation(&mut self, requested: Option<String>) -> String {
        let now = Utc::now();
        let accumulator = match requested {
            Some(id) => match self.load_stored(&id).await {
                Some(conversation) => {
                    info!(
                        conversation_id = %id,
                        messages = conversation.messages.len(),
                        "resuming stored conversation"
                    );
                    ConversationAccumulator::resume(conversation)
                }
                None => ConversationAccumulator::new(id, now),
            },
            None => ConversationAccumulator::new(Uuid::new_v4().to_string(), now),
        };
        let id = accumulator.id().to_string();
        self.sequencer.attach_history(accumulator);
        id
    }

    /// Load a stored conversation, giving up after the grace period or on shutdown.
    async fn load_stored(&self, id: &str) -> Option<Conversation> {
        let grace = self.config.cancel_grace;
        let load = tokio::time::timeout(grace, self.collaborators.store.load(id));
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                debug!(conversation_id = %id, "shutdown during conversation load");
                None
            }
            result = load => match result {
                Ok(Ok(found)) => found,
                Ok(Err(err)) => {
                    warn!(conversation_id = %id, error = %err, "failed to load conversation, starting fresh");
                    None
                }
                Err(_) => {
                    warn!(
                        conversation_id = %id,
                        timeout_ms = grace.as_millis() as u64,
                        "conversation load timed out, starting fresh"
                    );
                    None
                }
            },
        }
    }

    fn reject_chat(&mut self, err: SessionError) {
        match err {
            SessionError::TurnInProgress => {
                debug!("rejecting chat while a turn is in progress");
                self.emit(
                    Source::Session,
                    EventPayload::Error {
                        message: "A turn is already in progress".to_string(),
                        details: Some("Wait for the current turn to finish or cancel it".to_string()),
                        recoverable: false,
                    },
                );
            }
            SessionError::ConversationMismatch { .. } => {
                self.emit(Source::Session, EventPayload::error(err.to_string(), true));
            }
            SessionError::Disconnected => {}
            SessionError::InvalidTransition { .. } => {
                warn!(error = %err, "chat rejected");
                self.emit(Source::Session, EventPayload::error(err.to_string(), true));
            }
        }
    }

    fn on_cancel(&mut self) {
        match self.session.begin_cancel() {
            CancelRequest::Started => {
                if let Some(turn) = self.active.as_mut() {
                    info!(turn = turn.id(), "cancelling turn");
                    self.cancel.activate(turn, &self.sequencer);
                }
                self.publish();
            }
            CancelRequest::NotProcessing => {
                self.emit(
                    Source::Session,
                    EventPayload::status_with(SessionStatus::Idle, "No turn in progress"),
                );
            }
            CancelRequest::AlreadyCancelling => debug!("cancellation already in progress"),
        }
    }

    fn on_turn_signal(&mut self, signal: TurnSignal) {
        let Some(active) = self.active.take() else {
            return;
        };
        let turn = active.id();
        // Whatever happens next, the turn's own emissions are over.
        self.sequencer.seal_turn(turn);

        match signal {
            TurnSignal::Finished(_) if self.session.state() == SessionState::Cancelling => {
                info!(turn, "turn cancelled");
                self.emit(
                    Source::Controller(turn),
                    EventPayload::status_with(SessionStatus::Cancelled, "Turn cancelled"),
                );
                settle(self.session.finish_cancel());
                active.release();
            }
            TurnSignal::Finished(result) => {
                let outcome = result.unwrap_or_else(|err| {
                    warn!(turn, error = %err, "turn task failed");
                    TurnOutcome::Failed {
                        message: "The agent stopped unexpectedly".to_string(),
                        details: Some(err.to_string()),
                    }
                });
                self.finish_turn(turn, outcome);
                active.release();
            }
            TurnSignal::GraceExpired => {
                self.cancel.force(active);
                self.emit(
                    Source::Controller(turn),
                    EventPayload::Error {
                        message: "Cancellation did not complete in time; the turn was stopped"
                            .to_string(),
                        details: Some(format!(
                            "grace period of {} ms elapsed",
                            self.cancel.grace().as_millis()
                        )),
                        recoverable: true,
                    },
                );
                settle(self.session.finish_cancel());
                self.emit(
                    Source::Controller(turn),
                    EventPayload::status(SessionStatus::Idle),
                );
            }
        }

        self.sequencer.close_turn(turn);
        self.persist();
        self.publish();
    }

    fn finish_turn(&mut self, turn: u32, outcome: TurnOutcome) {
        match outcome {
            TurnOutcome::Completed {
                content,
                format,
                agents_used,
            } => {
                info!(turn, agents = agents_used.len(), "turn completed");
                self.emit(
                    Source::Controller(turn),
                    EventPayload::Result {
                        content,
                        format,
                        agents_used,
                    },
                );
            }
            TurnOutcome::Failed { message, details } => {
                info!(turn, %message, "turn failed");
                self.emit(
                    Source::Controller(turn),
                    EventPayload::Error {
                        message,
                        details,
                        recoverable: false,
                    },
                );
            }
            TurnOutcome::Cancelled => {
                // The agent stopped on its own account, for instance during shutdown.
                self.emit(
                    Source::Controller(turn),
                    EventPayload::status_with(SessionStatus::Cancelled, "Turn cancelled"),
                );
                settle(self.session.finish_turn());
                return;
            }
        }
        settle(self.session.finish_turn());
        self.emit(
            Source::Controller(turn),
            EventPayload::status(SessionStatus::Idle),
        );
    }

    /// Close out the active turn while the client can still hear about it.
    fn cancel_for_shutdown(&mut self) {
        let Some(turn) = self.active.as_ref().map(ActiveTurn::id) else {
            return;
        };
        info!(turn, "cancelling turn for shutdown");
        self.sequencer.seal_turn(turn);
        self.emit(
            Source::Controller(turn),
            EventPayload::status_with(SessionStatus::Cancelled, "Turn cancelled: server shutting down"),
        );
    }

    fn disconnect(&mut self) {
        self.session.close();
        if let Some(turn) = self.active.take() {
            info!(turn = turn.id(), "abandoning turn on disconnect");
            self.cancel.abandon(turn, &self.sequencer);
        }
        self.sequencer.close();
        self.persist();
        self.publish();
        info!(shed = self.sequencer.shed_count(), "session closed");
    }

    fn protocol_error(&self, err: &ProtocolError) {
        debug!(error = %err, "protocol error");
        self.emit(Source::Session, EventPayload::error(err.to_string(), true));
    }

    fn emit(&self, source: Source, payload: EventPayload) {
        let kind = payload.kind();
        if let Err(err) = self.sequencer.submit(source, payload) {
            debug!(kind, error = %err, "event not emitted");
        }
    }

    fn persist(&self) {
        if let Some(conversation) = self.sequencer.conversation()
            && self.persist.send(conversation).is_err()
        {
            warn!("persistence worker stopped");
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(SessionSnapshot {
            state: self.session.state(),
            conversation_id: self.session.conversation_id().map(str::to_string),
            turns: self.session.turn_counter(),
        });
    }
}
