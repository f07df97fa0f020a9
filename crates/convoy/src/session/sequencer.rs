//! Per-session event ordering.
//!
//! Every sequenced event a session emits passes through one [`EventSequencer`].
//! Submission assigns `seq` and a monotonic timestamp, folds the event into the
//! conversation history and enqueues it for the transport, all under a single
//! lock. The queue therefore defines the one total order that both the client
//! and the history observe.
//!
//! ```text
//!   collaborators ──┐
//!   controller ─────┼──> submit ──> [seq, ts] ──> history fold
//!   session ────────┘                        └──> bounded queue ──> OutboundStream
//! ```
//!
//! The queue is bounded. When it is full, the oldest *sheddable* event
//! (agent_step, tool_call, tool_result, progress) is dropped. Lifecycle,
//! recovery and terminal events are never dropped.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use convoy_protocol::{Conversation, EventPayload, ServerEvent, SessionStatus};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::history::{ConversationAccumulator, HistoryEntry};

/// Who is submitting an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Session-level event, not part of any turn.
    Session,
    /// Collaborator work for the given turn. Rejected once the turn is sealed.
    Collaborator(u32),
    /// The session controller reporting on the given turn. Never gated.
    Controller(u32),
}

impl Source {
    fn turn_id(self) -> Option<u32> {
        match self {
            Self::Session => None,
            Self::Collaborator(turn) | Self::Controller(turn) => Some(turn),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("session is disconnecting")]
    Closed,

    #[error("turn {0} no longer accepts collaborator events")]
    TurnSealed(u32),
}

#[derive(Debug, Default)]
struct TurnGate {
    current: Option<u32>,
    sealed: bool,
}

impl TurnGate {
    fn admits(&self, turn: u32) -> bool {
        self.current == Some(turn) && !self.sealed
    }
}

struct SequencerState {
    next_seq: u64,
    last_timestamp: Option<DateTime<Utc>>,
    queue: VecDeque<ServerEvent>,
    gate: TurnGate,
    closed: bool,
    shed: u64,
    history: Option<ConversationAccumulator>,
}

impl SequencerState {
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }

    fn enqueue(&mut self, event: ServerEvent, capacity: usize) {
        if self.queue.len() >= capacity
            && let Some(pos) = self.queue.iter().position(|e| e.payload.is_sheddable())
            && let Some(dropped) = self.queue.remove(pos)
        {
            self.shed += 1;
            debug!(
                seq = ?dropped.seq,
                kind = dropped.kind(),
                shed_total = self.shed,
                "outbound queue full, shedding event"
            );
        }
        self.queue.push_back(event);
    }
}

struct Shared {
    state: Mutex<SequencerState>,
    ready: Notify,
    capacity: usize,
}

/// Producer side. Cheap to clone; all clones feed the same stream.
#[derive(Clone)]
pub struct EventSequencer {
    shared: Arc<Shared>,
}

impl EventSequencer {
    /// Create a sequencer and the single stream that drains it.
    pub fn new(capacity: usize) -> (Self, OutboundStream) {
        let shared = Arc::new(Shared {
            state: Mutex::new(SequencerState {
                next_seq: 1,
                last_timestamp: None,
                queue: VecDeque::with_capacity(capacity.min(1024)),
                gate: TurnGate::default(),
                closed: false,
                shed: 0,
                history: None,
            }),
            ready: Notify::new(),
            capacity: capacity.max(1),
        });
        (
            Self {
                shared: shared.clone(),
            },
            OutboundStream { shared },
        )
    }

    /// Sequence and enqueue an event. Returns the assigned `seq`.
    pub fn submit(&self, source: Source, payload: EventPayload) -> Result<u64, SubmitError> {
        let seq = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(SubmitError::Closed);
            }
            if let Source::Collaborator(turn) = source
                && !state.gate.admits(turn)
            {
                trace!(turn, kind = payload.kind(), "dropping event for closed turn");
                return Err(SubmitError::TurnSealed(turn));
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            let event = ServerEvent {
                seq: Some(seq),
                turn_id: source.turn_id(),
                timestamp: state.stamp(),
                payload,
            };
            if let Some(history) = state.history.as_mut() {
                history.append(&HistoryEntry::Event(event.clone()));
            }
            state.enqueue(event, self.shared.capacity);
            seq
        };
        self.shared.ready.notify_one();
        Ok(seq)
    }

    /// Start admitting collaborator events for `turn`.
    pub fn open_turn(&self, turn: u32) {
        let mut state = self.shared.state.lock();
        state.gate = TurnGate {
            current: Some(turn),
            sealed: false,
        };
    }

    /// Stop admitting collaborator events for `turn`. Controller events still pass.
    pub fn seal_turn(&self, turn: u32) {
        let mut state = self.shared.state.lock();
        if state.gate.current == Some(turn) {
            state.gate.sealed = true;
        }
    }

    /// Forget `turn` entirely.
    pub fn close_turn(&self, turn: u32) {
        let mut state = self.shared.state.lock();
        if state.gate.current == Some(turn) {
            state.gate = TurnGate::default();
        }
    }

    /// Whether collaborator events for `turn` are still admitted.
    pub fn admits(&self, turn: u32) -> bool {
        let state = self.shared.state.lock();
        !state.closed && state.gate.admits(turn)
    }

    /// Start folding events into `history`.
    pub fn attach_history(&self, history: ConversationAccumulator) {
        self.shared.state.lock().history = Some(history);
    }

    /// Record the user's request for `turn`, ordered against the event stream.
    pub fn record_user(&self, turn: u32, content: &str) {
        let mut state = self.shared.state.lock();
        let timestamp = state.stamp();
        if let Some(history) = state.history.as_mut() {
            history.append(&HistoryEntry::User {
                turn_id: turn,
                content: content.to_string(),
                timestamp,
            });
        }
    }

    /// Copy of the folded conversation, if one is attached.
    pub fn conversation(&self) -> Option<Conversation> {
        let state = self.shared.state.lock();
        state.history.as_ref().map(ConversationAccumulator::snapshot)
    }

    /// Number of events shed because the consumer fell behind.
    pub fn shed_count(&self) -> u64 {
        self.shared.state.lock().shed
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Announce `disconnecting` after everything already queued and end the stream
    /// once the consumer has drained it.
    ///
    /// Further submissions fail with [`SubmitError::Closed`].
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            let pending = state.queue.len();
            if pending > 0 {
                debug!(pending, "closing with undelivered events queued");
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            let timestamp = state.stamp();
            state.queue.push_back(ServerEvent {
                seq: Some(seq),
                turn_id: None,
                timestamp,
                payload: EventPayload::status(SessionStatus::Disconnecting),
            });
            state.gate = TurnGate::default();
            state.closed = true;
        }
        self.shared.ready.notify_one();
    }
}

/// Consumer side. Exactly one per sequencer.
pub struct OutboundStream {
    shared: Arc<Shared>,
}

impl OutboundStream {
    /// Next event in order, or `None` once the sequencer is closed and drained.
    pub async fn next(&mut self) -> Option<ServerEvent> {
        loop {
            {
                let mut state = self.shared.state.lock();
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.shared.ready.notified().await;
        }
    }

    /// Non-blocking variant of [`next`](Self::next).
    pub fn try_next(&mut self) -> Option<ServerEvent> {
        self.shared.state.lock().queue.pop_front()
    }
}
