//! Session lifecycle state machine.
//!
//! Pure bookkeeping: no I/O, no events. The actor consults it before acting and
//! emits the matching status events itself.

use serde::Serialize;
use thiserror::Error;

/// Lifecycle of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connected,
    Idle,
    Processing,
    Cancelling,
    Disconnecting,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Idle => write!(f, "idle"),
            Self::Processing => write!(f, "processing"),
            Self::Cancelling => write!(f, "cancelling"),
            Self::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("a turn is already in progress")]
    TurnInProgress,

    #[error("session is bound to conversation {bound}, not {requested}")]
    ConversationMismatch { bound: String, requested: String },

    #[error("session is disconnecting")]
    Disconnected,

    #[error("cannot {action} while {from}")]
    InvalidTransition {
        from: SessionState,
        action: &'static str,
    },
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelRequest {
    /// Processing -> Cancelling. The caller must broadcast cancellation.
    Started,
    /// Nothing to cancel.
    NotProcessing,
    /// A cancellation is already underway.
    AlreadyCancelling,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    state: SessionState,
    conversation_id: Option<String>,
    turn_counter: u32,
    max_turns: u32,
}

impl Session {
    pub fn new(id: impl Into<String>, max_turns: u32) -> Self {
        Self {
            id: id.into(),
            state: SessionState::Connected,
            conversation_id: None,
            turn_counter: 0,
            max_turns,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Turns started so far. Also the id of the latest turn.
    pub fn turn_counter(&self) -> u32 {
        self.turn_counter
    }

    pub fn max_turns(&self) -> u32 {
        self.max_turns
    }

    /// Connected -> Idle.
    pub fn open(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Connected => {
                self.state = SessionState::Idle;
                Ok(())
            }
            from => Err(self.invalid(from, "open")),
        }
    }

    /// Whether a chat may start a turn now.
    pub fn check_can_start(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle => Ok(()),
            SessionState::Processing | SessionState::Cancelling => {
                Err(SessionError::TurnInProgress)
            }
            SessionState::Disconnecting => Err(SessionError::Disconnected),
            from => Err(self.invalid(from, "start a turn")),
        }
    }

    /// Check a requested conversation against the binding.
    ///
    /// Returns the bound id, or `None` when the session is not bound yet.
    pub fn resolve_conversation(
        &self,
        requested: Option<&str>,
    ) -> Result<Option<String>, SessionError> {
        match (&self.conversation_id, requested) {
            (Some(bound), Some(requested)) if bound != requested => {
                Err(SessionError::ConversationMismatch {
                    bound: bound.clone(),
                    requested: requested.to_string(),
                })
            }
            (Some(bound), _) => Ok(Some(bound.clone())),
            (None, _) => Ok(None),
        }
    }

    /// Idle -> Processing. Binds the conversation on the first turn and returns
    /// the new turn id.
    pub fn begin_turn(&mut self, conversation_id: &str) -> Result<u32, SessionError> {
        self.check_can_start()?;
        self.resolve_conversation(Some(conversation_id))?;
        if self.conversation_id.is_none() {
            self.conversation_id = Some(conversation_id.to_string());
        }
        self.turn_counter += 1;
        self.state = SessionState::Processing;
        Ok(self.turn_counter)
    }

    /// Processing -> Cancelling.
    pub fn begin_cancel(&mut self) -> CancelRequest {
        match self.state {
            SessionState::Processing => {
                self.state = SessionState::Cancelling;
                CancelRequest::Started
            }
            SessionState::Cancelling => CancelRequest::AlreadyCancelling,
            _ => CancelRequest::NotProcessing,
        }
    }

    /// Processing -> Idle.
    pub fn finish_turn(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Processing => {
                self.state = SessionState::Idle;
                Ok(())
            }
            from => Err(self.invalid(from, "finish a turn")),
        }
    }

    /// Cancelling -> Idle.
    pub fn finish_cancel(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Cancelling => {
                self.state = SessionState::Idle;
                Ok(())
            }
            from => Err(self.invalid(from, "finish cancelling")),
        }
    }

    /// Any -> Disconnecting. Terminal.
    pub fn close(&mut self) {
        self.state = SessionState::Disconnecting;
    }

    fn invalid(&self, from: SessionState, action: &'static str) -> SessionError {
        if from == SessionState::Disconnecting {
            SessionError::Disconnected
        } else {
            SessionError::InvalidTransition { from, action }
        }
    }
}
