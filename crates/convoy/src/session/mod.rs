//! Session core.
//!
//! One session per client connection. The actor task owns the lifecycle,
//! spawns one task per turn and funnels every event through the session's
//! [`EventSequencer`].
//!
//! ```text
//!  Inbound ──> SessionActor ──spawn──> turn task (RetryController -> Agent)
//!                  │                        │
//!                  │ controller events      │ collaborator events (gated)
//!                  └───────> EventSequencer <┘
//!                                 │
//!                           SessionOutput ──> transport
//! ```

mod actor;
mod cancel;
mod retry;
mod sequencer;
mod state;

use std::sync::Arc;
use std::time::Duration;

use crate::agent::{Agent, ContentFilter};
use crate::history::ConversationStore;

pub use actor::{Inbound, SessionHandle, SessionOutput, SessionSnapshot, spawn_session};
pub use cancel::{ActiveTurn, CancellationController, TurnSignal};
pub use retry::{RetryController, RetryPhase, TurnOutcome};
pub use sequencer::{EventSequencer, OutboundStream, Source, SubmitError};
pub use state::{CancelRequest, Session, SessionError, SessionState};

/// Per-session limits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Step budget per turn, retries included.
    pub max_turns: u32,
    /// Content-filter regenerations per turn.
    pub max_retries: u32,
    /// How long a cancelled turn may take to stop.
    pub cancel_grace: Duration,
    /// Sequencer queue bound before intermediate events are shed.
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            max_retries: 3,
            cancel_grace: Duration::from_secs(5),
            outbound_capacity: 256,
        }
    }
}

/// External components a session drives.
#[derive(Clone)]
pub struct Collaborators {
    pub agent: Arc<dyn Agent>,
    pub filter: Arc<dyn ContentFilter>,
    pub store: Arc<dyn ConversationStore>,
}

impl Collaborators {
    pub fn new(
        agent: Arc<dyn Agent>,
        filter: Arc<dyn ContentFilter>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            agent,
            filter,
            store,
        }
    }
}
