//! Wire protocol types for Convoy agent sessions.
//!
//! This crate defines every message that crosses the client connection and the
//! history records folded from it:
//!
//! ```text
//! Client --[ClientMessage]--> Session --[ServerEvent stream]--> Client
//!                                |
//!                                +--[fold]--> Conversation { Message, ... }
//! ```
//!
//! ## Design Principles
//!
//! 1. **Closed vocabularies.** Client messages and server events are tagged enums
//!    discriminated by a `type` field; handlers match on them exhaustively.
//! 2. **Events are ordered, messages are durable.** Events carry a session-local
//!    `seq`. Messages are what survives into a stored conversation.
//! 3. **Validation at the edge.** Parsing a client frame never panics; malformed
//!    input becomes a [`ProtocolError`] the session can report and survive.

pub mod client;
pub mod error;
pub mod events;
pub mod messages;

pub use client::ClientMessage;
pub use error::ProtocolError;
pub use events::{EventPayload, ResultFormat, ServerEvent, SessionStatus, StepStatus};
pub use messages::{ChartInfo, ContentFilterDetails, Conversation, Message, RetryInfo, Role};
