//! WebSocket transport.
//!
//! One connection carries one session. The handler pumps frames between the
//! socket and the session actor; the hub tracks which sessions are live.
//!
//! ```text
//!  client ──ws──> handler ── Inbound ──> SessionActor
//!     ▲              │                        │
//!     └──── text ────┴──── SessionOutput <────┘
//! ```

mod handler;
mod hub;

pub use handler::ws_handler;
pub use hub::{SessionHub, SessionSummary};
