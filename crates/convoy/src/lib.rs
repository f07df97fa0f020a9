//! Convoy session server library.
//!
//! Real-time multi-agent sessions over WebSocket: one session actor per
//! connection, strictly ordered event streams, cancellation with a grace
//! period, content-filter retries and deterministic conversation history.

pub mod agent;
pub mod api;
pub mod history;
pub mod session;
pub mod settings;
pub mod ws;
