//! HTTP API module.
//!
//! Health, session listing, conversation lookup and the WebSocket upgrade.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
