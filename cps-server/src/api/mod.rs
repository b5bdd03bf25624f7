//! HTTP API.
//!
//! Only read endpoints exist: the registry is driven by chain events, never
//! by requests.

use axum::Router;

use crate::state::AppState;

mod community;

/// Build the API router.
pub fn router() -> Router<AppState> {
    community::router()
}
