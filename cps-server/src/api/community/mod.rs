//! Community status handlers.
//!
//! Every route is served under both `/communities` and the older
//! `/dataunions` prefix.
//!
//! # Endpoints
//!
//! - `GET /communities`                   – summary of every tracked community
//! - `GET /communities/{address}`         – summary of one running community
//! - `GET /communities/{address}/stats`   – member count and earnings

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use cps_core::processors::ManagerError;
use cps_core::registry::CommunitySnapshot;
use cps_sdk::Address;
use cps_sdk::objects::{CommunityStatus, ErrorResponse};

use crate::state::AppState;

mod get_community;
mod get_stats;
mod summary;

/// Build the community router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/communities", get(summary::get_summary))
        .route("/dataunions", get(summary::get_summary))
        .route("/communities/{address}", get(get_community::get_community))
        .route("/dataunions/{address}", get(get_community::get_community))
        .route("/communities/{address}/stats", get(get_stats::get_stats))
        .route("/dataunions/{address}/stats", get(get_stats::get_stats))
}

// ---------------------------------------------------------------------------
// Error handling
// ---------------------------------------------------------------------------

/// Errors that can occur in community handlers.
#[derive(Debug)]
enum CommunityApiError {
    /// The path segment is not an Ethereum address.
    BadAddress(String),
    /// No registry entry for the address.
    NotOperating(Address),
    /// The operator is still starting.
    Launching(CommunitySnapshot),
    /// The lifecycle manager is gone (shutting down).
    ManagerUnavailable(ManagerError),
}

impl IntoResponse for CommunityApiError {
    fn into_response(self) -> Response {
        match self {
            CommunityApiError::BadAddress(input) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(format!("Bad Ethereum address: {input}"))),
            )
                .into_response(),
            CommunityApiError::NotOperating(address) => (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::new(format!(
                    "We're not operating the community @ {address}"
                ))),
            )
                .into_response(),
            CommunityApiError::Launching(snapshot) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: format!("Community is being started @ {}", snapshot.address),
                    community: Some(snapshot.launching_info()),
                }),
            )
                .into_response(),
            CommunityApiError::ManagerUnavailable(e) => {
                tracing::warn!(error = %e, "Community API: lifecycle manager unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(ErrorResponse::new("server is shutting down")),
                )
                    .into_response()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Resolve the `{address}` path segment to a running community.
async fn running_community(
    state: &AppState,
    raw: &str,
) -> Result<CommunitySnapshot, CommunityApiError> {
    let address: Address = raw
        .parse()
        .map_err(|_| CommunityApiError::BadAddress(raw.to_string()))?;

    let snapshot = state
        .directory
        .community(address)
        .await
        .map_err(CommunityApiError::ManagerUnavailable)?
        .ok_or(CommunityApiError::NotOperating(address))?;

    match snapshot.status {
        CommunityStatus::Launching => Err(CommunityApiError::Launching(snapshot)),
        CommunityStatus::Running => Ok(snapshot),
    }
}
