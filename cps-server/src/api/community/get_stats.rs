use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};

use super::{CommunityApiError, running_community};
use crate::state::AppState;

/// `GET /communities/{address}/stats`: member count and total earnings.
pub(super) async fn get_stats(
    state: State<AppState>,
    Path(address): Path<String>,
) -> Result<impl IntoResponse, CommunityApiError> {
    let snapshot = running_community(&state, &address).await?;
    Ok(Json(snapshot.stats.unwrap_or_default()))
}
