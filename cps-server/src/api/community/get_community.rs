use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};

use super::{CommunityApiError, running_community};
use crate::state::AppState;

/// `GET /communities/{address}`: summary of one running community.
pub(super) async fn get_community(
    state: State<AppState>,
    Path(address): Path<String>,
) -> Result<impl IntoResponse, CommunityApiError> {
    let snapshot = running_community(&state, &address).await?;
    Ok(Json(snapshot.summary()))
}
