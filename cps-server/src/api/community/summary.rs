use axum::{Json, extract::State, response::IntoResponse};
use cps_sdk::objects::ServerSummary;

use super::CommunityApiError;
use crate::state::AppState;

/// `GET /communities`: summary of every tracked community.
///
/// Launching communities are listed with zero members and earnings.
pub(super) async fn get_summary(
    state: State<AppState>,
) -> Result<impl IntoResponse, CommunityApiError> {
    let snapshots = state
        .directory
        .communities()
        .await
        .map_err(CommunityApiError::ManagerUnavailable)?;

    let dataunions = snapshots
        .iter()
        .map(|snapshot| (snapshot.address.to_checksum(), snapshot.summary()))
        .collect();

    Ok(Json(ServerSummary {
        config: state.operator_config.as_ref().clone(),
        dataunions,
    }))
}
