//! Status API response types.
//!
//! Field names follow the JSON shape consumed by existing dashboards
//! (`camelCase`, `dataunions` as the summary key).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle state of a tracked community.
///
/// There is no `unowned` variant: an untracked community simply has no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommunityStatus {
    Launching,
    Running,
}

/// Member counts reported by an operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberCount {
    pub total: u64,
    pub active: u64,
    pub inactive: u64,
}

/// Operator-side statistics for a running community.
///
/// `total_earnings` is a decimal string of token base units; it can exceed
/// the range of any native integer type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorStats {
    pub member_count: MemberCount,
    pub total_earnings: String,
}

impl Default for OperatorStats {
    fn default() -> Self {
        Self {
            member_count: MemberCount::default(),
            total_earnings: "0".to_string(),
        }
    }
}

/// `totalEarnings` of a summary entry.
///
/// Running communities report the operator's decimal string; launching ones
/// report a plain number `0`, as older dashboards expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TotalEarnings {
    Amount(String),
    NotStarted(u64),
}

/// One entry of the `GET /communities` summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommunitySummary {
    pub state: CommunityStatus,
    pub member_count: MemberCount,
    pub total_earnings: TotalEarnings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_part_stream_id: Option<String>,
}

impl CommunitySummary {
    pub fn running(stats: OperatorStats, join_part_stream_id: Option<String>) -> Self {
        Self {
            state: CommunityStatus::Running,
            member_count: stats.member_count,
            total_earnings: TotalEarnings::Amount(stats.total_earnings),
            join_part_stream_id,
        }
    }

    pub fn launching() -> Self {
        Self {
            state: CommunityStatus::Launching,
            member_count: MemberCount::default(),
            total_earnings: TotalEarnings::NotStarted(0),
            join_part_stream_id: None,
        }
    }
}

/// Response body of `GET /communities`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSummary {
    /// Base operator configuration shared by every community.
    pub config: serde_json::Value,
    /// Summaries keyed by checksummed community address.
    pub dataunions: BTreeMap<String, CommunitySummary>,
}

/// Minimal view of a community that is still starting up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchingCommunity {
    pub state: CommunityStatus,
    /// Unix timestamp in milliseconds of the event that triggered the launch.
    pub event_detected_at: i64,
}

/// Error body returned by the status API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community: Option<LaunchingCommunity>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            community: None,
        }
    }
}
