pub mod community;

pub use community::{
    CommunityStatus, CommunitySummary, ErrorResponse, LaunchingCommunity, MemberCount,
    OperatorStats, ServerSummary, TotalEarnings,
};
