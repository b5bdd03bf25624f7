//! Community registry owned by the lifecycle manager.
//!
//! The registry maps a community address to its [`CommunityState`]. An
//! address without an entry is unowned. Only the manager task mutates the
//! registry; everyone else sees [`CommunitySnapshot`]s.

pub mod pending;

use crate::operator::OperatorHandle;
use crate::processors::lifecycle_manager::ManagerError;
use async_trait::async_trait;
use cps_sdk::Address;
use cps_sdk::objects::{
    CommunityStatus, CommunitySummary, LaunchingCommunity, OperatorStats,
};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;

pub use pending::{PendingStart, PendingStarts, RunningInfo, StartOutcome};

/// Lifecycle phase of a tracked community.
///
/// The operator handle only exists in the `Running` phase. While
/// `handing_over` is set the operator is being shut down and the entry is
/// about to go away.
#[derive(Clone)]
pub enum CommunityPhase {
    Launching,
    Running {
        operator: Arc<dyn OperatorHandle>,
        join_part_stream_id: String,
        handing_over: bool,
    },
}

/// Registry entry for one community.
#[derive(Clone)]
pub struct CommunityState {
    pub address: Address,
    /// When the event that triggered the launch was handled.
    pub event_detected_at: OffsetDateTime,
    pub phase: CommunityPhase,
}

impl CommunityState {
    pub fn status(&self) -> CommunityStatus {
        match self.phase {
            CommunityPhase::Launching => CommunityStatus::Launching,
            CommunityPhase::Running { .. } => CommunityStatus::Running,
        }
    }

    pub fn operator(&self) -> Option<&Arc<dyn OperatorHandle>> {
        match &self.phase {
            CommunityPhase::Launching => None,
            CommunityPhase::Running { operator, .. } => Some(operator),
        }
    }

    fn view(&self) -> CommunityView {
        let join_part_stream_id = match &self.phase {
            CommunityPhase::Launching => None,
            CommunityPhase::Running {
                join_part_stream_id,
                ..
            } => Some(join_part_stream_id.clone()),
        };
        CommunityView {
            address: self.address,
            status: self.status(),
            event_detected_at: self.event_detected_at,
            join_part_stream_id,
            operator: self.operator().cloned(),
        }
    }
}

/// Registry entry as handed out by the manager.
///
/// Holds the operator handle so that stats can be sampled away from the
/// manager task.
#[derive(Clone)]
pub struct CommunityView {
    pub address: Address,
    pub status: CommunityStatus,
    pub event_detected_at: OffsetDateTime,
    pub join_part_stream_id: Option<String>,
    operator: Option<Arc<dyn OperatorHandle>>,
}

impl CommunityView {
    /// Read the operator's stats and produce a snapshot.
    pub async fn sample(self) -> CommunitySnapshot {
        let stats = match &self.operator {
            Some(operator) => Some(operator.stats().await),
            None => None,
        };
        CommunitySnapshot {
            address: self.address,
            status: self.status,
            event_detected_at: self.event_detected_at,
            join_part_stream_id: self.join_part_stream_id,
            stats,
        }
    }
}

/// Read-only copy of a registry entry, with operator stats sampled at the
/// time the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunitySnapshot {
    pub address: Address,
    pub status: CommunityStatus,
    pub event_detected_at: OffsetDateTime,
    pub join_part_stream_id: Option<String>,
    pub stats: Option<OperatorStats>,
}

impl CommunitySnapshot {
    /// Summary as served by the status API; launching communities report
    /// zero members and earnings.
    pub fn summary(&self) -> CommunitySummary {
        match (self.status, &self.stats) {
            (CommunityStatus::Running, Some(stats)) => {
                CommunitySummary::running(stats.clone(), self.join_part_stream_id.clone())
            }
            _ => CommunitySummary::launching(),
        }
    }

    pub fn launching_info(&self) -> LaunchingCommunity {
        LaunchingCommunity {
            state: self.status,
            event_detected_at: (self.event_detected_at.unix_timestamp_nanos() / 1_000_000) as i64,
        }
    }
}

/// Address → state mapping.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<Address, CommunityState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &Address) -> Option<&CommunityState> {
        self.entries.get(address)
    }

    /// Create a launching entry. Returns `false` (and changes nothing) if the
    /// address already has an entry.
    pub fn insert_launching(&mut self, address: Address, event_detected_at: OffsetDateTime) -> bool {
        if self.entries.contains_key(&address) {
            return false;
        }
        self.entries.insert(
            address,
            CommunityState {
                address,
                event_detected_at,
                phase: CommunityPhase::Launching,
            },
        );
        true
    }

    /// Move a launching entry to running. Returns `false` if there is no
    /// launching entry for the address.
    pub fn mark_running(
        &mut self,
        address: Address,
        operator: Arc<dyn OperatorHandle>,
        join_part_stream_id: String,
    ) -> bool {
        match self.entries.get_mut(&address) {
            Some(state) if matches!(state.phase, CommunityPhase::Launching) => {
                state.phase = CommunityPhase::Running {
                    operator,
                    join_part_stream_id,
                    handing_over: false,
                };
                true
            }
            _ => false,
        }
    }

    /// Flag a running entry as handing over and return its operator. `None`
    /// if the entry is not running or a handover is already under way.
    pub fn begin_handover(&mut self, address: &Address) -> Option<Arc<dyn OperatorHandle>> {
        match self.entries.get_mut(address).map(|state| &mut state.phase) {
            Some(CommunityPhase::Running {
                operator,
                handing_over,
                ..
            }) if !*handing_over => {
                *handing_over = true;
                Some(Arc::clone(operator))
            }
            _ => None,
        }
    }

    /// Clear the handover flag after a failed shutdown.
    pub fn cancel_handover(&mut self, address: &Address) {
        if let Some(CommunityPhase::Running { handing_over, .. }) =
            self.entries.get_mut(address).map(|state| &mut state.phase)
        {
            *handing_over = false;
        }
    }

    pub fn remove(&mut self, address: &Address) -> Option<CommunityState> {
        self.entries.remove(address)
    }

    pub fn view(&self, address: &Address) -> Option<CommunityView> {
        self.entries.get(address).map(CommunityState::view)
    }

    /// Views of every entry, ordered by address.
    pub fn views(&self) -> Vec<CommunityView> {
        let mut views: Vec<_> = self.entries.values().map(CommunityState::view).collect();
        views.sort_by_key(|v| v.address);
        views
    }

    /// Drain every running operator, leaving launching entries in place.
    pub fn take_running(&mut self) -> Vec<(Address, Arc<dyn OperatorHandle>)> {
        let running: Vec<Address> = self
            .entries
            .values()
            .filter(|s| s.operator().is_some())
            .map(|s| s.address)
            .collect();
        running
            .into_iter()
            .filter_map(|address| {
                let state = self.entries.remove(&address)?;
                match state.phase {
                    CommunityPhase::Running { operator, .. } => Some((address, operator)),
                    CommunityPhase::Launching => None,
                }
            })
            .collect()
    }
}

/// Read-only access to the registry, as needed by the status API.
#[async_trait]
pub trait CommunityDirectory: Send + Sync {
    async fn communities(&self) -> Result<Vec<CommunitySnapshot>, ManagerError>;

    async fn community(&self, address: Address) -> Result<Option<CommunitySnapshot>, ManagerError>;
}
