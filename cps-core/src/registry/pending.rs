//! Single-flight table of outstanding operator startups.
//!
//! Each address maps to a `watch` slot that starts out empty and is settled
//! exactly once with the startup outcome. Every caller asking whether the
//! community is running gets a receiver on the same slot, so all of them see
//! the same value, and asking never starts anything.

use crate::processors::lifecycle_manager::StartupError;
use cps_sdk::Address;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// What waiters learn once a community is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningInfo {
    pub address: Address,
    pub join_part_stream_id: String,
}

/// Settled value of a pending startup.
pub type StartOutcome = Result<RunningInfo, Arc<StartupError>>;

type Slot = watch::Sender<Option<StartOutcome>>;

#[derive(Default)]
pub struct PendingStarts {
    slots: HashMap<Address, Slot>,
}

impl PendingStarts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle on the slot for `address`, creating an unsettled one if none
    /// exists yet.
    pub fn await_running(&mut self, address: Address) -> PendingStart {
        let slot = self
            .slots
            .entry(address)
            .or_insert_with(|| watch::channel(None).0);
        PendingStart {
            address,
            rx: slot.subscribe(),
        }
    }

    /// Prepare the slot for a new startup attempt.
    ///
    /// An unsettled slot is kept so that callers who asked before the start
    /// was triggered receive its outcome; a settled one belongs to an earlier
    /// attempt and is replaced.
    pub fn begin(&mut self, address: Address) {
        let reusable = self
            .slots
            .get(&address)
            .is_some_and(|slot| slot.borrow().is_none());
        if !reusable {
            self.slots.insert(address, watch::channel(None).0);
        }
    }

    /// Settle the slot for `address`. Waiters are woken; later callers of
    /// [`await_running`](Self::await_running) get the settled value directly.
    pub fn settle(&mut self, address: Address, outcome: StartOutcome) {
        if let Some(slot) = self.slots.get(&address) {
            slot.send_replace(Some(outcome));
        }
    }

    /// Drop the slot, e.g. after the community was handed over.
    pub fn forget(&mut self, address: &Address) {
        self.slots.remove(address);
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, address: &Address) -> bool {
        self.slots.contains_key(address)
    }
}

/// A waiter on one startup slot.
pub struct PendingStart {
    address: Address,
    rx: watch::Receiver<Option<StartOutcome>>,
}

impl PendingStart {
    pub fn address(&self) -> Address {
        self.address
    }

    /// Wait for the startup to settle.
    ///
    /// Resolves to [`StartupError::Abandoned`] if the manager goes away before
    /// the slot is settled.
    pub async fn wait(mut self) -> StartOutcome {
        loop {
            if let Some(outcome) = self.rx.borrow_and_update().as_ref() {
                return outcome.clone();
            }
            if self.rx.changed().await.is_err() {
                let last = self.rx.borrow().clone();
                return last.unwrap_or_else(|| Err(Arc::new(StartupError::Abandoned(self.address))));
            }
        }
    }
}
