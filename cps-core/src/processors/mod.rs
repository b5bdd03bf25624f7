//! Event processors for the event-driven architecture.
//!
//! This module contains the processors that keep community operators in line
//! with the chain:
//!
//! - `LifecycleManager`: Receives `OperatorChanged`, starts and stops operators
//! - `OperatorEventFeed`: Replays past events, then tails live ones into the
//!   `LifecycleManager`

pub mod event_feed;
pub mod lifecycle_manager;

#[cfg(test)]
mod testing;

pub use event_feed::OperatorEventFeed;
pub use lifecycle_manager::{
    EventOutcome, LifecycleManager, ManagerError, ManagerHandle, StartupError,
};
