//! Chain events consumed by the lifecycle manager.
//!
//! Raw logs are decoded into [`OperatorChanged`] before they reach the
//! manager; everything downstream works with the typed event only.

pub mod channels;
pub mod types;

pub use channels::{DEFAULT_CHANNEL_BUFFER, LogReceiver, LogSender, log_channel};
pub use types::{
    LogParseError, OPERATOR_CHANGED_SIGNATURE, OPERATOR_CHANGED_TOPIC, OperatorChanged,
    live_filter, replay_filter,
};
