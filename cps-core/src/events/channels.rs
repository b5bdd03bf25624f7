//! Log channel factories and handles.
//!
//! Live log subscriptions deliver [`RawLog`]s over a bounded mpsc channel.

use crate::chain::RawLog;
use tokio::sync::mpsc;

/// Default buffer size for log channels.
pub const DEFAULT_CHANNEL_BUFFER: usize = 256;

/// Sender handle for live logs.
pub type LogSender = mpsc::Sender<RawLog>;
/// Receiver handle for live logs.
pub type LogReceiver = mpsc::Receiver<RawLog>;

/// Create a new log channel.
///
/// Returns a (sender, receiver) pair. The subscription driver owns the sender;
/// dropping the receiver tells the driver to stop.
pub fn log_channel() -> (LogSender, LogReceiver) {
    mpsc::channel(DEFAULT_CHANNEL_BUFFER)
}
