//! OperatorEventFeed processor.
//!
//! Feeds `OperatorChanged` events into the lifecycle manager:
//!
//! 1. Replay: every event up to the current head block that named our
//!    operator address is fetched and processed strictly in order. The first
//!    error aborts startup.
//! 2. Tail: a live subscription on all `OperatorChanged` events from the
//!    block after that head on, so that handovers to other operators are seen
//!    too and nothing mined during replay is missed. Each live event is
//!    processed in its own task; errors are logged and the tail keeps going.

use super::lifecycle_manager::{ManagerError, ManagerHandle};
use crate::chain::{EventSource, LogSubscription, RawLog};
use crate::events::{OperatorChanged, live_filter, replay_filter};
use kanau::processor::Processor;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct OperatorEventFeed {
    source: Arc<dyn EventSource>,
    manager: ManagerHandle,
}

impl OperatorEventFeed {
    pub fn new(source: Arc<dyn EventSource>, manager: ManagerHandle) -> Self {
        Self { source, manager }
    }

    /// Process every `OperatorChanged` event up to block `head` naming our
    /// operator, one after another. Returns the number of events processed.
    pub async fn replay(&self, head: u64) -> Result<usize, ManagerError> {
        let operator = self.manager.operator_address();
        let logs = self
            .source
            .logs(&replay_filter(operator, head))
            .await
            .map_err(ManagerError::Subscription)?;

        info!(
            operator = %operator,
            head,
            count = logs.len(),
            "Replaying past OperatorChanged events"
        );

        for log in &logs {
            let event = OperatorChanged::try_from(log)?;
            let outcome = self.manager.process(event).await?;
            debug!(
                community = %event.contract_address,
                block = event.block_number,
                outcome = ?outcome,
                "Replayed OperatorChanged event"
            );
        }

        Ok(logs.len())
    }

    /// Replay history, then subscribe to live events and spawn the tail.
    ///
    /// Returns once replay is complete and the subscription is established.
    /// The returned task runs until shutdown is signaled or the subscription
    /// ends.
    pub async fn start(self, shutdown_rx: watch::Receiver<bool>) -> Result<JoinHandle<()>, ManagerError> {
        let head = self
            .source
            .head_block()
            .await
            .map_err(ManagerError::Subscription)?;
        let replayed = self.replay(head).await?;
        let subscription = self
            .source
            .subscribe(live_filter(head + 1))
            .await
            .map_err(ManagerError::Subscription)?;

        info!(
            replayed,
            from_block = head + 1,
            "Replay complete, listening for OperatorChanged events"
        );

        Ok(tokio::spawn(tail(self.manager, subscription, shutdown_rx)))
    }
}

async fn tail(
    manager: ManagerHandle,
    mut subscription: LogSubscription,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("OperatorEventFeed received shutdown signal");
                    break;
                }
            }

            log = subscription.next() => {
                match log {
                    Some(log) => dispatch(&manager, log),
                    None => {
                        warn!("Live OperatorChanged subscription ended");
                        break;
                    }
                }
            }
        }
    }

    info!("OperatorEventFeed stopped");
}

fn dispatch(manager: &ManagerHandle, log: RawLog) {
    let event = match OperatorChanged::try_from(&log) {
        Ok(event) => event,
        Err(e) => {
            warn!(
                contract = %log.address,
                tx = ?log.transaction_hash,
                error = %e,
                "Skipping undecodable OperatorChanged log"
            );
            return;
        }
    };

    let manager = manager.clone();
    tokio::spawn(async move {
        match manager.process(event).await {
            Ok(outcome) => debug!(
                community = %event.contract_address,
                outcome = ?outcome,
                "Handled OperatorChanged event"
            ),
            Err(e) => error!(
                community = %event.contract_address,
                error = %e,
                "Failed to handle OperatorChanged event"
            ),
        }
    });
}
