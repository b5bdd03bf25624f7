//! LifecycleManager processor.
//!
//! The LifecycleManager is responsible for:
//! - Owning the community registry and the pending-start table
//! - Deciding, per `OperatorChanged` event, whether to start, keep or hand
//!   over an operator
//! - Running operator startups and handovers in background tasks and
//!   folding their results back into the registry
//!
//! The manager is an actor: [`LifecycleManager::run`] owns all state and
//! handles one command at a time without awaiting in between, so a registry
//! entry is always created before anything else can look at the address.
//! Other tasks talk to it through a cloneable [`ManagerHandle`].

use crate::chain::{ChainError, ChainReader};
use crate::config::ManagerConfig;
use crate::events::{LogParseError, OperatorChanged};
use crate::operator::{Collaborators, OperatorConfig, OperatorError, OperatorHandle};
use crate::registry::{
    CommunityDirectory, CommunityPhase, CommunitySnapshot, CommunityView, PendingStart,
    PendingStarts, Registry, RunningInfo,
};
use async_trait::async_trait;
use cps_sdk::Address;
use kanau::processor::Processor;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Buffer size of the manager's command channel.
const COMMAND_BUFFER: usize = 256;

/// Errors that can occur while starting an operator.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The contract no longer names us as operator
    #[error("community {community} requests operator {operator}, not a job for me ({ours})")]
    NotAssigned {
        community: Address,
        operator: Address,
        ours: Address,
    },

    /// Re-reading `operator()` failed
    #[error("failed to read operator of community {community}: {source}")]
    ChainRead {
        community: Address,
        #[source]
        source: ChainError,
    },

    /// Channel or store could not be created
    #[error("failed to prepare operator for community {community}: {source}")]
    Collaborator {
        community: Address,
        #[source]
        source: OperatorError,
    },

    /// The operator refused to start
    #[error("operator for community {community} failed to start: {source}")]
    Start {
        community: Address,
        #[source]
        source: OperatorError,
    },

    /// The manager stopped before the startup settled
    #[error("manager stopped before startup of community {0} settled")]
    Abandoned(Address),
}

/// Errors returned to whoever submitted an event or query to the manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Reading `operator()` for the event's community failed
    #[error("failed to read operator of community {community}: {source}")]
    ChainRead {
        community: Address,
        #[source]
        source: ChainError,
    },

    /// The running operator could not be shut down during a handover
    #[error("failed to shut down operator of community {community}: {source}")]
    Handover {
        community: Address,
        #[source]
        source: OperatorError,
    },

    /// A log could not be decoded as `OperatorChanged`
    #[error("undecodable OperatorChanged log: {0}")]
    LogParse(#[from] LogParseError),

    /// Querying or subscribing to logs failed
    #[error("failed to fetch OperatorChanged logs: {0}")]
    Subscription(#[source] ChainError),

    /// The manager task is not running
    #[error("lifecycle manager is not running")]
    Stopped,
}

/// How the manager dealt with one `OperatorChanged` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// We became operator and the operator started.
    Started,
    /// We became operator but the startup failed; the entry stays launching.
    StartFailed,
    /// Another node is operator of a community we don't track.
    Ignored,
    /// A startup or handover for the community is still in progress; the
    /// event was dropped.
    AbuseRejected,
    /// Repeated confirmation of a community we already run.
    Confirmed,
    /// We lost the community and stopped its operator.
    HandedOver,
}

/// What to do with an event, given the registry entry and the on-chain
/// operator.
#[derive(Debug, PartialEq, Eq)]
enum Decision {
    Start,
    Ignore,
    RejectAbuse,
    Confirm,
    Handover,
    /// Assigned back to us while our operator is being shut down: start
    /// again once the handover is done.
    Reclaim,
}

fn decide(existing: Option<&CommunityPhase>, we_should_operate: bool) -> Decision {
    match (existing, we_should_operate) {
        (None, true) => Decision::Start,
        (None, false) => Decision::Ignore,
        (Some(CommunityPhase::Launching), _) => Decision::RejectAbuse,
        (Some(CommunityPhase::Running { handing_over: true, .. }), true) => Decision::Reclaim,
        (Some(CommunityPhase::Running { handing_over: true, .. }), false) => {
            Decision::RejectAbuse
        }
        (Some(CommunityPhase::Running { .. }), true) => Decision::Confirm,
        (Some(CommunityPhase::Running { .. }), false) => Decision::Handover,
    }
}

type EventReply = oneshot::Sender<Result<EventOutcome, ManagerError>>;

/// A successfully started operator, before it is put into the registry.
struct RunningCommunity {
    operator: Arc<dyn OperatorHandle>,
    join_part_stream_id: String,
}

enum Command {
    Decide {
        community: Address,
        on_chain_operator: Address,
        reply: EventReply,
    },
    StartFinished {
        community: Address,
        result: Result<RunningCommunity, StartupError>,
        reply: EventReply,
    },
    HandoverFinished {
        community: Address,
        result: Result<(), OperatorError>,
        reply: EventReply,
    },
    AwaitRunning {
        community: Address,
        reply: oneshot::Sender<PendingStart>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<CommunityView>>,
    },
    Lookup {
        community: Address,
        reply: oneshot::Sender<Option<CommunityView>>,
    },
    #[cfg(test)]
    HasPendingStart {
        community: Address,
        reply: oneshot::Sender<bool>,
    },
}

/// Everything a startup task needs, shared with the manager.
struct StartupContext {
    operator_address: Address,
    chain: Arc<dyn ChainReader>,
    collaborators: Collaborators,
    base_config: Map<String, Value>,
}

impl StartupContext {
    /// Start operating `community`.
    ///
    /// `operator()` is re-read first: the assignment may have changed between
    /// the decision and this task running.
    async fn start_operating(&self, community: Address) -> Result<RunningCommunity, StartupError> {
        let operator = self
            .chain
            .operator(community)
            .await
            .map_err(|source| StartupError::ChainRead { community, source })?;
        if operator != self.operator_address {
            return Err(StartupError::NotAssigned {
                community,
                operator,
                ours: self.operator_address,
            });
        }

        let channel = self
            .collaborators
            .channels
            .channel_for(community)
            .await
            .map_err(|source| StartupError::Collaborator { community, source })?;
        let join_part_stream_id = channel.stream_id().to_string();

        let store = self
            .collaborators
            .stores
            .store_for(community)
            .await
            .map_err(|source| StartupError::Collaborator { community, source })?;
        info!(
            community = %community,
            store = %store.location(),
            "Storing community data"
        );

        let config = OperatorConfig::for_community(&self.base_config, community);
        let mut operator = self.collaborators.operators.build(community, channel, store);
        operator
            .start(&config)
            .await
            .map_err(|source| StartupError::Start { community, source })?;

        Ok(RunningCommunity {
            operator: Arc::from(operator),
            join_part_stream_id,
        })
    }
}

/// The reconciliation core.
///
/// Create with [`LifecycleManager::new`], spawn [`run`](LifecycleManager::run),
/// and feed it events through the returned [`ManagerHandle`].
pub struct LifecycleManager {
    ctx: Arc<StartupContext>,
    registry: Registry,
    pending: PendingStarts,
    command_tx: mpsc::Sender<Command>,
    command_rx: mpsc::Receiver<Command>,
    /// Startups and handovers whose completion has not been folded back yet.
    in_flight: usize,
    /// Events that named us again while our operator was being handed over.
    reclaims: HashMap<Address, EventReply>,
}

impl LifecycleManager {
    pub fn new(
        config: ManagerConfig,
        chain: Arc<dyn ChainReader>,
        collaborators: Collaborators,
    ) -> (Self, ManagerHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = ManagerHandle {
            operator_address: config.operator_address,
            chain: Arc::clone(&chain),
            command_tx: command_tx.clone(),
        };
        let manager = Self {
            ctx: Arc::new(StartupContext {
                operator_address: config.operator_address,
                chain,
                collaborators,
                base_config: config.operator_defaults,
            }),
            registry: Registry::new(),
            pending: PendingStarts::new(),
            command_tx,
            command_rx,
            in_flight: 0,
            reclaims: HashMap::new(),
        };
        (manager, handle)
    }

    /// Run the manager until shutdown is signaled.
    ///
    /// After the signal, new events are refused while in-flight startups and
    /// handovers are allowed to finish. Operators still running at exit are
    /// shut down locally; nothing is handed over on chain.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(operator = %self.ctx.operator_address, "LifecycleManager started");

        let mut stopping = false;
        loop {
            if stopping && self.in_flight == 0 {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown_rx.changed(), if !stopping => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(
                            in_flight = self.in_flight,
                            "LifecycleManager received shutdown signal"
                        );
                        stopping = true;
                    }
                }

                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command, stopping);
                }

                else => break,
            }
        }

        self.release_operators().await;
        info!("LifecycleManager shutdown complete");
    }

    fn handle_command(&mut self, command: Command, stopping: bool) {
        match command {
            Command::Decide {
                community,
                on_chain_operator,
                reply,
            } => {
                if stopping {
                    let _ = reply.send(Err(ManagerError::Stopped));
                    return;
                }
                self.on_operator_changed(community, on_chain_operator, reply);
            }
            Command::StartFinished {
                community,
                result,
                reply,
            } => {
                self.in_flight -= 1;
                self.finish_start(community, result, reply);
            }
            Command::HandoverFinished {
                community,
                result,
                reply,
            } => {
                self.in_flight -= 1;
                self.finish_handover(community, result, reply, stopping);
            }
            Command::AwaitRunning { community, reply } => {
                let _ = reply.send(self.pending.await_running(community));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.registry.views());
            }
            Command::Lookup { community, reply } => {
                let _ = reply.send(self.registry.view(&community));
            }
            #[cfg(test)]
            Command::HasPendingStart { community, reply } => {
                let _ = reply.send(self.pending.contains(&community));
            }
        }
    }

    fn on_operator_changed(&mut self, community: Address, on_chain_operator: Address, reply: EventReply) {
        let we_should_operate = on_chain_operator == self.ctx.operator_address;
        let existing = self.registry.get(&community).map(|state| &state.phase);

        match decide(existing, we_should_operate) {
            Decision::Start => self.launch(community, reply),
            Decision::Ignore => {
                info!(
                    community = %community,
                    operator = %on_chain_operator,
                    "Detected a community for another operator, ignoring"
                );
                let _ = reply.send(Ok(EventOutcome::Ignored));
            }
            Decision::RejectAbuse => self.reject(community, reply),
            Decision::Confirm => {
                info!(
                    community = %community,
                    operator = %on_chain_operator,
                    "Repeated OperatorChanged event"
                );
                let _ = reply.send(Ok(EventOutcome::Confirmed));
            }
            Decision::Handover => match self.registry.begin_handover(&community) {
                Some(operator) => {
                    info!(
                        community = %community,
                        new_operator = %on_chain_operator,
                        "Operator changed, stopping our operator"
                    );
                    self.spawn_handover(community, operator, reply);
                }
                None => self.reject(community, reply),
            },
            Decision::Reclaim => {
                if self.reclaims.contains_key(&community) {
                    self.reject(community, reply);
                    return;
                }
                info!(
                    community = %community,
                    "Operator assigned back to us during handover, restarting afterwards"
                );
                self.reclaims.insert(community, reply);
            }
        }
    }

    fn launch(&mut self, community: Address, reply: EventReply) {
        // Entry first: any later event for this address must see it.
        self.registry
            .insert_launching(community, OffsetDateTime::now_utc());
        self.pending.begin(community);
        info!(community = %community, "Launching operator");
        self.spawn_startup(community, reply);
    }

    fn reject(&self, community: Address, reply: EventReply) {
        error!(
            community = %community,
            "Too rapid OperatorChanged events, previous one still in progress"
        );
        let _ = reply.send(Ok(EventOutcome::AbuseRejected));
    }

    fn spawn_startup(&mut self, community: Address, reply: EventReply) {
        self.in_flight += 1;
        let ctx = Arc::clone(&self.ctx);
        let command_tx = self.command_tx.clone();
        tokio::spawn(async move {
            let result = ctx.start_operating(community).await;
            let _ = command_tx
                .send(Command::StartFinished {
                    community,
                    result,
                    reply,
                })
                .await;
        });
    }

    fn spawn_handover(&mut self, community: Address, operator: Arc<dyn OperatorHandle>, reply: EventReply) {
        self.in_flight += 1;
        let command_tx = self.command_tx.clone();
        tokio::spawn(async move {
            let result = operator.shutdown().await;
            let _ = command_tx
                .send(Command::HandoverFinished {
                    community,
                    result,
                    reply,
                })
                .await;
        });
    }

    fn finish_start(
        &mut self,
        community: Address,
        result: Result<RunningCommunity, StartupError>,
        reply: EventReply,
    ) {
        match result {
            Ok(running) => {
                let info = RunningInfo {
                    address: community,
                    join_part_stream_id: running.join_part_stream_id.clone(),
                };
                self.registry
                    .mark_running(community, running.operator, running.join_part_stream_id);
                self.pending.settle(community, Ok(info));
                info!(community = %community, "Operator running");
                let _ = reply.send(Ok(EventOutcome::Started));
            }
            Err(e) => {
                // The entry is left launching: later events for this address
                // are rejected until the process restarts.
                error!(
                    community = %community,
                    error = %e,
                    "Failed to start operator, community stays launching"
                );
                self.pending.settle(community, Err(Arc::new(e)));
                let _ = reply.send(Ok(EventOutcome::StartFailed));
            }
        }
    }

    fn finish_handover(
        &mut self,
        community: Address,
        result: Result<(), OperatorError>,
        reply: EventReply,
        stopping: bool,
    ) {
        let reclaim = self.reclaims.remove(&community);
        match result {
            Ok(()) => {
                self.registry.remove(&community);
                self.pending.forget(&community);
                info!(community = %community, "Operator shut down, community handed over");
                let _ = reply.send(Ok(EventOutcome::HandedOver));

                if let Some(reclaim) = reclaim {
                    if stopping {
                        let _ = reclaim.send(Err(ManagerError::Stopped));
                    } else {
                        self.launch(community, reclaim);
                    }
                }
            }
            Err(source) => {
                self.registry.cancel_handover(&community);
                error!(
                    community = %community,
                    error = %source,
                    "Failed to shut down operator, keeping community"
                );
                let _ = reply.send(Err(ManagerError::Handover { community, source }));
                // Still running, and ours again.
                if let Some(reclaim) = reclaim {
                    let _ = reclaim.send(Ok(EventOutcome::Confirmed));
                }
            }
        }
    }

    async fn release_operators(&mut self) {
        for (community, operator) in self.registry.take_running() {
            match operator.shutdown().await {
                Ok(()) => debug!(community = %community, "Operator stopped"),
                Err(e) => warn!(
                    community = %community,
                    error = %e,
                    "Failed to stop operator during shutdown"
                ),
            }
        }
    }
}

/// Cloneable client of a running [`LifecycleManager`].
#[derive(Clone)]
pub struct ManagerHandle {
    operator_address: Address,
    chain: Arc<dyn ChainReader>,
    command_tx: mpsc::Sender<Command>,
}

impl ManagerHandle {
    /// The operator address this node acts as.
    pub fn operator_address(&self) -> Address {
        self.operator_address
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(command(reply))
            .await
            .map_err(|_| ManagerError::Stopped)?;
        rx.await.map_err(|_| ManagerError::Stopped)
    }

    /// Handle on the startup of `community`.
    ///
    /// Never triggers a startup; if none is pending, the handle resolves once
    /// a future event starts one.
    pub async fn await_running(&self, community: Address) -> Result<PendingStart, ManagerError> {
        self.request(|reply| Command::AwaitRunning { community, reply })
            .await
    }

    #[cfg(test)]
    async fn has_pending_start(&self, community: Address) -> bool {
        self.request(|reply| Command::HasPendingStart { community, reply })
            .await
            .unwrap_or(false)
    }
}

impl Processor<OperatorChanged> for ManagerHandle {
    type Output = EventOutcome;
    type Error = ManagerError;

    /// Fully handle one event: read the authoritative operator from chain,
    /// let the manager decide, and wait for any startup or handover it
    /// triggered to finish.
    #[tracing::instrument(skip_all, err, fields(community = %event.contract_address))]
    async fn process(&self, event: OperatorChanged) -> Result<EventOutcome, ManagerError> {
        let community = event.contract_address;
        let on_chain_operator = self
            .chain
            .operator(community)
            .await
            .map_err(|source| ManagerError::ChainRead { community, source })?;

        debug!(
            community = %community,
            announced = %event.new_operator,
            on_chain = %on_chain_operator,
            block = event.block_number,
            "Read current operator"
        );

        self.request(|reply| Command::Decide {
            community,
            on_chain_operator,
            reply,
        })
        .await?
    }
}

#[async_trait]
impl CommunityDirectory for ManagerHandle {
    /// Stats are sampled here, after the manager has answered, so slow
    /// operator stores never hold up event handling.
    async fn communities(&self) -> Result<Vec<CommunitySnapshot>, ManagerError> {
        let views = self.request(|reply| Command::Snapshot { reply }).await?;
        let mut snapshots = Vec::with_capacity(views.len());
        for view in views {
            snapshots.push(view.sample().await);
        }
        Ok(snapshots)
    }

    async fn community(&self, address: Address) -> Result<Option<CommunitySnapshot>, ManagerError> {
        let view = self
            .request(|reply| Command::Lookup {
                community: address,
                reply,
            })
            .await?;
        match view {
            Some(view) => Ok(Some(view.sample().await)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::testing::{Harness, address, eventually, idle_operator, me, stranger};
    use std::sync::atomic::Ordering;
    use cps_sdk::objects::CommunityStatus;

    fn event(community: Address, new_operator: Address) -> OperatorChanged {
        OperatorChanged {
            contract_address: community,
            new_operator,
            block_number: 1,
        }
    }

    #[tokio::test]
    async fn test_start_then_repeated_event_is_confirmed() {
        let h = Harness::start();
        let community = address(1);
        h.chain.script(community, &[me()]);

        let outcome = h.handle.process(event(community, me())).await.unwrap();
        assert_eq!(outcome, EventOutcome::Started);

        let snapshot = h.handle.community(community).await.unwrap().unwrap();
        assert_eq!(snapshot.status, CommunityStatus::Running);
        assert_eq!(
            snapshot.join_part_stream_id,
            Some(format!("stream-{community}"))
        );
        let configs = h.operators.configs.lock().unwrap().clone();
        assert_eq!(
            configs[0].contract_address(),
            Some(community.to_checksum().as_str())
        );

        let outcome = h.handle.process(event(community, me())).await.unwrap();
        assert_eq!(outcome, EventOutcome::Confirmed);
        assert_eq!(h.operators.builds(), 1);
        assert_eq!(h.operators.starts(), 1);
    }

    #[tokio::test]
    async fn test_event_while_launching_is_rejected() {
        let h = Harness::start();
        let community = address(2);
        h.chain.script(community, &[me()]);
        let gate = h.operators.gate();

        let first = {
            let handle = h.handle.clone();
            tokio::spawn(async move { handle.process(event(community, me())).await })
        };
        let operators = h.operators.clone();
        eventually(|| operators.builds() == 1).await;

        let snapshot = h.handle.community(community).await.unwrap().unwrap();
        assert_eq!(snapshot.status, CommunityStatus::Launching);

        let second = h.handle.process(event(community, me())).await.unwrap();
        assert_eq!(second, EventOutcome::AbuseRejected);

        gate.add_permits(1);
        assert_eq!(first.await.unwrap().unwrap(), EventOutcome::Started);
        assert_eq!(h.operators.builds(), 1);
        assert_eq!(h.operators.starts(), 1);
    }

    #[tokio::test]
    async fn test_handover_stops_operator_once() {
        let h = Harness::start();
        let community = address(3);
        h.chain.script(community, &[me(), me(), stranger()]);

        assert_eq!(
            h.handle.process(event(community, me())).await.unwrap(),
            EventOutcome::Started
        );
        assert_eq!(
            h.handle.process(event(community, stranger())).await.unwrap(),
            EventOutcome::HandedOver
        );
        assert_eq!(h.operators.shutdowns(), 1);
        assert!(h.handle.community(community).await.unwrap().is_none());

        assert_eq!(
            h.handle.process(event(community, stranger())).await.unwrap(),
            EventOutcome::Ignored
        );
        assert_eq!(h.operators.shutdowns(), 1);
    }

    #[tokio::test]
    async fn test_foreign_community_is_ignored() {
        let h = Harness::start();
        let community = address(4);
        h.chain.script(community, &[stranger()]);

        // What the event claims does not matter, only what the contract says.
        let outcome = h.handle.process(event(community, me())).await.unwrap();
        assert_eq!(outcome, EventOutcome::Ignored);
        assert!(h.handle.communities().await.unwrap().is_empty());
        assert!(!h.handle.has_pending_start(community).await);
        assert_eq!(h.operators.builds(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_handovers_stop_operator_once() {
        let h = Harness::start();
        let community = address(14);
        h.chain.script(community, &[me(), me(), stranger()]);
        h.handle.process(event(community, me())).await.unwrap();
        let gate = h.operators.shutdown_gate();

        let first = {
            let handle = h.handle.clone();
            tokio::spawn(async move { handle.process(event(community, stranger())).await })
        };
        let operators = h.operators.clone();
        eventually(|| operators.shutdown_calls() == 1).await;

        // Same batch, next operator: the handover already under way covers it.
        assert_eq!(
            h.handle.process(event(community, address(0xCC))).await.unwrap(),
            EventOutcome::AbuseRejected
        );
        let snapshot = h.handle.community(community).await.unwrap().unwrap();
        assert_eq!(snapshot.status, CommunityStatus::Running);

        gate.add_permits(1);
        assert_eq!(first.await.unwrap().unwrap(), EventOutcome::HandedOver);
        assert_eq!(h.operators.shutdown_calls(), 1);
        assert_eq!(h.operators.shutdowns(), 1);
        assert!(h.handle.community(community).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reassignment_during_handover_restarts_operator() {
        let h = Harness::start();
        let community = address(15);
        // Start, re-check, handover, back to us, re-check.
        h.chain.script(community, &[me(), me(), stranger(), me()]);
        h.handle.process(event(community, me())).await.unwrap();
        let gate = h.operators.shutdown_gate();

        let handover = {
            let handle = h.handle.clone();
            tokio::spawn(async move { handle.process(event(community, stranger())).await })
        };
        let operators = h.operators.clone();
        eventually(|| operators.shutdown_calls() == 1).await;

        let reassigned = {
            let handle = h.handle.clone();
            tokio::spawn(async move { handle.process(event(community, me())).await })
        };
        let chain = h.chain.clone();
        eventually(|| chain.operator_reads.load(Ordering::SeqCst) == 4).await;
        tokio::task::yield_now().await;

        gate.add_permits(1);
        assert_eq!(handover.await.unwrap().unwrap(), EventOutcome::HandedOver);
        assert_eq!(reassigned.await.unwrap().unwrap(), EventOutcome::Started);

        assert_eq!(h.operators.shutdowns(), 1);
        assert_eq!(h.operators.starts(), 2);
        let snapshot = h.handle.community(community).await.unwrap().unwrap();
        assert_eq!(snapshot.status, CommunityStatus::Running);
    }

    #[tokio::test]
    async fn test_reassignment_during_failed_handover_is_confirmed() {
        let h = Harness::start();
        let community = address(16);
        h.chain.script(community, &[me(), me(), stranger(), me()]);
        h.handle.process(event(community, me())).await.unwrap();
        h.operators.fail_shutdown();
        let gate = h.operators.shutdown_gate();

        let handover = {
            let handle = h.handle.clone();
            tokio::spawn(async move { handle.process(event(community, stranger())).await })
        };
        let operators = h.operators.clone();
        eventually(|| operators.shutdown_calls() == 1).await;
        let reassigned = {
            let handle = h.handle.clone();
            tokio::spawn(async move { handle.process(event(community, me())).await })
        };
        let chain = h.chain.clone();
        eventually(|| chain.operator_reads.load(Ordering::SeqCst) == 4).await;
        tokio::task::yield_now().await;

        gate.add_permits(1);
        assert!(matches!(
            handover.await.unwrap(),
            Err(ManagerError::Handover { .. })
        ));
        assert_eq!(reassigned.await.unwrap().unwrap(), EventOutcome::Confirmed);
        assert_eq!(h.operators.starts(), 1);
        let snapshot = h.handle.community(community).await.unwrap().unwrap();
        assert_eq!(snapshot.status, CommunityStatus::Running);
    }

    #[tokio::test]
    async fn test_startup_failure_leaves_community_launching() {
        let h = Harness::start();
        let community = address(5);
        h.chain.script(community, &[me()]);
        h.operators.missing_stream(community);

        let waiter = h.handle.await_running(community).await.unwrap();
        let outcome = h.handle.process(event(community, me())).await.unwrap();
        assert_eq!(outcome, EventOutcome::StartFailed);

        let err = waiter.wait().await.unwrap_err();
        assert!(matches!(
            *err,
            StartupError::Collaborator {
                source: OperatorError::StreamNotFound { .. },
                ..
            }
        ));

        let snapshot = h.handle.community(community).await.unwrap().unwrap();
        assert_eq!(snapshot.status, CommunityStatus::Launching);
        assert_eq!(
            h.handle.process(event(community, me())).await.unwrap(),
            EventOutcome::AbuseRejected
        );
        assert_eq!(h.operators.builds(), 0);
    }

    #[tokio::test]
    async fn test_startup_rechecks_operator() {
        let h = Harness::start();
        let community = address(6);
        h.chain.script(community, &[me(), stranger()]);

        let waiter = h.handle.await_running(community).await.unwrap();
        let outcome = h.handle.process(event(community, me())).await.unwrap();
        assert_eq!(outcome, EventOutcome::StartFailed);
        assert!(matches!(
            *waiter.wait().await.unwrap_err(),
            StartupError::NotAssigned { operator, .. } if operator == stranger()
        ));
        assert_eq!(h.operators.builds(), 0);
    }

    #[tokio::test]
    async fn test_chain_read_error_is_reported() {
        let h = Harness::start();
        let community = address(7);
        h.chain.fail_reads_for(community);

        let err = h.handle.process(event(community, me())).await.unwrap_err();
        assert!(matches!(err, ManagerError::ChainRead { community: c, .. } if c == community));
        assert!(h.handle.communities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_await_running_is_single_flight() {
        let h = Harness::start();
        let community = address(8);
        h.chain.script(community, &[me()]);
        let gate = h.operators.gate();

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let waiter = h.handle.await_running(community).await.unwrap();
            waiters.push(tokio::spawn(waiter.wait()));
        }
        // Asking never starts anything.
        let unrelated = h.handle.await_running(address(9)).await.unwrap();
        assert_eq!(unrelated.address(), address(9));
        assert_eq!(h.operators.builds(), 0);

        let processing = {
            let handle = h.handle.clone();
            tokio::spawn(async move { handle.process(event(community, me())).await })
        };
        let operators = h.operators.clone();
        eventually(|| operators.builds() == 1).await;
        gate.add_permits(1);
        assert_eq!(processing.await.unwrap().unwrap(), EventOutcome::Started);

        for waiter in waiters {
            let info = waiter.await.unwrap().unwrap();
            assert_eq!(info.address, community);
            assert_eq!(info.join_part_stream_id, format!("stream-{community}"));
        }
        assert_eq!(h.operators.starts(), 1);
    }

    #[tokio::test]
    async fn test_failed_handover_keeps_community() {
        let h = Harness::start();
        let community = address(10);
        h.chain.script(community, &[me(), me(), stranger()]);
        h.operators.fail_shutdown();

        h.handle.process(event(community, me())).await.unwrap();
        let err = h
            .handle
            .process(event(community, stranger()))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Handover { .. }));

        let snapshot = h.handle.community(community).await.unwrap().unwrap();
        assert_eq!(snapshot.status, CommunityStatus::Running);
    }

    #[tokio::test]
    async fn test_shutdown_stops_operators_and_refuses_events() {
        let h = Harness::start();
        h.chain.script(address(11), &[me()]);
        h.chain.script(address(12), &[stranger()]);
        h.handle.process(event(address(11), me())).await.unwrap();

        h.shutdown_tx.send(true).unwrap();
        h.task.await.unwrap();
        assert_eq!(h.operators.shutdowns(), 1);

        let err = h
            .handle
            .process(event(address(12), stranger()))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Stopped));
        assert!(matches!(
            h.handle.communities().await,
            Err(ManagerError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_inflight_startup() {
        let h = Harness::start();
        let community = address(13);
        h.chain.script(community, &[me()]);
        let gate = h.operators.gate();

        let processing = {
            let handle = h.handle.clone();
            tokio::spawn(async move { handle.process(event(community, me())).await })
        };
        let operators = h.operators.clone();
        eventually(|| operators.builds() == 1).await;

        h.shutdown_tx.send(true).unwrap();
        tokio::task::yield_now().await;
        assert!(!h.task.is_finished());

        gate.add_permits(1);
        assert_eq!(processing.await.unwrap().unwrap(), EventOutcome::Started);
        h.task.await.unwrap();
        // Started during shutdown, released on exit.
        assert_eq!(h.operators.shutdowns(), 1);
    }

    #[test]
    fn test_decision_table() {
        assert_eq!(decide(None, true), Decision::Start);
        assert_eq!(decide(None, false), Decision::Ignore);

        let launching = CommunityPhase::Launching;
        assert_eq!(decide(Some(&launching), true), Decision::RejectAbuse);
        assert_eq!(decide(Some(&launching), false), Decision::RejectAbuse);

        let running = |handing_over| CommunityPhase::Running {
            operator: idle_operator(),
            join_part_stream_id: "s".to_string(),
            handing_over,
        };
        assert_eq!(decide(Some(&running(false)), true), Decision::Confirm);
        assert_eq!(decide(Some(&running(false)), false), Decision::Handover);
        assert_eq!(decide(Some(&running(true)), true), Decision::Reclaim);
        assert_eq!(decide(Some(&running(true)), false), Decision::RejectAbuse);
    }
}
