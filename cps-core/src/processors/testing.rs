//! In-memory chain and collaborators for processor tests.

use super::lifecycle_manager::{LifecycleManager, ManagerHandle};
use crate::chain::{
    BlockTag, ChainError, ChainReader, EventSource, LogFilter, LogSubscription, RawLog,
};
use crate::config::ManagerConfig;
use crate::events::{LogSender, OPERATOR_CHANGED_TOPIC, log_channel};
use crate::operator::{
    ChannelFactory, Collaborators, JoinPartChannel, OperatorConfig, OperatorError,
    OperatorFactory, OperatorHandle, OperatorStore, StoreFactory,
};
use async_trait::async_trait;
use cps_sdk::Address;
use cps_sdk::objects::OperatorStats;
use serde_json::Map;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;

pub fn address(byte: u8) -> Address {
    Address::new([byte; 20])
}

/// The operator address the manager under test acts as.
pub fn me() -> Address {
    address(0xAA)
}

pub fn stranger() -> Address {
    address(0xBB)
}

pub fn operator_changed_log(community: Address, new_operator: Address, block: u64) -> RawLog {
    RawLog {
        address: community,
        topics: vec![OPERATOR_CHANGED_TOPIC.clone(), new_operator.to_topic()],
        data: "0x".to_string(),
        block_number: Some(block),
        log_index: Some(0),
        transaction_hash: None,
        removed: false,
    }
}

/// Scripted chain.
///
/// `operator()` answers pop from a per-community queue; the last answer
/// sticks. Logs pushed with [`push_history`](Self::push_history) advance the
/// head block; a subscription first delivers stored logs from its start
/// block on.
#[derive(Default)]
pub struct FakeChain {
    operators: Mutex<HashMap<Address, VecDeque<Address>>>,
    failing_reads: Mutex<HashSet<Address>>,
    history: Mutex<Vec<RawLog>>,
    head: AtomicU64,
    fail_logs: AtomicBool,
    live: Mutex<Option<LogSender>>,
    pub operator_reads: AtomicUsize,
    pub subscriptions: AtomicUsize,
}

fn in_range(log: &RawLog, filter: &LogFilter) -> bool {
    // Pending logs carry no block number.
    let Some(block) = log.block_number else {
        return true;
    };
    let after_start = match filter.from_block {
        Some(BlockTag::Number(from)) => block >= from,
        _ => true,
    };
    let before_end = match filter.to_block {
        Some(BlockTag::Number(to)) => block <= to,
        _ => true,
    };
    after_start && before_end
}

fn topics_match(log: &RawLog, filter: &LogFilter) -> bool {
    filter.topics.iter().enumerate().all(|(i, wanted)| match wanted {
        Some(wanted) => log
            .topics
            .get(i)
            .is_some_and(|topic| topic.eq_ignore_ascii_case(wanted)),
        None => true,
    })
}

impl FakeChain {
    pub fn script(&self, community: Address, answers: &[Address]) {
        self.operators
            .lock()
            .unwrap()
            .insert(community, answers.iter().copied().collect());
    }

    pub fn fail_reads_for(&self, community: Address) {
        self.failing_reads.lock().unwrap().insert(community);
    }

    pub fn push_history(&self, log: RawLog) {
        self.head
            .fetch_max(log.block_number.unwrap_or(0), Ordering::SeqCst);
        self.history.lock().unwrap().push(log);
    }

    /// Store a log mined after the head block was last read.
    pub fn push_unseen(&self, log: RawLog) {
        self.history.lock().unwrap().push(log);
    }

    pub fn fail_logs(&self) {
        self.fail_logs.store(true, Ordering::SeqCst);
    }

    pub fn live_sender(&self) -> LogSender {
        self.live.lock().unwrap().clone().unwrap()
    }
}

#[async_trait]
impl ChainReader for FakeChain {
    async fn operator(&self, community: Address) -> Result<Address, ChainError> {
        self.operator_reads.fetch_add(1, Ordering::SeqCst);
        if self.failing_reads.lock().unwrap().contains(&community) {
            return Err(ChainError::Rpc {
                code: -32000,
                message: "execution reverted".to_string(),
            });
        }
        let mut operators = self.operators.lock().unwrap();
        let answers = operators.get_mut(&community).ok_or_else(|| ChainError::Rpc {
            code: -32000,
            message: "no contract".to_string(),
        })?;
        let answer = if answers.len() > 1 {
            answers.pop_front()
        } else {
            answers.front().copied()
        };
        answer.ok_or_else(|| ChainError::Decode("empty script".to_string()))
    }

    async fn join_part_stream(&self, community: Address) -> Result<String, ChainError> {
        Ok(format!("stream-{community}"))
    }
}

#[async_trait]
impl EventSource for FakeChain {
    async fn logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ChainError> {
        if self.fail_logs.load(Ordering::SeqCst) {
            return Err(ChainError::Rpc {
                code: -32005,
                message: "query returned more than 10000 results".to_string(),
            });
        }
        let history = self.history.lock().unwrap();
        Ok(history
            .iter()
            .filter(|log| in_range(log, filter) && topics_match(log, filter))
            .cloned()
            .collect())
    }

    async fn head_block(&self) -> Result<u64, ChainError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn subscribe(&self, filter: LogFilter) -> Result<LogSubscription, ChainError> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = log_channel();
        let backlog: Vec<RawLog> = self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|log| in_range(log, &filter) && topics_match(log, &filter))
            .cloned()
            .collect();
        for log in backlog {
            tx.try_send(log)
                .map_err(|e| ChainError::Decode(e.to_string()))?;
        }
        *self.live.lock().unwrap() = Some(tx);
        Ok(LogSubscription::new(rx, None))
    }
}

struct FakeChannel(String);

impl JoinPartChannel for FakeChannel {
    fn stream_id(&self) -> &str {
        &self.0
    }
}

struct FakeStore(Address);

#[async_trait]
impl OperatorStore for FakeStore {
    fn location(&self) -> String {
        format!("memory://{}", self.0)
    }

    async fn stats(&self) -> OperatorStats {
        OperatorStats::default()
    }
}

/// Channel and store factories plus an operator factory that records what
/// its operators are asked to do.
#[derive(Default)]
pub struct FakeOperators {
    missing_streams: Mutex<HashSet<Address>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    shutdown_gate: Mutex<Option<Arc<Semaphore>>>,
    fail_shutdown: AtomicBool,
    pub builds: AtomicUsize,
    pub starts: AtomicUsize,
    pub shutdown_calls: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub configs: Mutex<Vec<OperatorConfig>>,
}

impl FakeOperators {
    pub fn missing_stream(&self, community: Address) {
        self.missing_streams.lock().unwrap().insert(community);
    }

    /// Make every `start` wait for a permit of the returned semaphore.
    pub fn gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Make every `shutdown` wait for a permit of the returned semaphore.
    pub fn shutdown_gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.shutdown_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn fail_shutdown(&self) {
        self.fail_shutdown.store(true, Ordering::SeqCst);
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// `shutdown` calls, including ones still waiting or failing.
    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    /// Successful shutdowns.
    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

struct Factories(Arc<FakeOperators>);

#[async_trait]
impl ChannelFactory for Factories {
    async fn channel_for(&self, community: Address) -> Result<Box<dyn JoinPartChannel>, OperatorError> {
        let stream_id = format!("stream-{community}");
        if self.0.missing_streams.lock().unwrap().contains(&community) {
            return Err(OperatorError::StreamNotFound {
                community,
                stream_id,
                reason: "404 Not Found".to_string(),
            });
        }
        Ok(Box::new(FakeChannel(stream_id)))
    }
}

#[async_trait]
impl StoreFactory for Factories {
    async fn store_for(&self, community: Address) -> Result<Box<dyn OperatorStore>, OperatorError> {
        Ok(Box::new(FakeStore(community)))
    }
}

impl OperatorFactory for Factories {
    fn build(
        &self,
        _community: Address,
        _channel: Box<dyn JoinPartChannel>,
        _store: Box<dyn OperatorStore>,
    ) -> Box<dyn OperatorHandle> {
        self.0.builds.fetch_add(1, Ordering::SeqCst);
        Box::new(FakeOperator(Arc::clone(&self.0)))
    }
}

struct FakeOperator(Arc<FakeOperators>);

/// An operator handle not connected to any harness.
pub fn idle_operator() -> Arc<dyn OperatorHandle> {
    Arc::new(FakeOperator(Arc::default()))
}

#[async_trait]
impl OperatorHandle for FakeOperator {
    async fn start(&mut self, config: &OperatorConfig) -> Result<(), OperatorError> {
        let gate = self.0.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| OperatorError::Process(e.to_string()))?;
        }
        self.0.starts.fetch_add(1, Ordering::SeqCst);
        self.0.configs.lock().unwrap().push(config.clone());
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), OperatorError> {
        self.0.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.0.shutdown_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| OperatorError::Process(e.to_string()))?;
        }
        if self.0.fail_shutdown.load(Ordering::SeqCst) {
            return Err(OperatorError::Process("refused to stop".to_string()));
        }
        self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stats(&self) -> OperatorStats {
        OperatorStats::default()
    }
}

/// A running manager wired to fakes.
pub struct Harness {
    pub chain: Arc<FakeChain>,
    pub operators: Arc<FakeOperators>,
    pub handle: ManagerHandle,
    pub shutdown_tx: watch::Sender<bool>,
    pub task: JoinHandle<()>,
}

impl Harness {
    pub fn start() -> Self {
        let chain = Arc::new(FakeChain::default());
        let operators = Arc::new(FakeOperators::default());
        let factories = Arc::new(Factories(Arc::clone(&operators)));
        let collaborators = Collaborators {
            channels: factories.clone(),
            stores: factories.clone(),
            operators: factories,
        };
        let config = ManagerConfig {
            operator_address: me(),
            operator_defaults: Map::new(),
        };
        let (manager, handle) = LifecycleManager::new(config, chain.clone(), collaborators);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(manager.run(shutdown_rx));
        Self {
            chain,
            operators,
            handle,
            shutdown_tx,
            task,
        }
    }
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
