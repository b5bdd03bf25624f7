//! Blockchain access used by the lifecycle manager.
//!
//! Two seams are defined here:
//!
//! - [`ChainReader`]: view calls against a community contract.
//! - [`EventSource`]: bounded historical log queries and live log
//!   subscriptions.
//!
//! [`rpc::RpcChain`] implements both over Ethereum JSON-RPC.

pub mod abi;
pub mod rpc;

use crate::events::LogReceiver;
use async_trait::async_trait;
use cps_sdk::Address;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use tokio::task::JoinHandle;

/// Errors that can occur while talking to the chain.
#[derive(Debug, Error)]
pub enum ChainError {
    /// HTTP transport error
    #[error("rpc transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The node answered with a JSON-RPC error object
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Response could not be decoded
    #[error("malformed rpc response: {0}")]
    Decode(String),
}

/// View calls against a community contract.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Current `operator()` of the community contract.
    async fn operator(&self, community: Address) -> Result<Address, ChainError>;

    /// `joinPartStream()` of the community contract.
    async fn join_part_stream(&self, community: Address) -> Result<String, ChainError>;
}

/// A blockchain log store.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Fetch all logs matching a bounded filter, in block order.
    async fn logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ChainError>;

    /// Number of the latest block.
    async fn head_block(&self) -> Result<u64, ChainError>;

    /// Subscribe to logs matching `filter`, starting at its `from_block`, or
    /// after the current head if it has none.
    ///
    /// Dropping the returned subscription unsubscribes.
    async fn subscribe(&self, filter: LogFilter) -> Result<LogSubscription, ChainError>;
}

/// Block reference used in log filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Number(u64),
    Latest,
}

impl Serialize for BlockTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            BlockTag::Number(n) => serializer.serialize_str(&format!("0x{n:x}")),
            BlockTag::Latest => serializer.serialize_str("latest"),
        }
    }
}

/// `eth_getLogs` filter object.
///
/// Topics are `0x`-prefixed lowercase hex; `None` matches any value at that
/// position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    pub topics: Vec<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_block: Option<BlockTag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_block: Option<BlockTag>,
}

impl LogFilter {
    pub fn with_topics(topics: Vec<Option<String>>) -> Self {
        Self {
            address: None,
            topics,
            from_block: None,
            to_block: None,
        }
    }

    pub fn since(mut self, from: BlockTag) -> Self {
        self.from_block = Some(from);
        self
    }

    pub fn between(mut self, from: BlockTag, to: BlockTag) -> Self {
        self.from_block = Some(from);
        self.to_block = Some(to);
        self
    }
}

/// A log entry as returned by the node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: String,
    #[serde(default, deserialize_with = "quantity::deserialize_opt")]
    pub block_number: Option<u64>,
    #[serde(default, deserialize_with = "quantity::deserialize_opt")]
    pub log_index: Option<u64>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    /// Set by the node when a reorg dropped the log.
    #[serde(default)]
    pub removed: bool,
}

/// A live log subscription.
///
/// Wraps the receiving end of a log channel and the task feeding it; the
/// task is aborted when the subscription is dropped.
pub struct LogSubscription {
    rx: LogReceiver,
    driver: Option<JoinHandle<()>>,
}

impl LogSubscription {
    pub fn new(rx: LogReceiver, driver: Option<JoinHandle<()>>) -> Self {
        Self { rx, driver }
    }

    /// Next log, or `None` once the source has stopped delivering.
    pub async fn next(&mut self) -> Option<RawLog> {
        self.rx.recv().await
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Hex `QUANTITY` encoding helpers.
pub(crate) mod quantity {
    use serde::{Deserialize, Deserializer};

    pub fn parse(s: &str) -> Result<u64, String> {
        let digits = s
            .strip_prefix("0x")
            .ok_or_else(|| format!("quantity without 0x prefix: {s}"))?;
        if digits.is_empty() {
            return Err("empty quantity".to_string());
        }
        u64::from_str_radix(digits, 16).map_err(|e| format!("invalid quantity {s}: {e}"))
    }

    pub fn deserialize_opt<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| parse(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
