//! Interfaces of the collaborators the lifecycle manager drives.
//!
//! The operator process itself, its membership channel and its persistent
//! store live outside this crate. The manager only needs to:
//!
//! 1. obtain a channel and a store for a community ([`ChannelFactory`],
//!    [`StoreFactory`]),
//! 2. build an operator from them ([`OperatorFactory`]),
//! 3. `start` it with a per-community [`OperatorConfig`], later `shutdown` it.

use crate::chain::ChainError;
use async_trait::async_trait;
use cps_sdk::Address;
use cps_sdk::objects::OperatorStats;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by collaborators.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// The community's join/part stream does not resolve
    #[error("joinPartStream {stream_id} in community contract at {community} is not found: {reason}")]
    StreamNotFound {
        community: Address,
        stream_id: String,
        reason: String,
    },

    /// Reading the community contract failed
    #[error("chain read failed: {0}")]
    Chain(#[from] ChainError),

    /// Store I/O error
    #[error("store error: {0}")]
    Store(#[from] std::io::Error),

    /// The operator process misbehaved
    #[error("operator process error: {0}")]
    Process(String),
}

/// Membership (join/part) channel handed to an operator.
pub trait JoinPartChannel: Send + Sync {
    fn stream_id(&self) -> &str;
}

/// Persistence handle handed to an operator.
#[async_trait]
pub trait OperatorStore: Send + Sync {
    /// Human-readable location, for logs.
    fn location(&self) -> String;

    /// Latest statistics the operator persisted.
    async fn stats(&self) -> OperatorStats;
}

/// An off-chain operator for a single community.
///
/// Once started, the handle is owned by the manager's registry entry and only
/// the manager may shut it down.
#[async_trait]
pub trait OperatorHandle: Send + Sync {
    async fn start(&mut self, config: &OperatorConfig) -> Result<(), OperatorError>;

    async fn shutdown(&self) -> Result<(), OperatorError>;

    async fn stats(&self) -> OperatorStats;
}

#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Must fail unless the community's join/part stream resolves.
    async fn channel_for(&self, community: Address) -> Result<Box<dyn JoinPartChannel>, OperatorError>;
}

#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn store_for(&self, community: Address) -> Result<Box<dyn OperatorStore>, OperatorError>;
}

pub trait OperatorFactory: Send + Sync {
    fn build(
        &self,
        community: Address,
        channel: Box<dyn JoinPartChannel>,
        store: Box<dyn OperatorStore>,
    ) -> Box<dyn OperatorHandle>;
}

/// The factories used by the startup procedure.
#[derive(Clone)]
pub struct Collaborators {
    pub channels: Arc<dyn ChannelFactory>,
    pub stores: Arc<dyn StoreFactory>,
    pub operators: Arc<dyn OperatorFactory>,
}

/// Configuration passed to `OperatorHandle::start`: the base operator config
/// with `contractAddress` set to the community.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct OperatorConfig(Map<String, Value>);

impl OperatorConfig {
    pub const CONTRACT_ADDRESS_KEY: &'static str = "contractAddress";

    pub fn for_community(base: &Map<String, Value>, community: Address) -> Self {
        let mut config = base.clone();
        config.insert(
            Self::CONTRACT_ADDRESS_KEY.to_string(),
            Value::String(community.to_checksum()),
        );
        Self(config)
    }

    pub fn contract_address(&self) -> Option<&str> {
        self.0.get(Self::CONTRACT_ADDRESS_KEY).and_then(Value::as_str)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }
}
