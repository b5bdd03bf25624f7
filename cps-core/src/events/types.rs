//! `OperatorChanged` event definition and decoding.

use crate::chain::{BlockTag, LogFilter, RawLog};
use cps_sdk::{Address, keccak256};
use lazy_static::lazy_static;
use thiserror::Error;

/// Solidity signature of the event: `event OperatorChanged(address indexed newOperator)`.
pub const OPERATOR_CHANGED_SIGNATURE: &str = "OperatorChanged(address)";

lazy_static! {
    /// topic0 of every `OperatorChanged` log, `0x`-prefixed lowercase hex.
    pub static ref OPERATOR_CHANGED_TOPIC: String =
        format!("0x{}", hex::encode(keccak256(OPERATOR_CHANGED_SIGNATURE)));
}

/// A decoded `OperatorChanged` log.
///
/// `new_operator` is what the event claimed; the manager re-reads
/// `operator()` from the contract before acting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorChanged {
    /// The community contract that emitted the event.
    pub contract_address: Address,
    pub new_operator: Address,
    pub block_number: u64,
}

/// Errors produced when a raw log is not a well-formed `OperatorChanged`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogParseError {
    #[error("log has {0} topics, expected 2")]
    MissingTopic(usize),
    #[error("log topic0 {0} is not OperatorChanged(address)")]
    UnexpectedTopic(String),
    #[error("malformed indexed address topic {0}")]
    MalformedTopic(String),
    #[error("log is pending (no block number)")]
    MissingBlockNumber,
}

impl TryFrom<&RawLog> for OperatorChanged {
    type Error = LogParseError;

    fn try_from(log: &RawLog) -> Result<Self, Self::Error> {
        let [topic0, topic1, ..] = log.topics.as_slice() else {
            return Err(LogParseError::MissingTopic(log.topics.len()));
        };
        if !topic0.eq_ignore_ascii_case(&OPERATOR_CHANGED_TOPIC) {
            return Err(LogParseError::UnexpectedTopic(topic0.clone()));
        }
        let new_operator = parse_address_topic(topic1)
            .ok_or_else(|| LogParseError::MalformedTopic(topic1.clone()))?;
        let block_number = log.block_number.ok_or(LogParseError::MissingBlockNumber)?;

        Ok(Self {
            contract_address: log.address,
            new_operator,
            block_number,
        })
    }
}

fn parse_address_topic(topic: &str) -> Option<Address> {
    let digits = topic.strip_prefix("0x")?;
    let mut word = [0u8; 32];
    hex::decode_to_slice(digits, &mut word).ok()?;
    if word[..12].iter().any(|b| *b != 0) {
        return None;
    }
    Some(Address::from_word(&word))
}

/// Filter for replaying every `OperatorChanged` up to block `head` that
/// named `operator`.
pub fn replay_filter(operator: Address, head: u64) -> LogFilter {
    LogFilter::with_topics(vec![
        Some(OPERATOR_CHANGED_TOPIC.clone()),
        Some(operator.to_topic()),
    ])
    .between(BlockTag::Number(1), BlockTag::Number(head))
}

/// Filter for live `OperatorChanged` events from every community, starting
/// at `from_block`.
///
/// Not narrowed to our own address: handovers away from this node are
/// announced with the new operator in topic1.
pub fn live_filter(from_block: u64) -> LogFilter {
    LogFilter::with_topics(vec![Some(OPERATOR_CHANGED_TOPIC.clone())])
        .since(BlockTag::Number(from_block))
}
