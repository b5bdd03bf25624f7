//! Ethereum JSON-RPC implementation of [`ChainReader`] and [`EventSource`].
//!
//! Live subscriptions poll `eth_getLogs` over the block range produced since
//! the previous round, which works against any plain HTTP endpoint.

use super::abi;
use super::{BlockTag, ChainError, ChainReader, EventSource, LogFilter, LogSubscription, RawLog};
use crate::events::log_channel;
use async_trait::async_trait;
use cps_sdk::Address;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

/// Default interval between live log polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(4);

/// ERC-20 metadata read by the diagnostic command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMetadata {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

/// JSON-RPC client bound to one node endpoint.
///
/// Cheap to clone; clones share the HTTP connection pool and request ids.
#[derive(Clone)]
pub struct RpcChain {
    url: Url,
    http_client: reqwest::Client,
    poll_interval: Duration,
    next_id: Arc<AtomicU64>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

impl RpcChain {
    pub fn new(url: Url, poll_interval: Duration) -> Self {
        Self {
            url,
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            poll_interval,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let response: RpcResponse<T> = self
            .http_client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if let Some(error) = response.error {
            return Err(ChainError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        response
            .result
            .ok_or_else(|| ChainError::Decode(format!("{method} returned neither result nor error")))
    }

    /// `eth_chainId`
    pub async fn chain_id(&self) -> Result<u64, ChainError> {
        let raw: String = self.request("eth_chainId", json!([])).await?;
        super::quantity::parse(&raw).map_err(ChainError::Decode)
    }

    /// `eth_blockNumber`
    pub async fn block_number(&self) -> Result<u64, ChainError> {
        let raw: String = self.request("eth_blockNumber", json!([])).await?;
        super::quantity::parse(&raw).map_err(ChainError::Decode)
    }

    /// `eth_getLogs`
    pub async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ChainError> {
        self.request("eth_getLogs", json!([filter])).await
    }

    /// `eth_getCode` at the latest block, raw bytes.
    pub async fn code_at(&self, address: Address) -> Result<Vec<u8>, ChainError> {
        let raw: String = self
            .request("eth_getCode", json!([address, "latest"]))
            .await?;
        abi::decode_hex(&raw)
    }

    /// `eth_call` against the latest block, raw return bytes.
    pub async fn call(&self, to: Address, data: String) -> Result<Vec<u8>, ChainError> {
        let raw: String = self
            .request("eth_call", json!([{ "to": to, "data": data }, "latest"]))
            .await?;
        abi::decode_hex(&raw)
    }

    async fn call_no_args(&self, to: Address, signature: &str) -> Result<Vec<u8>, ChainError> {
        self.call(to, abi::encode_call(signature, &[])).await
    }

    /// `token()` of a community contract.
    pub async fn token(&self, community: Address) -> Result<Address, ChainError> {
        abi::decode_address(&self.call_no_args(community, "token()").await?)
    }

    /// `withdrawn(member)` of a community contract, in token base units.
    pub async fn withdrawn(&self, community: Address, member: Address) -> Result<u128, ChainError> {
        let data = abi::encode_call("withdrawn(address)", &[member]);
        abi::decode_uint(&self.call(community, data).await?)
    }

    /// `name()`, `symbol()` and `decimals()` of an ERC-20 token.
    pub async fn token_metadata(&self, token: Address) -> Result<TokenMetadata, ChainError> {
        let name = abi::decode_string(&self.call_no_args(token, "name()").await?)?;
        let symbol = abi::decode_string(&self.call_no_args(token, "symbol()").await?)?;
        let decimals = abi::decode_uint(&self.call_no_args(token, "decimals()").await?)?;
        let decimals = u8::try_from(decimals)
            .map_err(|_| ChainError::Decode(format!("decimals out of range: {decimals}")))?;
        Ok(TokenMetadata {
            name,
            symbol,
            decimals,
        })
    }
}

#[async_trait]
impl ChainReader for RpcChain {
    async fn operator(&self, community: Address) -> Result<Address, ChainError> {
        abi::decode_address(&self.call_no_args(community, "operator()").await?)
    }

    async fn join_part_stream(&self, community: Address) -> Result<String, ChainError> {
        abi::decode_string(&self.call_no_args(community, "joinPartStream()").await?)
    }
}

#[async_trait]
impl EventSource for RpcChain {
    async fn logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ChainError> {
        self.get_logs(filter).await
    }

    async fn head_block(&self) -> Result<u64, ChainError> {
        self.block_number().await
    }

    async fn subscribe(&self, filter: LogFilter) -> Result<LogSubscription, ChainError> {
        let mut next_block = match filter.from_block {
            Some(BlockTag::Number(from)) => from,
            _ => self.block_number().await? + 1,
        };
        let (tx, rx) = log_channel();
        let chain = self.clone();

        info!(
            from_block = next_block,
            poll_interval_ms = chain.poll_interval.as_millis() as u64,
            "Subscribing to live logs"
        );

        let driver = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(chain.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    // Subscription dropped.
                    _ = tx.closed() => break,

                    _ = ticker.tick() => {}
                }

                let latest = match chain.block_number().await {
                    Ok(latest) => latest,
                    Err(e) => {
                        warn!(error = %e, "Failed to poll block number, retrying");
                        continue;
                    }
                };
                if latest < next_block {
                    continue;
                }

                let range = filter
                    .clone()
                    .between(BlockTag::Number(next_block), BlockTag::Number(latest));
                match chain.get_logs(&range).await {
                    Ok(logs) => {
                        debug!(
                            from_block = next_block,
                            to_block = latest,
                            count = logs.len(),
                            "Polled live logs"
                        );
                        for log in logs.into_iter().filter(|log| !log.removed) {
                            if tx.send(log).await.is_err() {
                                return;
                            }
                        }
                        next_block = latest + 1;
                    }
                    Err(e) => {
                        warn!(
                            from_block = next_block,
                            to_block = latest,
                            error = %e,
                            "Failed to poll live logs, retrying"
                        );
                    }
                }
            }

            debug!("Live log poller stopped");
        });

        Ok(LogSubscription::new(rx, Some(driver)))
    }
}
