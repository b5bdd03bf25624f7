//! Configuration types for the community product server.
//!
//! These types represent the validated runtime configuration used by the
//! server and can be shared across crates. The actual config loading/parsing
//! is handled by the server crate.

use cps_sdk::Address;
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// HTTP server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

/// Ethereum node connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthereumConfig {
    /// JSON-RPC endpoint.
    pub rpc_url: Url,
    /// Interval between live log polls.
    pub poll_interval: Duration,
}

/// What the lifecycle manager needs to know about this node.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// The operator address this node acts as.
    pub operator_address: Address,
    /// Base operator configuration; `contractAddress` is set per community.
    pub operator_defaults: Map<String, Value>,
}

/// How operators are run and where they keep their data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorRuntimeConfig {
    /// Root directory of per-community stores.
    pub store_dir: PathBuf,
    /// Operator program and its arguments.
    pub command: String,
    pub args: Vec<String>,
    /// Streamr HTTP API, used to resolve join/part streams.
    pub streamr_http_url: Url,
    /// Streamr websocket API, passed through to operators.
    pub streamr_ws_url: Url,
}
