//! TOML file configuration structures.
//!
//! These structs directly map to the `cps-config.toml` file format.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use url::Url;

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ethereum: EthereumConfig,
    pub operator: OperatorConfig,
}

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The address and port to listen on (e.g., "0.0.0.0:8080").
    #[serde(default = "default_listen_addr")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080))
}

/// Ethereum node section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EthereumConfig {
    /// JSON-RPC endpoint. May be left out when `ETHEREUM_SERVER` is set.
    #[serde(default)]
    pub rpc_url: Option<Url>,
    /// Seconds between live log polls.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for EthereumConfig {
    fn default() -> Self {
        Self {
            rpc_url: None,
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    4
}

/// Operator section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// The operator address this node acts as.
    pub address: String,
    /// Root directory of per-community stores.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    /// Operator executable, started once per community.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_streamr_http_url")]
    pub streamr_http_url: Url,
    #[serde(default = "default_streamr_ws_url")]
    pub streamr_ws_url: Url,
    /// Free-form base configuration handed to every operator.
    #[serde(default)]
    pub config: toml::Table,
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("./store")
}

fn default_streamr_http_url() -> Url {
    Url::parse("https://streamr.com/api/v1").expect("valid default url")
}

fn default_streamr_ws_url() -> Url {
    Url::parse("wss://streamr.com/api/v1/ws").expect("valid default url")
}
