//! Configuration module for cps-server.
//!
//! Handles loading configuration from TOML files, CLI arguments,
//! and environment variables.

pub mod file;
pub mod runtime;

use crate::config::file::FileConfig;
use crate::config::runtime::{EthereumConfig, ManagerConfig, OperatorRuntimeConfig, ServerConfig};
use cps_sdk::Address;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("no Ethereum node configured: set [ethereum] rpc_url or ETHEREUM_SERVER")]
    MissingRpcUrl,
}

/// Loaded configuration result containing all parts.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub server: ServerConfig,
    pub ethereum: EthereumConfig,
    pub manager: ManagerConfig,
    pub operator: OperatorRuntimeConfig,
}

/// Configuration loader that handles the complete loading process.
pub struct ConfigLoader {
    config_path: std::path::PathBuf,
    listen_override: Option<SocketAddr>,
    rpc_url_override: Option<Url>,
}

impl ConfigLoader {
    /// Create a new config loader.
    pub fn new(
        config_path: impl AsRef<Path>,
        listen_override: Option<SocketAddr>,
        rpc_url_override: Option<Url>,
    ) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            listen_override,
            rpc_url_override,
        }
    }

    /// Load and process the configuration.
    ///
    /// This will:
    /// 1. Read the TOML file
    /// 2. Apply CLI and environment overrides
    /// 3. Validate the configuration
    /// 4. Build the loaded configuration
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let config_content = std::fs::read_to_string(&self.config_path)?;
        let mut file_config: FileConfig = toml::from_str(&config_content)?;

        if let Some(listen) = self.listen_override {
            file_config.server.listen = listen;
        }
        if let Some(rpc_url) = &self.rpc_url_override {
            file_config.ethereum.rpc_url = Some(rpc_url.clone());
        }

        let operator_address = self.validate(&file_config)?;
        self.build_loaded_config(file_config, operator_address)
    }

    fn validate(&self, config: &FileConfig) -> Result<Address, ConfigError> {
        if config.ethereum.rpc_url.is_none() {
            return Err(ConfigError::MissingRpcUrl);
        }
        if config.ethereum.poll_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "ethereum.poll_interval_secs must be positive".to_string(),
            ));
        }
        if config.operator.store_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "operator.store_dir must not be empty".to_string(),
            ));
        }
        if config.operator.command.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "operator.command must not be empty".to_string(),
            ));
        }
        config.operator.address.parse().map_err(|e| {
            ConfigError::ValidationError(format!(
                "operator.address {}: {e}",
                config.operator.address
            ))
        })
    }

    fn build_loaded_config(
        &self,
        file_config: FileConfig,
        operator_address: Address,
    ) -> Result<LoadedConfig, ConfigError> {
        let rpc_url = file_config
            .ethereum
            .rpc_url
            .ok_or(ConfigError::MissingRpcUrl)?;

        let operator_defaults = match serde_json::to_value(&file_config.operator.config) {
            Ok(Value::Object(map)) => map,
            _ => {
                return Err(ConfigError::ValidationError(
                    "operator.config must be a table of JSON-compatible values".to_string(),
                ));
            }
        };

        Ok(LoadedConfig {
            server: ServerConfig {
                listen: file_config.server.listen,
            },
            ethereum: EthereumConfig {
                rpc_url,
                poll_interval: Duration::from_secs(file_config.ethereum.poll_interval_secs),
            },
            manager: ManagerConfig {
                operator_address,
                operator_defaults,
            },
            operator: OperatorRuntimeConfig {
                store_dir: file_config.operator.store_dir,
                command: file_config.operator.command,
                args: file_config.operator.args,
                streamr_http_url: file_config.operator.streamr_http_url,
                streamr_ws_url: file_config.operator.streamr_ws_url,
            },
        })
    }
}
