//! Runtime configuration re-exports.
//!
//! The actual config types are defined in `cps-core::config`.
//! This module re-exports them for convenience.

pub use cps_core::config::{EthereumConfig, ManagerConfig, OperatorRuntimeConfig, ServerConfig};
