#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

pub mod chain;
pub mod config;
pub mod events;
pub mod operator;
pub mod processors;
pub mod registry;
