pub mod address;
pub mod objects;

pub use address::{Address, AddressError, keccak256};
