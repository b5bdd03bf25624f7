//! Minimal Solidity ABI encoding for the view calls this crate makes.
//!
//! Only static `address` arguments and `address` / `string` / unsigned
//! integer return values are needed.

use super::ChainError;
use cps_sdk::{Address, keccak256};

const WORD: usize = 32;

/// First four bytes of the keccak hash of a function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Encode calldata for `signature` with address arguments, as `0x` hex.
pub fn encode_call(signature: &str, args: &[Address]) -> String {
    let mut data = Vec::with_capacity(4 + args.len() * WORD);
    data.extend_from_slice(&selector(signature));
    for arg in args {
        data.extend_from_slice(&arg.to_word());
    }
    format!("0x{}", hex::encode(data))
}

fn word_at(data: &[u8], offset: usize) -> Result<&[u8], ChainError> {
    offset
        .checked_add(WORD)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| ChainError::Decode(format!("return data too short: {} bytes", data.len())))
}

fn word_to_usize(word: &[u8]) -> Result<usize, ChainError> {
    if word[..WORD - 8].iter().any(|b| *b != 0) {
        return Err(ChainError::Decode("offset or length out of range".to_string()));
    }
    let mut be = [0u8; 8];
    be.copy_from_slice(&word[WORD - 8..]);
    usize::try_from(u64::from_be_bytes(be))
        .map_err(|_| ChainError::Decode("offset or length out of range".to_string()))
}

/// Decode a single `address` return value.
pub fn decode_address(data: &[u8]) -> Result<Address, ChainError> {
    let mut word = [0u8; WORD];
    word.copy_from_slice(word_at(data, 0)?);
    Ok(Address::from_word(&word))
}

/// Decode a single unsigned integer return value that fits in 128 bits.
pub fn decode_uint(data: &[u8]) -> Result<u128, ChainError> {
    let word = word_at(data, 0)?;
    if word[..16].iter().any(|b| *b != 0) {
        return Err(ChainError::Decode("integer exceeds 128 bits".to_string()));
    }
    let mut be = [0u8; 16];
    be.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(be))
}

/// Decode a single dynamic `string` return value.
pub fn decode_string(data: &[u8]) -> Result<String, ChainError> {
    let offset = word_to_usize(word_at(data, 0)?)?;
    let len = word_to_usize(word_at(data, offset)?)?;
    let start = offset + WORD;
    let bytes = start
        .checked_add(len)
        .and_then(|end| data.get(start..end))
        .ok_or_else(|| ChainError::Decode("string body truncated".to_string()))?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| ChainError::Decode(format!("string is not utf-8: {e}")))
}

/// Decode `0x`-prefixed hex return data.
pub fn decode_hex(data: &str) -> Result<Vec<u8>, ChainError> {
    let digits = data.strip_prefix("0x").unwrap_or(data);
    hex::decode(digits).map_err(|e| ChainError::Decode(format!("invalid hex data: {e}")))
}
