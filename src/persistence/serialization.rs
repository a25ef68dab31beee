//! Serialization utilities: bincode for index topology, JSON for configuration.

use crate::error::{AnnError, Result};
use serde::{Deserialize, Serialize};

/// Encode data to bincode bytes.
pub fn to_bincode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| AnnError::SerializationError(e.to_string()))
}

/// Decode data from bincode bytes.
pub fn from_bincode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| AnnError::SerializationError(e.to_string()))
}

/// Encode data to JSON bytes.
pub fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| AnnError::SerializationError(e.to_string()))
}

/// Encode data to indented JSON bytes.
pub fn to_json_pretty<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|e| AnnError::SerializationError(e.to_string()))
}

/// Decode data from JSON bytes.
pub fn from_json<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| AnnError::SerializationError(e.to_string()))
}
