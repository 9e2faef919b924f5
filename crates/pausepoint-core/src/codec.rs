//! Value codec used by the shared-region transport.
//!
//! Values are encoded as JSON so that controllers written in any language can
//! read and write region payloads.

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Codec error.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Encode failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Decode failed: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encode a value to bytes.
///
/// # Errors
/// Returns error if the value cannot be represented (e.g. a map with
/// non-string keys).
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(CodecError::Encode)
}

/// Decode a value from bytes.
///
/// The whole input must be consumed; trailing garbage is a decode error.
///
/// # Errors
/// Returns error if the bytes are not a valid encoding of `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Decode)
}
