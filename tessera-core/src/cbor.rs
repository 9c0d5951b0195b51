// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encode and decode values in [CBOR] format.
//!
//! Manifests and log entries are encoded with these helpers. Serialization of the types in this
//! workspace is deterministic, so encoding the same value twice yields the same bytes and hence
//! the same hash.
//!
//! [CBOR]: https://cbor.io/
use std::io::Read;

use ciborium::de::Error as DeserializeError;
use ciborium::ser::Error as SerializeError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Serializes a value into CBOR format.
pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes)?;
    Ok(bytes)
}

/// Deserializes a value which was formatted in CBOR.
pub fn decode_cbor<T: for<'a> Deserialize<'a>, R: Read>(reader: R) -> Result<T, DecodeError> {
    let value = ciborium::from_reader::<T, R>(reader)?;
    Ok(value)
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("an error occurred while writing bytes: {0}")]
    Io(std::io::Error),

    #[error("an error occurred while serializing value: {0}")]
    Value(String),
}

impl From<SerializeError<std::io::Error>> for EncodeError {
    fn from(value: SerializeError<std::io::Error>) -> Self {
        match value {
            SerializeError::Io(err) => EncodeError::Io(err),
            SerializeError::Value(err) => EncodeError::Value(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("an error occurred while reading bytes: {0}")]
    Io(std::io::Error),

    #[error("an error occurred while parsing bytes at position {0}")]
    Syntax(usize),

    /// Bytes were well-formed CBOR but did not match the expected value, the description comes
    /// from serde.
    #[error("an error occurred while processing a parsed value at position {0:?}: {1}")]
    Semantic(Option<usize>, String),

    #[error("recursion limit exceeded while decoding")]
    RecursionLimitExceeded,
}

impl From<DeserializeError<std::io::Error>> for DecodeError {
    fn from(value: DeserializeError<std::io::Error>) -> Self {
        match value {
            DeserializeError::Io(err) => DecodeError::Io(err),
            DeserializeError::Syntax(offset) => DecodeError::Syntax(offset),
            DeserializeError::Semantic(offset, description) => {
                DecodeError::Semantic(offset, description)
            }
            DeserializeError::RecursionLimitExceeded => DecodeError::RecursionLimitExceeded,
        }
    }
}
