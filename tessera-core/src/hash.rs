// SPDX-License-Identifier: MIT OR Apache-2.0

//! BLAKE3 hashes used to address manifest blocks, logs and entries.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::serde::{deserialize_hex, serialize_hex};

/// Size of BLAKE3 hashes in bytes.
pub const HASH_LEN: usize = blake3::OUT_LEN;

/// 32-byte BLAKE3 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    /// Hash the given bytes.
    pub fn new(buf: impl AsRef<[u8]>) -> Self {
        Self(*blake3::hash(buf.as_ref()).as_bytes())
    }

    /// Hash a sequence of byte strings as one continuous input.
    pub fn from_parts<I, B>(parts: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(part.as_ref());
        }
        Self(*hasher.finalize().as_bytes())
    }

    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; HASH_LEN]> for Hash {
    fn from(value: [u8; HASH_LEN]) -> Self {
        Self(value)
    }
}

impl TryFrom<&[u8]> for Hash {
    type Error = HashError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; HASH_LEN] = value
            .try_into()
            .map_err(|_| HashError::InvalidLength(value.len(), HASH_LEN))?;
        Ok(Self(bytes))
    }
}

impl FromStr for Hash {
    type Err = HashError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::try_from(hex::decode(value)?.as_slice())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash").field(&self.to_hex()).finish()
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_hex(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = deserialize_hex(deserializer)?;
        Self::try_from(bytes.as_slice()).map_err(|err| serde::de::Error::custom(err.to_string()))
    }
}

#[derive(Error, Debug)]
pub enum HashError {
    #[error("invalid hash length {0} bytes, expected {1} bytes")]
    InvalidLength(usize, usize),

    #[error("invalid hex encoding in hash string")]
    InvalidHexEncoding(#[from] hex::FromHexError),
}

#[cfg(test)]
mod tests {
    use super::{Hash, HashError};

    #[test]
    fn blake3_digest() {
        let hash = Hash::new([1, 2, 3]);
        assert_eq!(
            hash.to_hex(),
            "b177ec1bf26dfb3b7010d473e6d44713b29b765b99c6e60ecbfae742de496543"
        );
    }

    #[test]
    fn parts_hash_like_concatenation() {
        assert_eq!(
            Hash::from_parts([b"tes".as_slice(), b"sera".as_slice()]),
            Hash::new(b"tessera")
        );
    }

    #[test]
    fn hex_string_round_trip() {
        let hash = Hash::new(b"manifest");
        let parsed: Hash = hash.to_string().parse().unwrap();
        assert_eq!(hash, parsed);

        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
    }

    #[test]
    fn rejects_invalid_input() {
        let result: Result<Hash, HashError> = [1u8, 2, 3].as_slice().try_into();
        assert!(matches!(result, Err(HashError::InvalidLength(3, 32))));

        let result: Result<Hash, HashError> = "notreallyahexstring".parse();
        assert!(matches!(result, Err(HashError::InvalidHexEncoding(_))));
    }
}
