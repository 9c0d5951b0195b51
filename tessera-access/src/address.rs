// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tessera_core::{Hash, HashError};
use thiserror::Error;

/// Prefix of every access controller address.
pub const ADDRESS_PREFIX: &str = "/tessera/";

/// Address of an access controller, derived from the hash of its manifest block.
///
/// Represented as `/tessera/<hex hash>` so that an account address can never be mistaken for a
/// hex-encoded device public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(Hash);

impl Address {
    pub fn new(manifest_hash: Hash) -> Self {
        Self(manifest_hash)
    }

    /// Hash of the manifest block this address points at.
    pub fn hash(&self) -> &Hash {
        &self.0
    }
}

impl From<Hash> for Address {
    fn from(value: Hash) -> Self {
        Self(value)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let hash = value
            .strip_prefix(ADDRESS_PREFIX)
            .ok_or(AddressError::MissingPrefix)?;
        Ok(Self(hash.parse()?))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", ADDRESS_PREFIX, self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Address").field(&self.to_string()).finish()
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("address does not start with \"/tessera/\"")]
    MissingPrefix,

    #[error("invalid manifest hash in address: {0}")]
    InvalidHash(#[from] HashError),
}

#[cfg(test)]
mod tests {
    use tessera_core::Hash;

    use super::{Address, AddressError};

    #[test]
    fn parse_and_display() {
        let address = Address::new(Hash::new(b"manifest"));
        let string = address.to_string();
        assert!(string.starts_with("/tessera/"));
        assert_eq!(string.parse::<Address>().unwrap(), address);
    }

    #[test]
    fn reject_malformed_addresses() {
        let hash = Hash::new(b"manifest");
        assert!(matches!(
            hash.to_hex().parse::<Address>(),
            Err(AddressError::MissingPrefix)
        ));
        assert!(matches!(
            "/tessera/zz".parse::<Address>(),
            Err(AddressError::InvalidHash(_))
        ));
    }
}
