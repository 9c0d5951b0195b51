// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tessera_core::PublicKey;
use thiserror::Error;

use crate::address::Address;

/// Reference to an identity which can be granted a role.
///
/// No tag is stored with a reference: it either names a single device (hex-encoded public key)
/// or an account (address of another access controller). Which one it is gets decided at use
/// time with [`IdentityRef::kind`] and, for accounts, by trying to open them.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdentityRef(String);

impl IdentityRef {
    /// Addresses and public keys are stored in their canonical, lower-case form so that every
    /// spelling of the same identity compares equal.
    pub fn new(value: impl Into<String>) -> Result<Self, IdentityRefError> {
        let value = value.into();
        if value.is_empty() {
            return Err(IdentityRefError::Empty);
        }

        if let Ok(address) = value.parse::<Address>() {
            return Ok(Self::from(address));
        }

        match value.parse::<PublicKey>() {
            Ok(public_key) => Ok(Self::from(public_key)),
            Err(_) => Ok(Self(value)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shape of this reference.
    ///
    /// An `Account` still needs to be opened before its members are known, it might not be
    /// reachable at all.
    pub fn kind(&self) -> IdentityKind {
        if let Ok(address) = self.0.parse::<Address>() {
            return IdentityKind::Account(address);
        }

        match self.0.parse::<PublicKey>() {
            Ok(public_key) => IdentityKind::Device(public_key),
            Err(_) => IdentityKind::Unknown,
        }
    }

    /// Returns `true` if this reference names exactly the given device.
    pub fn is_device(&self, public_key: &PublicKey) -> bool {
        matches!(self.kind(), IdentityKind::Device(key) if key == *public_key)
    }
}

/// Tagged form of an [`IdentityRef`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentityKind {
    /// Address of another access controller.
    Account(Address),

    /// Public key of a single device.
    Device(PublicKey),

    /// Neither an address nor a public key, can never be resolved to a device.
    Unknown,
}

impl From<PublicKey> for IdentityRef {
    fn from(value: PublicKey) -> Self {
        Self(value.to_hex())
    }
}

impl From<Address> for IdentityRef {
    fn from(value: Address) -> Self {
        Self(value.to_string())
    }
}

impl From<&PublicKey> for IdentityRef {
    fn from(value: &PublicKey) -> Self {
        Self(value.to_hex())
    }
}

impl From<&Address> for IdentityRef {
    fn from(value: &Address) -> Self {
        Self(value.to_string())
    }
}

impl FromStr for IdentityRef {
    type Err = IdentityRefError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::new(value)
    }
}

impl TryFrom<&str> for IdentityRef {
    type Error = IdentityRefError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for IdentityRef {
    type Error = IdentityRefError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl fmt::Display for IdentityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for IdentityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IdentityRef").field(&self.0).finish()
    }
}

impl Serialize for IdentityRef {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for IdentityRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Self::new(value).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityRefError {
    #[error("identity reference can not be empty")]
    Empty,
}

#[cfg(test)]
mod tests {
    use tessera_core::{Hash, PrivateKey};

    use crate::address::Address;

    use super::{IdentityKind, IdentityRef, IdentityRefError};

    #[test]
    fn classify_references() {
        let public_key = PrivateKey::new().public_key();
        let device = IdentityRef::from(public_key);
        assert_eq!(device.kind(), IdentityKind::Device(public_key));
        assert!(device.is_device(&public_key));

        let address = Address::new(Hash::new(b"manifest"));
        let account = IdentityRef::from(address);
        assert_eq!(account.kind(), IdentityKind::Account(address));
        assert!(!account.is_device(&public_key));

        let unknown: IdentityRef = "panda".parse().unwrap();
        assert_eq!(unknown.kind(), IdentityKind::Unknown);
    }

    #[test]
    fn canonical_spelling() {
        let address = Address::new(Hash::new(b"manifest"));
        let upper = format!("/tessera/{}", address.hash().to_hex().to_uppercase());
        assert_eq!(IdentityRef::new(upper.clone()).unwrap(), IdentityRef::from(address));
        assert_eq!(
            IdentityRef::new(upper.clone()).unwrap().as_str(),
            address.to_string()
        );

        let public_key = PrivateKey::new().public_key();
        let upper_key = public_key.to_hex().to_uppercase();
        assert_eq!(
            upper_key.parse::<IdentityRef>().unwrap(),
            IdentityRef::from(public_key)
        );

        let json = serde_json::to_string(&upper).unwrap();
        assert_eq!(
            serde_json::from_str::<IdentityRef>(&json).unwrap(),
            IdentityRef::from(address)
        );

        // Anything else is kept as it is.
        assert_eq!(IdentityRef::new("Panda").unwrap().as_str(), "Panda");
    }

    #[test]
    fn never_empty() {
        assert_eq!(IdentityRef::new(""), Err(IdentityRefError::Empty));
        assert!(serde_json::from_str::<IdentityRef>("\"\"").is_err());
    }
}
