// SPDX-License-Identifier: MIT OR Apache-2.0

//! Immutable descriptor of an access controller.
//!
//! The manifest is stored as a CBOR-encoded block, its BLAKE3 hash is the controller's address.
//! Encoding is deterministic, any peer holding the block can reopen the same controller.
use serde::{Deserialize, Serialize};
use tessera_core::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use tessera_core::Hash;
use thiserror::Error;

use crate::address::Address;
use crate::identity::IdentityRef;

/// Controller type written into manifests by default.
pub const DEFAULT_CONTROLLER_TYPE: &str = "tessera/moderated/v1";

/// Number of random bytes in a freshly minted label.
const LABEL_LEN: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "type")]
    pub controller_type: String,

    /// Human-readable label, random for new controllers.
    pub label: String,

    /// Id of the role-table log.
    pub role_table: Hash,

    /// Identity which created the controller, it is always a moderator.
    pub owner: IdentityRef,
}

impl Manifest {
    /// Describe a new controller, deriving the role-table log id from owner and label.
    pub fn new(controller_type: &str, owner: IdentityRef, label: String) -> Self {
        let role_table = Hash::from_parts([
            b"tessera/role-table/".as_slice(),
            label.as_bytes(),
            b"/".as_slice(),
            owner.as_str().as_bytes(),
        ]);

        Self {
            controller_type: controller_type.to_string(),
            label,
            role_table,
            owner,
        }
    }

    /// Canonical block bytes and their hash.
    pub fn encode(&self) -> Result<(Hash, Vec<u8>), ManifestError> {
        let bytes = encode_cbor(self)?;
        Ok((Hash::new(&bytes), bytes))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ManifestError> {
        let manifest: Self = decode_cbor(bytes)?;
        if manifest.controller_type.is_empty() {
            return Err(ManifestError::MissingType);
        }
        if manifest.label.is_empty() {
            return Err(ManifestError::MissingLabel);
        }
        Ok(manifest)
    }

    pub fn address(&self) -> Result<Address, ManifestError> {
        let (hash, _) = self.encode()?;
        Ok(Address::new(hash))
    }

    /// Fail if this manifest describes a controller of another type.
    pub fn validate_type(&self, expected: &str) -> Result<(), ManifestError> {
        if self.controller_type != expected {
            return Err(ManifestError::UnexpectedType(
                self.controller_type.clone(),
                expected.to_string(),
            ));
        }
        Ok(())
    }
}

/// Fresh random label for a new controller.
pub fn random_label() -> String {
    hex::encode(rand::random::<[u8; LABEL_LEN]>())
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("could not encode manifest: {0}")]
    Encode(#[from] EncodeError),

    #[error("could not decode manifest: {0}")]
    Decode(#[from] DecodeError),

    #[error("manifest is missing a controller type")]
    MissingType,

    #[error("manifest is missing a label")]
    MissingLabel,

    #[error("manifest describes a \"{0}\" controller, expected \"{1}\"")]
    UnexpectedType(String, String),
}

#[cfg(test)]
mod tests {
    use tessera_core::cbor::encode_cbor;
    use tessera_core::{Hash, PrivateKey};

    use crate::identity::IdentityRef;

    use super::{DEFAULT_CONTROLLER_TYPE, Manifest, ManifestError, random_label};

    fn manifest(label: &str) -> Manifest {
        let owner = IdentityRef::from(PrivateKey::from_bytes(&[7; 32]).public_key());
        Manifest::new(DEFAULT_CONTROLLER_TYPE, owner, label.to_string())
    }

    #[test]
    fn same_inputs_same_address() {
        let (hash_1, bytes_1) = manifest("label").encode().unwrap();
        let (hash_2, bytes_2) = manifest("label").encode().unwrap();
        assert_eq!(bytes_1, bytes_2);
        assert_eq!(hash_1, hash_2);
        assert_eq!(hash_1, Hash::new(&bytes_1));
        assert_eq!(*manifest("label").address().unwrap().hash(), hash_1);

        let (hash_3, _) = manifest("other label").encode().unwrap();
        assert_ne!(hash_1, hash_3);
    }

    #[test]
    fn role_table_depends_on_owner_and_label() {
        let a = manifest("a");
        let b = manifest("b");
        assert_ne!(a.role_table, b.role_table);

        let other_owner = Manifest::new(
            DEFAULT_CONTROLLER_TYPE,
            IdentityRef::from(PrivateKey::new().public_key()),
            "a".into(),
        );
        assert_ne!(a.role_table, other_owner.role_table);
    }

    #[test]
    fn decode_encoded_manifest() {
        let manifest = manifest(&random_label());
        let (_, bytes) = manifest.encode().unwrap();
        assert_eq!(Manifest::decode(&bytes).unwrap(), manifest);
        assert!(manifest.validate_type(DEFAULT_CONTROLLER_TYPE).is_ok());
        assert!(matches!(
            manifest.validate_type("orbitdb"),
            Err(ManifestError::UnexpectedType(_, _))
        ));
    }

    #[test]
    fn reject_invalid_blocks() {
        assert!(matches!(
            Manifest::decode(&[0xff, 0x00, 0x13]),
            Err(ManifestError::Decode(_))
        ));

        let mut empty_label = manifest("label");
        empty_label.label = String::new();
        let bytes = encode_cbor(&empty_label).unwrap();
        assert!(matches!(
            Manifest::decode(&bytes),
            Err(ManifestError::MissingLabel)
        ));
    }

    #[test]
    fn labels_are_random() {
        let label = random_label();
        assert_eq!(label.len(), 32);
        assert_ne!(label, random_label());
    }
}
