// SPDX-License-Identifier: MIT OR Apache-2.0

//! Signed entries of an append-only log.
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::cbor::encode_cbor;
use crate::hash::Hash;
use crate::identity::{PrivateKey, PublicKey, Signature};

/// Entry of a replicated, append-only log.
///
/// The signature covers the log id, author, timestamp and payload. Which entries a log accepts is
/// decided by the access controller guarding it; an entry only claims an author, the claim is
/// checked with [`Entry::verified_author`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub log_id: Hash,
    pub public_key: PublicKey,
    pub timestamp: u64,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub signature: Option<Signature>,
}

impl Entry {
    /// Create an entry for the given log and sign it.
    pub fn new(private_key: &PrivateKey, log_id: Hash, payload: Vec<u8>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_micros() as u64)
            .unwrap_or_default();

        let mut entry = Self {
            log_id,
            public_key: private_key.public_key(),
            timestamp,
            payload,
            signature: None,
        };
        entry.sign(private_key);
        entry
    }

    /// Sign the entry, replacing the claimed author with the key's public counterpart.
    pub fn sign(&mut self, private_key: &PrivateKey) {
        self.public_key = private_key.public_key();
        self.signature = Some(private_key.sign(&self.signing_bytes()));
    }

    /// Bytes covered by the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let unsigned = (
            &self.log_id,
            &self.public_key,
            self.timestamp,
            serde_bytes::Bytes::new(&self.payload),
        );

        // All values in this module are serializable, writing into a vector can only fail on
        // allocation errors.
        encode_cbor(&unsigned).expect("CBOR encoder failed due to a critical IO error")
    }

    pub fn verify(&self) -> bool {
        match &self.signature {
            Some(signature) => self.public_key.verify(&self.signing_bytes(), signature),
            None => false,
        }
    }

    /// Returns the author of this entry if and only if the signature verifies.
    pub fn verified_author(&self) -> Option<PublicKey> {
        self.verify().then_some(self.public_key)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode_cbor(self).expect("CBOR encoder failed due to a critical IO error")
    }

    pub fn hash(&self) -> Hash {
        Hash::new(self.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use crate::cbor::decode_cbor;
    use crate::{Hash, PrivateKey};

    use super::Entry;

    #[test]
    fn signed_entry_verifies() {
        let private_key = PrivateKey::new();
        let entry = Entry::new(&private_key, Hash::new(b"log"), b"hello".to_vec());

        assert!(entry.verify());
        assert_eq!(entry.verified_author(), Some(private_key.public_key()));
    }

    #[test]
    fn tampering_breaks_signature() {
        let private_key = PrivateKey::new();
        let entry = Entry::new(&private_key, Hash::new(b"log"), b"hello".to_vec());

        let mut payload = entry.clone();
        payload.payload = b"goodbye".to_vec();
        assert_eq!(payload.verified_author(), None);

        let mut author = entry.clone();
        author.public_key = PrivateKey::new().public_key();
        assert_eq!(author.verified_author(), None);

        let mut unsigned = entry;
        unsigned.signature = None;
        assert!(!unsigned.verify());
    }

    #[test]
    fn decode_encoded_entry() {
        let private_key = PrivateKey::new();
        let entry = Entry::new(&private_key, Hash::new(b"log"), vec![1, 2, 3]);

        let decoded: Entry = decode_cbor(&entry.to_bytes()[..]).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(decoded.hash(), entry.hash());
        assert!(decoded.verify());
    }
}
