// SPDX-License-Identifier: MIT OR Apache-2.0

//! Replicated key/value log mapping identity references to roles.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tessera_core::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use tessera_core::{Entry, Hash, PrivateKey, PublicKey};
use tessera_store::Log;
use tracing::{debug, warn};

use crate::identity::IdentityRef;
use crate::role::Role;

/// Payload of one role-table entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub key: IdentityRef,
    pub value: Role,
}

impl Grant {
    pub fn new(key: IdentityRef, value: Role) -> Self {
        Self { key, value }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        encode_cbor(self)
    }

    /// Decode a grant, failing on unknown roles and empty identity references.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode_cbor(bytes)
    }
}

/// Grants of a role table at one version of its log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoleTableSnapshot {
    /// Number of log entries this snapshot was folded from.
    pub height: usize,

    /// Explicit grants, last write wins. Does not contain the implicit owner grant.
    pub grants: BTreeMap<IdentityRef, Role>,
}

/// Role table of one access controller.
///
/// Writes go through [`RoleTable::append`], the log's guard decides if the author may grant.
#[derive(Clone, Debug)]
pub struct RoleTable<LOG> {
    log: LOG,
    owner: IdentityRef,
}

impl<LOG> RoleTable<LOG>
where
    LOG: Log,
{
    pub fn new(log: LOG, owner: IdentityRef) -> Self {
        Self { log, owner }
    }

    pub fn id(&self) -> Hash {
        self.log.id()
    }

    pub fn owner(&self) -> &IdentityRef {
        &self.owner
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Fold all entries of the log, in delivery order, into the current grants.
    ///
    /// Entries were checked by the guard of whichever handle appended them, which is not
    /// necessarily ours. So every entry is checked again here: its signature must verify, it
    /// must decode to a grant and its author must have been a moderator at that point.
    /// `is_moderator` answers the latter from the grants folded so far, the owner device is
    /// always accepted.
    pub fn snapshot<F>(&self, mut is_moderator: F) -> RoleTableSnapshot
    where
        F: FnMut(&PublicKey, &BTreeMap<IdentityRef, Role>) -> bool,
    {
        let entries = self.log.entries();
        let height = entries.len();
        let mut grants = BTreeMap::new();

        for entry in entries {
            let Some(author) = entry.verified_author() else {
                warn!(log_id = %self.log.id(), "ignoring grant with invalid signature");
                continue;
            };

            let grant = match Grant::from_bytes(&entry.payload) {
                Ok(grant) => grant,
                Err(err) => {
                    warn!(log_id = %self.log.id(), %author, "ignoring invalid grant: {err}");
                    continue;
                }
            };

            if !self.owner.is_device(&author) && !is_moderator(&author, &grants) {
                debug!(log_id = %self.log.id(), %author, "ignoring grant of non-moderator");
                continue;
            }

            grants.insert(grant.key, grant.value);
        }

        RoleTableSnapshot { height, grants }
    }

    /// Sign and append a grant as the given identity.
    ///
    /// Returns `Ok(false)` if the log's guard rejected it.
    pub async fn append(
        &self,
        private_key: &PrivateKey,
        grant: &Grant,
    ) -> Result<bool, RoleTableError<LOG::Error>> {
        let payload = grant.to_bytes()?;
        let entry = Entry::new(private_key, self.log.id(), payload);
        self.log.append(entry).await.map_err(RoleTableError::Log)
    }

    pub fn log(&self) -> &LOG {
        &self.log
    }

    pub(crate) fn close(&self) {
        self.log.close();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RoleTableError<E> {
    #[error("could not encode grant: {0}")]
    Encode(#[from] EncodeError),

    #[error("role table log error: {0}")]
    Log(E),
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use tessera_core::cbor::encode_cbor;
    use tessera_core::{Entry, Hash, PrivateKey, PublicKey};
    use tessera_store::memory::MemoryLogStore;
    use tessera_store::{AllowAll, Log, LogStore};

    use crate::identity::IdentityRef;
    use crate::role::Role;

    use super::{Grant, RoleTable};

    #[test]
    fn grant_payload_validation() {
        let grant = Grant::new("panda".parse().unwrap(), Role::Member);
        let bytes = grant.to_bytes().unwrap();
        assert_eq!(Grant::from_bytes(&bytes).unwrap(), grant);

        #[derive(serde::Serialize)]
        struct RawGrant {
            key: &'static str,
            value: &'static str,
        }

        let unknown_role = encode_cbor(&RawGrant {
            key: "panda",
            value: "OWNER",
        })
        .unwrap();
        assert!(Grant::from_bytes(&unknown_role).is_err());

        let empty_key = encode_cbor(&RawGrant {
            key: "",
            value: "MEMBER",
        })
        .unwrap();
        assert!(Grant::from_bytes(&empty_key).is_err());
    }

    /// Accept grants of the owner and of every device granted `MODERATOR` so far.
    fn direct_moderators(author: &PublicKey, grants: &BTreeMap<IdentityRef, Role>) -> bool {
        grants.get(&IdentityRef::from(author)) == Some(&Role::Moderator)
    }

    #[tokio::test]
    async fn last_write_wins() {
        let owner = PrivateKey::new();
        let log = MemoryLogStore::new()
            .open(&Hash::new(b"roles"), Arc::new(AllowAll))
            .await
            .unwrap();
        let table = RoleTable::new(log, IdentityRef::from(owner.public_key()));

        let bob = IdentityRef::from(PrivateKey::new().public_key());
        table
            .append(&owner, &Grant::new(bob.clone(), Role::Member))
            .await
            .unwrap();
        let snapshot = table.snapshot(direct_moderators);
        assert_eq!(snapshot.grants.get(&bob), Some(&Role::Member));

        table
            .append(&owner, &Grant::new(bob.clone(), Role::Moderator))
            .await
            .unwrap();
        let snapshot = table.snapshot(direct_moderators);
        assert_eq!(snapshot.height, 2);
        assert_eq!(snapshot.grants.get(&bob), Some(&Role::Moderator));
    }

    #[tokio::test]
    async fn grants_count_in_delivery_order() {
        let owner = PrivateKey::new();
        let log = MemoryLogStore::new()
            .open(&Hash::new(b"roles"), Arc::new(AllowAll))
            .await
            .unwrap();
        let table = RoleTable::new(log, IdentityRef::from(owner.public_key()));

        let bob = PrivateKey::new();
        let carol = IdentityRef::from(PrivateKey::new().public_key());
        let dave = IdentityRef::from(PrivateKey::new().public_key());

        // Written around any guard: bob is no moderator yet.
        table
            .append(&bob, &Grant::new(carol.clone(), Role::Member))
            .await
            .unwrap();
        table
            .append(&owner, &Grant::new(IdentityRef::from(bob.public_key()), Role::Moderator))
            .await
            .unwrap();
        table
            .append(&bob, &Grant::new(dave.clone(), Role::Member))
            .await
            .unwrap();

        let snapshot = table.snapshot(direct_moderators);
        assert_eq!(snapshot.height, 3);
        assert_eq!(snapshot.grants.get(&carol), None);
        assert_eq!(snapshot.grants.get(&dave), Some(&Role::Member));
    }

    #[tokio::test]
    async fn skip_undecodable_entries() {
        let log = MemoryLogStore::new()
            .open(&Hash::new(b"roles"), Arc::new(AllowAll))
            .await
            .unwrap();
        let key = PrivateKey::new();
        log.append(Entry::new(&key, log.id(), b"garbage".to_vec()))
            .await
            .unwrap();

        let table = RoleTable::new(log, IdentityRef::from(key.public_key()));
        let snapshot = table.snapshot(direct_moderators);
        assert_eq!(snapshot.height, 1);
        assert!(snapshot.grants.is_empty());
    }
}
