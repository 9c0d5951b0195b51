// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tessera_core::cbor::EncodeError;
use tessera_core::{Entry, Hash, PublicKey};
use tessera_store::{AppendGuard, BlockStore, Log, LogStore};
use thiserror::Error;
use tracing::{debug, trace};

use crate::address::Address;
use crate::identity::{IdentityRef, IdentityRefError};
use crate::manifest::{Manifest, ManifestError};
use crate::registry::{ControllerCore, Registry};
use crate::resolver::{AccessIndex, AccessSet};
use crate::role::{Role, RoleError};
use crate::role_table::{Grant, RoleTableError};
use crate::subscription::Subscription;

/// Handle onto an open access controller.
///
/// Decides who may append to the log it governs: every device which holds a role in the
/// controller, either directly or through nested accounts. Moderators may grant roles.
///
/// Handles of the same controller in one [`Registry`] share all state. Closing or dropping the
/// last handle tears down the controller and every nested account nothing else refers to.
pub struct AccessController<L, B>
where
    L: LogStore,
    B: BlockStore,
{
    registry: Registry<L, B>,
    core: Arc<ControllerCore<L::Log>>,
    closed: AtomicBool,
}

impl<L, B> AccessController<L, B>
where
    L: LogStore,
    B: BlockStore,
{
    pub(crate) fn new(registry: Registry<L, B>, core: Arc<ControllerCore<L::Log>>) -> Self {
        Self {
            registry,
            core,
            closed: AtomicBool::new(false),
        }
    }

    /// Address of this controller, derived from its manifest.
    pub fn address(&self) -> Address {
        self.core.address
    }

    pub fn manifest(&self) -> &Manifest {
        &self.core.manifest
    }

    /// Identity which created this controller. It is always a moderator.
    pub fn owner(&self) -> &IdentityRef {
        &self.core.manifest.owner
    }

    pub fn label(&self) -> &str {
        &self.core.manifest.label
    }

    /// Id of the log holding the role table.
    pub fn role_table_id(&self) -> Hash {
        self.core.manifest.role_table
    }

    /// Grant a role to a device or account.
    ///
    /// Returns `false` if the identity already held exactly that role, nothing is written in
    /// that case. When this returns, the grant is reflected in all queries of this controller.
    /// Accounts it introduced are included as far as they could be opened within the open
    /// timeout, accounts which were unreachable before are left to the background resolver.
    pub async fn grant<R, I>(&self, role: R, identity: I) -> Result<bool, ControllerError>
    where
        R: TryInto<Role>,
        I: TryInto<IdentityRef>,
        ControllerError: From<R::Error> + From<I::Error>,
    {
        let role = role.try_into()?;
        let identity = identity.try_into()?;
        self.ensure_open()?;

        let before = self.core.index.refresh();
        if before.users().get(&identity) == Some(&role) {
            debug!(address = %self.core.address, %identity, %role, "role already granted");
            return Ok(false);
        }

        // Our own permission might come through an account which is not open yet.
        let own_role = before.device_role(&self.registry.public_key());
        if !own_role.is_some_and(|role| role.is_moderator()) {
            self.registry.settle(&self.core, &BTreeSet::new()).await;
        }

        let accepted = self
            .core
            .role_table
            .append(self.registry.private_key(), &Grant::new(identity.clone(), role))
            .await
            .map_err(|err| match err {
                RoleTableError::Encode(err) => ControllerError::Encode(err),
                RoleTableError::Log(err) => ControllerError::LogStore(Box::new(err)),
            })?;

        if !accepted {
            return Err(ControllerError::GrantDenied(
                self.registry.public_key(),
                self.core.address,
            ));
        }

        debug!(address = %self.core.address, %identity, %role, "granted role");
        self.registry.settle(&self.core, before.unresolved()).await;

        Ok(true)
    }

    /// Remove a role from an identity.
    ///
    /// Not supported, grants are permanent.
    pub async fn revoke<R, I>(&self, _role: R, _identity: I) -> Result<bool, ControllerError>
    where
        R: TryInto<Role>,
        I: TryInto<IdentityRef>,
    {
        Err(ControllerError::NotImplemented("revoke"))
    }

    /// Returns `true` if the identity holds any role.
    ///
    /// Devices count when they are granted directly or are members of a granted account. Never
    /// fails, malformed or unknown identities are not authorized.
    pub async fn is_authorized<I>(&self, identity: I) -> bool
    where
        I: TryInto<IdentityRef>,
    {
        self.role_of(identity).is_some()
    }

    pub async fn is_moderator<I>(&self, identity: I) -> bool
    where
        I: TryInto<IdentityRef>,
    {
        self.role_of(identity).is_some_and(|role| role.is_moderator())
    }

    /// Returns `true` if the identity may write to the governed log. Moderators are members
    /// as well.
    pub async fn is_member<I>(&self, identity: I) -> bool
    where
        I: TryInto<IdentityRef>,
    {
        self.role_of(identity).is_some_and(|role| role.is_member())
    }

    fn role_of<I>(&self, identity: I) -> Option<Role>
    where
        I: TryInto<IdentityRef>,
    {
        let identity = identity.try_into().ok()?;
        self.core.index.refresh().role_of(&identity)
    }

    /// Decide if an entry may be appended to the governed log.
    ///
    /// Accepts an entry only if its signature verifies and its author is an authorized device.
    pub fn can_append(&self, entry: &Entry) -> bool {
        can_append_entry(&self.core.index, entry)
    }

    /// Guard to hand to the log store when opening the governed log.
    pub fn guard(&self) -> Arc<dyn AppendGuard> {
        Arc::new(WriteGuard {
            index: self.core.index.clone(),
        })
    }

    /// Current access set, brought up to date with all locally available role tables.
    pub fn access_set(&self) -> Arc<AccessSet> {
        self.core.index.refresh()
    }

    /// Identities granted a role directly, including the owner.
    pub fn users(&self) -> BTreeMap<IdentityRef, Role> {
        self.access_set().users().clone()
    }

    /// All devices holding a role, directly or through nested accounts.
    pub fn devices(&self) -> BTreeMap<PublicKey, Role> {
        self.access_set().devices().clone()
    }

    /// Call back with the directly granted identities now and whenever they were recomputed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe_users<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(&BTreeMap<IdentityRef, Role>) + Send + 'static,
    {
        self.core.index.refresh();
        Subscription::spawn(self.core.index.subscribe(), AccessSet::users, callback)
    }

    /// Call back with all authorized devices now and whenever they were recomputed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe_devices<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(&BTreeMap<PublicKey, Role>) + Send + 'static,
    {
        self.core.index.refresh();
        Subscription::spawn(self.core.index.subscribe(), AccessSet::devices, callback)
    }

    /// Release this handle. Idempotent.
    ///
    /// The controller is torn down when this was the last handle and no other open controller
    /// in the registry refers to it.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry.release(&self.core.address);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), ControllerError> {
        if self.is_closed() || self.core.shutdown.is_cancelled() {
            return Err(ControllerError::Closed(self.core.address));
        }
        Ok(())
    }
}

impl<L, B> Drop for AccessController<L, B>
where
    L: LogStore,
    B: BlockStore,
{
    fn drop(&mut self) {
        self.close();
    }
}

impl<L, B> fmt::Debug for AccessController<L, B>
where
    L: LogStore,
    B: BlockStore,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessController")
            .field("address", &self.core.address)
            .field("owner", &self.core.manifest.owner)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn can_append_entry<LOG>(index: &AccessIndex<LOG>, entry: &Entry) -> bool
where
    LOG: Log,
{
    let Some(author) = entry.verified_author() else {
        trace!(address = %index.address(), "rejected entry with invalid signature");
        return false;
    };

    let authorized = index.refresh().device_role(&author).is_some();
    if !authorized {
        trace!(address = %index.address(), %author, "rejected entry of unauthorized author");
    }
    authorized
}

/// Guard of a log governed by an access controller.
struct WriteGuard<LOG> {
    index: Arc<AccessIndex<LOG>>,
}

impl<LOG> AppendGuard for WriteGuard<LOG>
where
    LOG: Log,
{
    fn can_append(&self, entry: &Entry) -> bool {
        can_append_entry(&self.index, entry)
    }
}

/// Guard of a controller's own role table.
///
/// Accepts well-formed grants signed by the owner or by any moderator device.
pub(crate) struct RoleTableGuard<LOG> {
    // The index owns the role table's log, which owns this guard.
    index: Weak<AccessIndex<LOG>>,
}

impl<LOG> RoleTableGuard<LOG> {
    pub(crate) fn new(index: Weak<AccessIndex<LOG>>) -> Self {
        Self { index }
    }
}

impl<LOG> AppendGuard for RoleTableGuard<LOG>
where
    LOG: Log,
{
    fn can_append(&self, entry: &Entry) -> bool {
        let Some(index) = self.index.upgrade() else {
            return false;
        };

        let Some(author) = entry.verified_author() else {
            debug!(address = %index.address(), "rejected grant with invalid signature");
            return false;
        };

        if let Err(err) = Grant::from_bytes(&entry.payload) {
            debug!(address = %index.address(), %author, "rejected malformed grant: {err}");
            return false;
        }

        if index.owner().is_device(&author) {
            return true;
        }

        let allowed = index
            .refresh()
            .device_role(&author)
            .is_some_and(|role| role.is_moderator());
        if !allowed {
            debug!(address = %index.address(), %author, "rejected grant of non-moderator");
        }
        allowed
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    InvalidRole(#[from] RoleError),

    #[error("invalid identity: {0}")]
    InvalidIdentity(#[from] IdentityRefError),

    #[error("{0} is not allowed to grant roles in {1}")]
    GrantDenied(PublicKey, Address),

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    #[error("manifest of account {0} is not available")]
    UnreachableAccount(Address),

    #[error("opening account {0} timed out")]
    Timeout(Address),

    #[error("opening account {0} was cancelled")]
    Cancelled(Address),

    #[error("block does not hash to address {0}")]
    ManifestMismatch(Address),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("could not encode grant: {0}")]
    Encode(EncodeError),

    #[error("block store error: {0}")]
    BlockStore(Box<dyn Error + Send + Sync>),

    #[error("log store error: {0}")]
    LogStore(Box<dyn Error + Send + Sync>),

    #[error("controller {0} is closed")]
    Closed(Address),
}

impl From<Infallible> for ControllerError {
    fn from(value: Infallible) -> Self {
        match value {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tessera_core::{Entry, PrivateKey};
    use tessera_store::AppendGuard;

    use crate::identity::IdentityRef;
    use crate::role::Role;
    use crate::role_table::Grant;
    use crate::test_utils::TestNetwork;

    use super::RoleTableGuard;

    #[tokio::test]
    async fn role_table_admission() {
        let network = TestNetwork::new();
        let owner = PrivateKey::new();
        let registry = network.peer_with_key(owner.clone());
        let controller = registry.create(None).await.unwrap();
        let guard = RoleTableGuard::new(Arc::downgrade(&controller.core.index));
        let log_id = controller.role_table_id();

        let moderator = PrivateKey::new();
        let member = PrivateKey::new();
        controller
            .grant(Role::Moderator, moderator.public_key())
            .await
            .unwrap();
        controller
            .grant(Role::Member, member.public_key())
            .await
            .unwrap();

        let grant = Grant::new(
            IdentityRef::from(PrivateKey::new().public_key()),
            Role::Member,
        )
        .to_bytes()
        .unwrap();

        assert!(guard.can_append(&Entry::new(&owner, log_id, grant.clone())));
        assert!(guard.can_append(&Entry::new(&moderator, log_id, grant.clone())));
        assert!(!guard.can_append(&Entry::new(&member, log_id, grant.clone())));
        assert!(!guard.can_append(&Entry::new(&PrivateKey::new(), log_id, grant.clone())));

        // Payloads need to be grants, even from the owner.
        assert!(!guard.can_append(&Entry::new(&owner, log_id, b"MODERATOR".to_vec())));

        let mut forged = Entry::new(&member, log_id, grant);
        forged.public_key = owner.public_key();
        assert!(!guard.can_append(&forged));
    }

    #[tokio::test]
    async fn closing_twice_is_harmless() {
        let network = TestNetwork::new();
        let registry = network.peer();
        let controller = registry.create(None).await.unwrap();
        let address = controller.address();

        controller.close();
        controller.close();
        drop(controller);
        assert!(!registry.is_open(&address));

        let reopened = registry.open(&address).await.unwrap();
        assert!(reopened.is_moderator(registry.public_key()).await);
    }
}
