// SPDX-License-Identifier: MIT OR Apache-2.0

//! Flattened view over a controller's role table and all accounts nested in it.
//!
//! Every controller keeps one [`AccessIndex`]. It folds the own role table, follows grants to
//! other accounts into their role tables and publishes the result as an [`AccessSet`]. Opening
//! accounts which are not known locally yet is async and happens elsewhere; the index itself only
//! ever reads state which is already present, so it can be consulted from inside log guards.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use tessera_core::PublicKey;
use tessera_store::Log;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::address::Address;
use crate::identity::{IdentityKind, IdentityRef};
use crate::role::Role;
use crate::role_table::{RoleTable, RoleTableSnapshot};

/// Everyone with a role in a controller at one point in time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessSet {
    users: BTreeMap<IdentityRef, Role>,
    devices: BTreeMap<PublicKey, Role>,
    sources: BTreeMap<Address, usize>,
    unresolved: BTreeSet<Address>,
}

impl AccessSet {
    /// Identities granted a role in this controller directly, including the owner.
    pub fn users(&self) -> &BTreeMap<IdentityRef, Role> {
        &self.users
    }

    /// Devices holding a role, either directly or through any chain of nested accounts.
    pub fn devices(&self) -> &BTreeMap<PublicKey, Role> {
        &self.devices
    }

    /// Accounts reachable from this controller which could not be opened (yet).
    ///
    /// Their members are missing from [`AccessSet::devices`] until they resolve.
    pub fn unresolved(&self) -> &BTreeSet<Address> {
        &self.unresolved
    }

    /// Highest role the identity holds, `None` if it has none.
    pub fn role_of(&self, identity: &IdentityRef) -> Option<Role> {
        let user = self.users.get(identity).copied();
        let device = match identity.kind() {
            IdentityKind::Device(public_key) => self.devices.get(&public_key).copied(),
            _ => None,
        };
        user.max(device)
    }

    pub fn device_role(&self, public_key: &PublicKey) -> Option<Role> {
        self.devices.get(public_key).copied()
    }

    /// Returns `true` if this set was computed from the given account's role table.
    pub fn depends_on(&self, address: &Address) -> bool {
        self.sources.contains_key(address) || self.unresolved.contains(address)
    }

    /// Accounts whose role tables went into this set, excluding unresolved ones.
    pub(crate) fn sources(&self) -> impl Iterator<Item = &Address> {
        self.sources.keys()
    }

    fn grant_user(&mut self, identity: IdentityRef, role: Role) {
        let current = self.users.entry(identity).or_insert(role);
        *current = (*current).max(role);
    }

    fn grant_device(&mut self, public_key: PublicKey, role: Role) {
        let current = self.devices.entry(public_key).or_insert(role);
        *current = (*current).max(role);
    }

    /// Remember the height a role table was read at. The lowest one counts, so that a table
    /// which grew during the computation makes the set stale.
    fn record_source(&mut self, address: Address, height: usize) {
        let recorded = self.sources.entry(address).or_insert(height);
        *recorded = (*recorded).min(height);
    }
}

/// Read access to role tables of other controllers which are open locally.
pub(crate) trait ControllerLookup<LOG>: Send + Sync {
    fn role_table(&self, address: &Address) -> Option<RoleTable<LOG>>;
}

pub(crate) struct AccessIndex<LOG> {
    address: Address,
    owner: IdentityRef,
    role_table: OnceLock<RoleTable<LOG>>,
    lookup: Weak<dyn ControllerLookup<LOG>>,
    /// Serializes recomputations so that an older result is never published after a newer one.
    refresh_lock: Mutex<()>,
    tx: watch::Sender<Arc<AccessSet>>,
}

impl<LOG> AccessIndex<LOG>
where
    LOG: Log,
{
    pub(crate) fn new(
        address: Address,
        owner: IdentityRef,
        lookup: Weak<dyn ControllerLookup<LOG>>,
    ) -> Self {
        let (tx, _) = watch::channel(Arc::new(AccessSet::default()));
        Self {
            address,
            owner,
            role_table: OnceLock::new(),
            lookup,
            refresh_lock: Mutex::new(()),
            tx,
        }
    }

    /// Hand over the controller's own role table once its log is open.
    ///
    /// The log's guard needs the index before the log exists, hence the late initialisation.
    pub(crate) fn attach(&self, role_table: RoleTable<LOG>) {
        if self.role_table.set(role_table).is_err() {
            warn!(address = %self.address, "role table was already attached");
        }
        self.refresh();
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    pub(crate) fn owner(&self) -> &IdentityRef {
        &self.owner
    }

    pub(crate) fn role_table(&self) -> Option<&RoleTable<LOG>> {
        self.role_table.get()
    }

    /// Last published set, possibly behind the role tables.
    pub(crate) fn current(&self) -> Arc<AccessSet> {
        self.tx.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Arc<AccessSet>> {
        self.tx.subscribe()
    }

    /// Bring the published set up to date with everything available locally.
    ///
    /// Cheap when nothing changed: only the heights of all consulted role tables are compared.
    /// Subscribers are notified only if users or devices changed.
    pub(crate) fn refresh(&self) -> Arc<AccessSet> {
        let _guard = self
            .refresh_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let current = self.current();
        if !self.is_stale(&current) {
            return current;
        }

        let next = Arc::new(self.flatten());
        let changed = self.tx.send_if_modified(|value| {
            let changed = value.users != next.users || value.devices != next.devices;
            *value = next.clone();
            changed
        });

        if changed {
            debug!(
                address = %self.address,
                users = next.users.len(),
                devices = next.devices.len(),
                unresolved = next.unresolved.len(),
                "access set changed"
            );
        }

        next
    }

    fn is_stale(&self, set: &AccessSet) -> bool {
        let own_height = self.role_table().map(RoleTable::len).unwrap_or_default();
        if set.sources.get(&self.address) != Some(&own_height) {
            return true;
        }

        for (address, height) in &set.sources {
            if address == &self.address {
                continue;
            }
            match self.lookup(address) {
                Some(role_table) if role_table.len() == *height => (),
                _ => return true,
            }
        }

        set.unresolved
            .iter()
            .any(|address| self.lookup(address).is_some())
    }

    fn lookup(&self, address: &Address) -> Option<RoleTable<LOG>> {
        self.lookup.upgrade()?.role_table(address)
    }

    fn flatten(&self) -> AccessSet {
        let mut set = AccessSet::default();

        let snapshot = match self.role_table() {
            Some(role_table) => {
                self.validated(role_table, &mut BTreeSet::from([self.address]), &mut set)
            }
            None => RoleTableSnapshot::default(),
        };
        set.record_source(self.address, snapshot.height);

        // Every account gets expanded at most once per role it is reached with, this also cuts
        // cycles. The own address counts as expanded with the highest role from the start.
        let mut visited = HashMap::from([(self.address, Role::Moderator)]);

        set.grant_user(self.owner.clone(), Role::Moderator);
        self.collect(&self.owner, Role::Moderator, &mut visited, &mut set);

        for (identity, role) in snapshot.grants {
            self.collect(&identity, role, &mut visited, &mut set);
            set.grant_user(identity, role);
        }

        set
    }

    /// Add all devices behind an identity with the role it was granted at the top level.
    fn collect(
        &self,
        identity: &IdentityRef,
        role: Role,
        visited: &mut HashMap<Address, Role>,
        set: &mut AccessSet,
    ) {
        match identity.kind() {
            IdentityKind::Device(public_key) => set.grant_device(public_key, role),
            IdentityKind::Account(address) => {
                if visited
                    .get(&address)
                    .is_some_and(|expanded| *expanded >= role)
                {
                    return;
                }
                visited.insert(address, role);

                let Some(role_table) = self.lookup(&address) else {
                    set.unresolved.insert(address);
                    return;
                };

                let mut path = BTreeSet::from([self.address, address]);
                let snapshot = self.validated(&role_table, &mut path, set);
                set.record_source(address, snapshot.height);

                self.collect(role_table.owner(), role, visited, set);
                for nested in snapshot.grants.keys() {
                    self.collect(nested, role, visited, set);
                }
            }
            IdentityKind::Unknown => (),
        }
    }

    /// Fold a role table, keeping only grants whose author was a moderator of that table at the
    /// time the grant was delivered.
    ///
    /// Authors can be moderators as members of the owning account or of an account granted
    /// `MODERATOR`. `path` holds every account whose role table is being validated, this one
    /// included. Accounts on it lend no authority, which cuts cycles.
    fn validated(
        &self,
        role_table: &RoleTable<LOG>,
        path: &mut BTreeSet<Address>,
        set: &mut AccessSet,
    ) -> RoleTableSnapshot {
        let owner = role_table.owner().clone();
        let mut members: HashMap<Address, BTreeSet<PublicKey>> = HashMap::new();

        role_table.snapshot(|author, grants| {
            let moderators = grants
                .iter()
                .filter(|(_, role)| role.is_moderator())
                .map(|(identity, _)| identity);

            std::iter::once(&owner)
                .chain(moderators)
                .any(|identity| match identity.kind() {
                    IdentityKind::Device(public_key) => public_key == *author,
                    IdentityKind::Account(address) => members
                        .entry(address)
                        .or_insert_with(|| self.members(&address, &mut *path, &mut *set))
                        .contains(author),
                    IdentityKind::Unknown => false,
                })
        })
    }

    /// Devices behind an account, through validated role tables of all accounts nested in it.
    fn members(
        &self,
        address: &Address,
        path: &mut BTreeSet<Address>,
        set: &mut AccessSet,
    ) -> BTreeSet<PublicKey> {
        let mut devices = BTreeSet::new();
        if !path.insert(*address) {
            return devices;
        }

        match self.lookup(address) {
            Some(role_table) => {
                let snapshot = self.validated(&role_table, path, set);
                set.record_source(*address, snapshot.height);

                for identity in std::iter::once(role_table.owner()).chain(snapshot.grants.keys()) {
                    match identity.kind() {
                        IdentityKind::Device(public_key) => {
                            devices.insert(public_key);
                        }
                        IdentityKind::Account(nested) => {
                            devices.extend(self.members(&nested, path, set));
                        }
                        IdentityKind::Unknown => (),
                    }
                }
            }
            None => {
                set.unresolved.insert(*address);
            }
        }

        path.remove(address);
        devices
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, Weak};

    use tessera_core::{Hash, PrivateKey, PublicKey};
    use tessera_store::memory::{MemoryLog, MemoryLogStore};
    use tessera_store::{AllowAll, LogStore};

    use crate::address::Address;
    use crate::identity::IdentityRef;
    use crate::role::Role;
    use crate::role_table::{Grant, RoleTable};

    use super::{AccessIndex, ControllerLookup};

    /// Accounts known to the test, keyed by address.
    #[derive(Default)]
    struct Accounts(Mutex<HashMap<Address, RoleTable<MemoryLog>>>);

    impl ControllerLookup<MemoryLog> for Accounts {
        fn role_table(&self, address: &Address) -> Option<RoleTable<MemoryLog>> {
            self.0.lock().unwrap().get(address).cloned()
        }
    }

    struct Account {
        address: Address,
        owner: PrivateKey,
        table: RoleTable<MemoryLog>,
    }

    impl Account {
        async fn new(store: &MemoryLogStore, name: &str) -> Self {
            let owner = PrivateKey::new();
            let address = Address::new(Hash::new(name.as_bytes()));
            let log = store
                .open(&Hash::new(format!("{name}/roles")), Arc::new(AllowAll))
                .await
                .unwrap();
            Self {
                address,
                table: RoleTable::new(log, IdentityRef::from(owner.public_key())),
                owner,
            }
        }

        fn public_key(&self) -> PublicKey {
            self.owner.public_key()
        }

        async fn grant(&self, identity: impl Into<IdentityRef>, role: Role) {
            assert!(
                self.table
                    .append(&self.owner, &Grant::new(identity.into(), role))
                    .await
                    .unwrap()
            );
        }

        fn index(&self, accounts: &Arc<Accounts>) -> AccessIndex<MemoryLog> {
            let lookup: Weak<dyn ControllerLookup<MemoryLog>> = Arc::downgrade(accounts) as _;
            let index = AccessIndex::new(self.address, self.table.owner().clone(), lookup);
            index.attach(self.table.clone());
            index
        }
    }

    #[tokio::test]
    async fn owner_is_moderator() {
        let store = MemoryLogStore::new();
        let accounts = Arc::new(Accounts::default());
        let a = Account::new(&store, "a").await;
        let index = a.index(&accounts);

        let set = index.current();
        assert_eq!(set.device_role(&a.public_key()), Some(Role::Moderator));
        assert_eq!(set.users().len(), 1);
    }

    #[tokio::test]
    async fn refresh_picks_up_appends() {
        let store = MemoryLogStore::new();
        let accounts = Arc::new(Accounts::default());
        let a = Account::new(&store, "a").await;
        let index = a.index(&accounts);
        let mut rx = index.subscribe();
        rx.borrow_and_update();

        let bob = PrivateKey::new().public_key();
        a.grant(bob, Role::Member).await;

        // Nothing is published before somebody asks.
        assert!(!rx.has_changed().unwrap());
        assert_eq!(index.refresh().device_role(&bob), Some(Role::Member));
        assert!(rx.has_changed().unwrap());

        // A second refresh without changes returns the same set.
        rx.borrow_and_update();
        let before = index.current();
        let after = index.refresh();
        assert!(Arc::ptr_eq(&before, &after));
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn grants_of_strangers_are_ignored() {
        let store = MemoryLogStore::new();
        let accounts = Arc::new(Accounts::default());
        let a = Account::new(&store, "a").await;
        let index = a.index(&accounts);

        // The test tables accept everything, like a log written around its guard.
        let stranger = PrivateKey::new();
        let forged = Grant::new(IdentityRef::from(stranger.public_key()), Role::Moderator);
        assert!(a.table.append(&stranger, &forged).await.unwrap());

        let set = index.refresh();
        assert_eq!(set.device_role(&stranger.public_key()), None);
        assert_eq!(set.users().len(), 1);
    }

    #[tokio::test]
    async fn members_of_moderator_accounts_may_grant() {
        let store = MemoryLogStore::new();
        let accounts = Arc::new(Accounts::default());
        let a = Account::new(&store, "a").await;
        let b = Account::new(&store, "b").await;
        let carol = PrivateKey::new();
        let dave = PrivateKey::new().public_key();

        b.grant(carol.public_key(), Role::Member).await;
        a.grant(b.address, Role::Moderator).await;
        let grant = Grant::new(IdentityRef::from(dave), Role::Member);
        assert!(a.table.append(&carol, &grant).await.unwrap());

        // Carol's authority is unknown as long as b is not open.
        let index = a.index(&accounts);
        assert_eq!(index.current().device_role(&dave), None);

        accounts.0.lock().unwrap().insert(b.address, b.table.clone());
        let set = index.refresh();
        assert_eq!(set.device_role(&carol.public_key()), Some(Role::Moderator));
        assert_eq!(set.device_role(&dave), Some(Role::Member));
    }

    #[tokio::test]
    async fn nested_members_get_outer_role() {
        let store = MemoryLogStore::new();
        let accounts = Arc::new(Accounts::default());
        let a = Account::new(&store, "a").await;
        let b = Account::new(&store, "b").await;
        let carol = PrivateKey::new().public_key();

        b.grant(carol, Role::Moderator).await;
        a.grant(b.address, Role::Member).await;

        let index = a.index(&accounts);
        let set = index.current();
        assert!(set.unresolved().contains(&b.address));
        assert_eq!(set.device_role(&carol), None);

        accounts.0.lock().unwrap().insert(b.address, b.table.clone());
        let set = index.refresh();
        assert!(set.unresolved().is_empty());
        assert_eq!(set.device_role(&carol), Some(Role::Member));
        assert_eq!(set.device_role(&b.public_key()), Some(Role::Member));
        assert_eq!(
            set.role_of(&IdentityRef::from(b.address)),
            Some(Role::Member)
        );
    }

    #[tokio::test]
    async fn highest_role_over_all_paths() {
        let store = MemoryLogStore::new();
        let accounts = Arc::new(Accounts::default());
        let a = Account::new(&store, "a").await;
        let b = Account::new(&store, "b").await;
        let c = Account::new(&store, "c").await;

        // c is reachable as member through b and as moderator directly.
        b.grant(c.address, Role::Moderator).await;
        a.grant(b.address, Role::Member).await;
        a.grant(c.address, Role::Moderator).await;

        for account in [&b, &c] {
            accounts
                .0
                .lock()
                .unwrap()
                .insert(account.address, account.table.clone());
        }

        let set = a.index(&accounts).current();
        assert_eq!(set.device_role(&b.public_key()), Some(Role::Member));
        assert_eq!(set.device_role(&c.public_key()), Some(Role::Moderator));
    }

    #[tokio::test]
    async fn cycles_terminate() {
        let store = MemoryLogStore::new();
        let accounts = Arc::new(Accounts::default());
        let a = Account::new(&store, "a").await;
        let b = Account::new(&store, "b").await;

        a.grant(b.address, Role::Moderator).await;
        b.grant(a.address, Role::Moderator).await;
        a.grant(a.address, Role::Member).await;

        for account in [&a, &b] {
            accounts
                .0
                .lock()
                .unwrap()
                .insert(account.address, account.table.clone());
        }

        let set = a.index(&accounts).current();
        assert_eq!(set.devices().len(), 2);
        assert_eq!(set.device_role(&b.public_key()), Some(Role::Moderator));
    }

    #[tokio::test]
    async fn dropped_lookup_leaves_accounts_unresolved() {
        let store = MemoryLogStore::new();
        let accounts = Arc::new(Accounts::default());
        let a = Account::new(&store, "a").await;
        let b = Account::new(&store, "b").await;
        a.grant(b.address, Role::Moderator).await;
        a.grant(IdentityRef::new("panda").unwrap(), Role::Member).await;

        let index = a.index(&accounts);
        drop(accounts);

        let set = index.refresh();
        assert!(set.unresolved().contains(&b.address));
        assert_eq!(set.devices().len(), 1);
        assert_eq!(set.users().len(), 3);
    }
}
