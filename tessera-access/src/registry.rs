// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-process registry of open access controllers.
//!
//! Every controller is opened at most once per registry, no matter how many handles or parent
//! controllers refer to it. Controllers nested in other controllers are opened on demand by the
//! parent's resolver and closed again as soon as no open handle can reach them anymore.
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tessera_core::{Hash, PrivateKey, PublicKey};
use tessera_store::{BlockStore, Log, LogEvent, LogStore};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::address::Address;
use crate::config::AccessConfig;
use crate::controller::{AccessController, ControllerError, RoleTableGuard};
use crate::identity::IdentityRef;
use crate::manifest::{Manifest, random_label};
use crate::resolver::{AccessIndex, ControllerLookup};
use crate::role_table::RoleTable;

/// Capacity of the registry's event channel.
const EVENT_CHANNEL_CAPACITY: usize = 512;

/// Lifecycle notifications of controllers in a registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A controller was opened, either through a handle or as nested account.
    Opened(Address),

    /// The role table of an open controller received new entries.
    Updated(Address),

    /// A controller was torn down.
    Closed(Address),
}

/// Builder for a [`Registry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    private_key: Option<PrivateKey>,
    config: AccessConfig,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the identity of this process which signs all grants.
    ///
    /// If this value is not set, a new, random key is generated when building the registry.
    pub fn private_key(mut self, private_key: PrivateKey) -> Self {
        self.private_key = Some(private_key);
        self
    }

    /// Overwrites the whole configuration.
    pub fn config(mut self, config: AccessConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the controller type written into new manifests and required from opened ones.
    pub fn controller_type(mut self, controller_type: impl Into<String>) -> Self {
        self.config.controller_type = controller_type.into();
        self
    }

    /// Sets how long opening a nested account may take before the resolver gives up on it.
    ///
    /// Default is 5 seconds.
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.config.open_timeout = timeout;
        self
    }

    /// Sets the interval of the re-check of accounts which could not be opened yet.
    ///
    /// Default is 30 seconds, `None` disables it.
    pub fn recheck_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.recheck_interval = interval;
        self
    }

    pub fn build<L, B>(self, log_store: L, blocks: B) -> Registry<L, B>
    where
        L: LogStore,
        B: BlockStore,
    {
        let private_key = self.private_key.unwrap_or_default();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Registry {
            inner: Arc::new(RegistryInner {
                log_store,
                blocks,
                private_key,
                config: self.config,
                controllers: Mutex::new(HashMap::new()),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

/// Open access controllers of this process.
///
/// Cloning a registry is cheap, all clones share the same controllers. Dropping the last clone
/// stops all resolvers.
pub struct Registry<L, B>
where
    L: LogStore,
    B: BlockStore,
{
    inner: Arc<RegistryInner<L, B>>,
}

impl<L, B> Clone for Registry<L, B>
where
    L: LogStore,
    B: BlockStore,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L, B> fmt::Debug for Registry<L, B>
where
    L: LogStore,
    B: BlockStore,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("public_key", &self.public_key())
            .field("controllers", &self.controllers())
            .finish_non_exhaustive()
    }
}

pub(crate) struct RegistryInner<L, B>
where
    L: LogStore,
    B: BlockStore,
{
    log_store: L,
    blocks: B,
    private_key: PrivateKey,
    config: AccessConfig,
    controllers: Mutex<HashMap<Address, RegistryEntry<L::Log>>>,
    events: broadcast::Sender<RegistryEvent>,
    shutdown: CancellationToken,
}

struct RegistryEntry<LOG> {
    core: Arc<ControllerCore<LOG>>,
    /// Number of open [`AccessController`] handles, zero for controllers only opened as nested
    /// accounts.
    handles: usize,
}

impl<L, B> ControllerLookup<L::Log> for RegistryInner<L, B>
where
    L: LogStore,
    B: BlockStore,
{
    fn role_table(&self, address: &Address) -> Option<RoleTable<L::Log>> {
        let controllers = self
            .controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        controllers
            .get(address)
            .map(|entry| entry.core.role_table.clone())
    }
}

impl<L, B> Drop for RegistryInner<L, B>
where
    L: LogStore,
    B: BlockStore,
{
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// State of one open controller, shared by all its handles and by its resolver.
pub(crate) struct ControllerCore<LOG> {
    pub(crate) address: Address,
    pub(crate) manifest: Manifest,
    pub(crate) role_table: RoleTable<LOG>,
    pub(crate) index: Arc<AccessIndex<LOG>>,
    pub(crate) shutdown: CancellationToken,
}

impl<LOG> ControllerCore<LOG>
where
    LOG: Log,
{
    fn close(&self) {
        self.shutdown.cancel();
        self.role_table.close();
    }
}

impl<L, B> Registry<L, B>
where
    L: LogStore,
    B: BlockStore,
{
    /// Registry signing with the given key and default configuration.
    pub fn new(log_store: L, blocks: B, private_key: PrivateKey) -> Self {
        RegistryBuilder::new()
            .private_key(private_key)
            .build(log_store, blocks)
    }

    /// Public key of the device identity of this process.
    pub fn public_key(&self) -> PublicKey {
        self.inner.private_key.public_key()
    }

    pub fn config(&self) -> &AccessConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    /// Addresses of all open controllers, including nested accounts.
    pub fn controllers(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self.lock().keys().copied().collect();
        addresses.sort();
        addresses
    }

    pub fn is_open(&self, address: &Address) -> bool {
        self.lock().contains_key(address)
    }

    /// Create a new controller.
    ///
    /// The owner is this process's device identity unless another identity, for example an
    /// account address, is given.
    pub async fn create(
        &self,
        owner: Option<IdentityRef>,
    ) -> Result<AccessController<L, B>, ControllerError> {
        let owner = owner.unwrap_or_else(|| IdentityRef::from(self.public_key()));
        let manifest = Manifest::new(&self.inner.config.controller_type, owner, random_label());

        let (hash, bytes) = manifest.encode()?;
        let stored = self
            .inner
            .blocks
            .put(bytes)
            .await
            .map_err(|err| ControllerError::BlockStore(Box::new(err)))?;
        if stored != hash {
            warn!(%hash, %stored, "block store returned unexpected hash for manifest");
        }

        let address = Address::new(hash);
        let core = self.insert(address, manifest, 1).await?;
        info!(%address, owner = %core.manifest.owner, "created access controller");

        Ok(AccessController::new(self.clone(), core))
    }

    /// Open an existing controller from its manifest.
    ///
    /// Fails with [`ControllerError::UnreachableAccount`] if the manifest block is not available.
    pub async fn open(&self, address: &Address) -> Result<AccessController<L, B>, ControllerError> {
        let core = self.open_core(address, 1).await?;
        debug!(%address, "opened access controller");
        Ok(AccessController::new(self.clone(), core))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Address, RegistryEntry<L::Log>>> {
        self.inner
            .controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn private_key(&self) -> &PrivateKey {
        &self.inner.private_key
    }

    /// Get an open controller or open it, adding `handles` to its handle count.
    pub(crate) async fn open_core(
        &self,
        address: &Address,
        handles: usize,
    ) -> Result<Arc<ControllerCore<L::Log>>, ControllerError> {
        if let Some(core) = self.acquire(address, handles) {
            return Ok(core);
        }

        let manifest = self.load_manifest(address).await?;
        self.insert(*address, manifest, handles).await
    }

    fn acquire(&self, address: &Address, handles: usize) -> Option<Arc<ControllerCore<L::Log>>> {
        let mut controllers = self.lock();
        let entry = controllers.get_mut(address)?;
        entry.handles += handles;
        Some(entry.core.clone())
    }

    async fn load_manifest(&self, address: &Address) -> Result<Manifest, ControllerError> {
        let bytes = self
            .inner
            .blocks
            .get(address.hash())
            .await
            .map_err(|err| ControllerError::BlockStore(Box::new(err)))?
            .ok_or(ControllerError::UnreachableAccount(*address))?;

        if Hash::new(&bytes) != *address.hash() {
            return Err(ControllerError::ManifestMismatch(*address));
        }

        let manifest = Manifest::decode(&bytes)?;
        manifest.validate_type(&self.inner.config.controller_type)?;
        Ok(manifest)
    }

    /// Open the role table of a controller and register it.
    ///
    /// If another task registered the same controller in the meantime, that one is used.
    async fn insert(
        &self,
        address: Address,
        manifest: Manifest,
        handles: usize,
    ) -> Result<Arc<ControllerCore<L::Log>>, ControllerError> {
        let lookup: Weak<dyn ControllerLookup<L::Log>> = Arc::downgrade(&self.inner) as _;
        let index = Arc::new(AccessIndex::new(address, manifest.owner.clone(), lookup));
        let guard = Arc::new(RoleTableGuard::new(Arc::downgrade(&index)));

        let log = self
            .inner
            .log_store
            .open(&manifest.role_table, guard)
            .await
            .map_err(|err| ControllerError::LogStore(Box::new(err)))?;
        let role_table = RoleTable::new(log, manifest.owner.clone());
        index.attach(role_table.clone());

        let core = Arc::new(ControllerCore {
            address,
            manifest,
            role_table,
            index,
            shutdown: self.inner.shutdown.child_token(),
        });

        {
            let mut controllers = self.lock();
            if let Some(entry) = controllers.get_mut(&address) {
                entry.handles += handles;
                let existing = entry.core.clone();
                drop(controllers);
                core.close();
                return Ok(existing);
            }

            controllers.insert(
                address,
                RegistryEntry {
                    core: core.clone(),
                    handles,
                },
            );
        }

        tokio::spawn(run_resolver(Arc::downgrade(&self.inner), core.clone()));
        let _ = self.inner.events.send(RegistryEvent::Opened(address));

        Ok(core)
    }

    /// Drop one handle of a controller and tear down everything no open handle can reach.
    pub(crate) fn release(&self, address: &Address) {
        let closed = {
            let mut controllers = self.lock();
            let Some(entry) = controllers.get_mut(address) else {
                return;
            };
            entry.handles = entry.handles.saturating_sub(1);
            if entry.handles > 0 {
                return;
            }
            sweep(&mut controllers)
        };

        for core in closed {
            core.close();
            debug!(address = %core.address, "closed access controller");
            let _ = self.inner.events.send(RegistryEvent::Closed(core.address));
        }
    }

    /// Open all accounts reachable from a controller which are not open yet and recompute its
    /// access set.
    ///
    /// Accounts which fail to open within the configured timeout are logged and left unresolved,
    /// they are retried on the next update or re-check.
    pub(crate) async fn resolve(&self, core: &ControllerCore<L::Log>) {
        let mut attempted = HashSet::new();

        loop {
            let set = core.index.refresh();
            let pending: Vec<Address> = set
                .unresolved()
                .iter()
                .filter(|address| attempted.insert(**address))
                .copied()
                .collect();

            if pending.is_empty() {
                break;
            }

            for address in pending {
                match self.open_nested(&address, &core.shutdown).await {
                    Ok(()) => trace!(parent = %core.address, %address, "opened nested account"),
                    Err(ControllerError::Cancelled(_)) => return,
                    Err(err) => {
                        debug!(parent = %core.address, %address, "could not open nested account: {err}")
                    }
                }
            }
        }
    }

    /// Open accounts which became reachable from a controller and are not in `known`, then
    /// recompute its access set.
    ///
    /// All of them are opened concurrently and share one deadline. Accounts in `known` are left
    /// to the background resolver.
    pub(crate) async fn settle(&self, core: &ControllerCore<L::Log>, known: &BTreeSet<Address>) {
        let deadline = Instant::now() + self.inner.config.open_timeout;
        let mut attempted: HashSet<Address> = known.iter().copied().collect();
        let mut tasks = JoinSet::new();

        loop {
            for address in core.index.refresh().unresolved() {
                if !attempted.insert(*address) {
                    continue;
                }
                let registry = self.clone();
                let token = core.shutdown.clone();
                let address = *address;
                tasks.spawn(async move { (address, registry.open_nested(&address, &token).await) });
            }

            match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((address, Ok(()))))) => {
                    trace!(parent = %core.address, %address, "opened nested account")
                }
                Ok(Some(Ok((_, Err(ControllerError::Cancelled(_)))))) => return,
                Ok(Some(Ok((address, Err(err))))) => {
                    debug!(parent = %core.address, %address, "could not open nested account: {err}")
                }
                Ok(Some(Err(err))) => warn!(parent = %core.address, "nested open failed: {err}"),
                Ok(None) => break,
                Err(_) => {
                    debug!(
                        parent = %core.address,
                        pending = tasks.len(),
                        "gave up waiting for nested accounts"
                    );
                    break;
                }
            }
        }

        core.index.refresh();
    }

    /// Open a nested account with a deadline, giving up when the parent closes.
    ///
    /// Returns a boxed future since opening a controller spawns its resolver, which in turn
    /// opens nested accounts.
    fn open_nested<'a>(
        &'a self,
        address: &'a Address,
        token: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), ControllerError>> + Send + 'a>> {
        let timeout = self.inner.config.open_timeout;

        Box::pin(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(ControllerError::Cancelled(*address)),
                result = tokio::time::timeout(timeout, self.open_core(address, 0)) => match result {
                    Ok(result) => result.map(|_| ()),
                    Err(_) => Err(ControllerError::Timeout(*address)),
                },
            }
        })
    }
}

/// Remove every controller which is neither held by a handle nor reachable from one.
fn sweep<LOG>(
    controllers: &mut HashMap<Address, RegistryEntry<LOG>>,
) -> Vec<Arc<ControllerCore<LOG>>>
where
    LOG: Log,
{
    let mut reachable = HashSet::new();
    for (address, entry) in controllers.iter() {
        if entry.handles == 0 {
            continue;
        }
        // The access set lists every account its resolution went through, transitively. It may
        // lag behind, so accounts it is still waiting for count as well.
        let set = entry.core.index.current();
        reachable.insert(*address);
        reachable.extend(set.sources().copied());
        reachable.extend(set.unresolved().iter().copied());
    }

    let unreachable: Vec<Address> = controllers
        .keys()
        .filter(|address| !reachable.contains(*address))
        .copied()
        .collect();

    unreachable
        .into_iter()
        .filter_map(|address| controllers.remove(&address))
        .map(|entry| entry.core)
        .collect()
}

/// Keep the access set of one controller current until it gets closed.
async fn run_resolver<L, B>(
    registry: Weak<RegistryInner<L, B>>,
    core: Arc<ControllerCore<L::Log>>,
) where
    L: LogStore,
    B: BlockStore,
{
    let Some(inner) = registry.upgrade() else {
        return;
    };
    let mut registry_events = inner.events.subscribe();
    let mut recheck = inner.config.recheck_interval.map(|period| {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    drop(inner);

    let mut log_events = core.role_table.log().subscribe();
    let mut refresh = true;

    loop {
        if refresh {
            let Some(inner) = registry.upgrade() else {
                break;
            };
            Registry { inner }.resolve(&core).await;
        }

        refresh = tokio::select! {
            biased;
            _ = core.shutdown.cancelled() => break,
            event = log_events.recv() => {
                match event {
                    Ok(LogEvent::Appended { height, .. }) => {
                        trace!(address = %core.address, height, "role table updated");
                    }
                    Err(RecvError::Lagged(_)) => (),
                    Err(RecvError::Closed) => break,
                }
                if let Some(inner) = registry.upgrade() {
                    let _ = inner.events.send(RegistryEvent::Updated(core.address));
                }
                true
            },
            event = registry_events.recv() => match event {
                Ok(
                    RegistryEvent::Opened(address)
                    | RegistryEvent::Updated(address)
                    | RegistryEvent::Closed(address),
                ) => address != core.address && core.index.current().depends_on(&address),
                Err(RecvError::Lagged(_)) => true,
                Err(RecvError::Closed) => break,
            },
            _ = tick(&mut recheck) => true,
        };
    }

    debug!(address = %core.address, "resolver stopped");
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use crate::role::Role;
    use crate::test_utils::TestNetwork;

    use super::sweep;

    #[tokio::test]
    async fn sweep_keeps_accounts_a_stale_set_waits_for() {
        let network = TestNetwork::new();
        let a1 = network.peer();
        let a = a1.create(None).await.unwrap();

        // b lives in another network, its manifest is not available here.
        let elsewhere = TestNetwork::new();
        let b = elsewhere.peer().create(None).await.unwrap();
        a.grant(Role::Member, b.address()).await.unwrap();
        assert!(a.access_set().unresolved().contains(&b.address()));

        // b gets opened as nested account before a's set was recomputed.
        a1.insert(b.address(), b.manifest().clone(), 0)
            .await
            .unwrap();
        let set = a1.lock().get(&a.address()).unwrap().core.index.current();
        assert!(set.unresolved().contains(&b.address()));

        let closed = sweep(&mut a1.lock());
        assert!(closed.is_empty());
        assert!(a1.is_open(&b.address()));
    }
}
