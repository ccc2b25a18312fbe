//! # Local Node
//!
//! [`LocalNode`] is the composition root. It owns the identity, the signed
//! local entry, the DHT table, the peer registry, the content stores and the
//! transport, and wires the resolver, mirror engine, seed managers and the
//! explorer on top of them.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = LocalNode::bind(NodeConfig::default()).await?;
//! node.bootstrap("198.51.100.7:5050").await?;
//! node.start_exploring();
//!
//! let entry = node.resolve(target).await?;
//! let report = node.mirror(entry.address, None).await?;
//! ```
//!
//! ## Shared State
//!
//! | Field | Shared with | Lifetime |
//! |-------|-------------|----------|
//! | `peers` | resolver, explorer, inbound handler | cleared at `shutdown` |
//! | `collections` | mirror engine, inbound handler | process |
//! | `databases` | mirror engine, inbound handler | process |
//! | `cancel` | explorer, seed managers | cancelled at `shutdown` |

use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::dht::Dht;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::explorer::Explorer;
use crate::identity::{Address, Keypair};
use crate::mirror::{mirror, CollectionCache, MirrorEvent, MirrorReport};
use crate::peer::{PeerHandle, PeerRegistry};
use crate::protocols::{spawn_stream_server, InboundHandler, Session, Transport};
use crate::resolver::Resolver;
use crate::rpc::NodeHandler;
use crate::seed::SeedManager;
use crate::store::{Collection, ContentStore, MemoryStore, Post};
use crate::transport::QuicTransport;

pub(crate) struct NodeInner {
    pub(crate) config: NodeConfig,
    pub(crate) keypair: Keypair,
    entry: RwLock<Entry>,
    pub(crate) dht: Dht,
    pub(crate) peers: PeerRegistry,
    pub(crate) store: Arc<dyn ContentStore>,
    collection: RwLock<Collection>,
    pub(crate) collections: CollectionCache,
    pub(crate) databases: DashMap<Address, Arc<dyn ContentStore>>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) cancel: CancellationToken,
    exploring: AtomicBool,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Split `host:port`, stripping IPv6 brackets.
fn split_endpoint(endpoint: &str) -> (String, u16) {
    match endpoint.rsplit_once(':') {
        Some((host, port)) => {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            (host.to_string(), port.parse().unwrap_or(0))
        }
        None => (endpoint.to_string(), 0),
    }
}

#[derive(Clone)]
pub struct LocalNode {
    inner: Arc<NodeInner>,
}

impl LocalNode {
    /// Bind a QUIC transport on `config.bind_addr`. With a data directory the
    /// key, entry and DHT table are loaded from it (the key is created on
    /// first run).
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        let keypair = match config.key_path() {
            Some(path) if path.exists() => Self::load_key(&path).await?,
            Some(path) => {
                if let Some(dir) = config.data_dir.as_ref() {
                    tokio::fs::create_dir_all(dir).await?;
                }
                let keypair = Keypair::generate();
                Self::save_key(&keypair, &path).await?;
                info!(path = %path.display(), "generated new identity");
                keypair
            }
            None => Keypair::generate(),
        };
        let transport = Arc::new(QuicTransport::bind(config.bind_addr, &keypair)?);
        let node = Self::with_transport(config, keypair, transport).await?;

        if let Some(path) = node.inner.config.entry_path()
            && path.exists()
        {
            if let Err(e) = node.load_entry(&path).await {
                warn!(path = %path.display(), error = %e, "ignoring stored entry");
            }
        }
        if let Some(path) = node.inner.config.dht_path()
            && path.exists()
        {
            match node.inner.dht.load(&path).await {
                Ok(loaded) => info!(loaded, "restored dht table"),
                Err(e) => warn!(path = %path.display(), error = %e, "ignoring stored dht table"),
            }
        }
        Ok(node)
    }

    /// Build a node over any transport and start listening on it.
    pub async fn with_transport(
        config: NodeConfig,
        keypair: Keypair,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        Self::with_store(config, keypair, transport, Arc::new(MemoryStore::new())).await
    }

    pub async fn with_store(
        config: NodeConfig,
        keypair: Keypair,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ContentStore>,
    ) -> Result<Self> {
        let (mut host, port) = split_endpoint(&transport.local_endpoint());
        if !config.public_address.is_empty() {
            host = config.public_address.clone();
        } else if host.parse::<IpAddr>().is_ok_and(|ip| ip.is_unspecified()) {
            host = "127.0.0.1".to_string();
        }

        let mut entry = Entry::new(&keypair, host, port);
        entry.name = config.name.clone();
        entry.description = config.description.clone();
        let mut collection = store.collection().await?;
        collection.sign(&keypair);
        entry.post_count = store.post_count().await?;
        entry.collection_hash = collection.collection_hash();
        entry.sign(&keypair);

        let address = keypair.address();
        let inner = Arc::new(NodeInner {
            dht: Dht::new(address, config.closest_count),
            config,
            keypair,
            entry: RwLock::new(entry),
            peers: PeerRegistry::new(),
            store,
            collection: RwLock::new(collection),
            collections: CollectionCache::new(),
            databases: DashMap::new(),
            transport,
            cancel: CancellationToken::new(),
            exploring: AtomicBool::new(false),
        });

        let handler: Arc<dyn InboundHandler> = Arc::new(NodeHandler::new(Arc::downgrade(&inner)));
        inner.transport.listen(handler)?;

        let node = Self { inner };
        info!(
            address = %address,
            endpoint = %node.entry().endpoint(),
            "local node started"
        );
        Ok(node)
    }

    pub(crate) fn from_inner(inner: Arc<NodeInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn handler(&self) -> Arc<dyn InboundHandler> {
        Arc::new(NodeHandler::new(Arc::downgrade(&self.inner)))
    }

    pub fn address(&self) -> Address {
        self.inner.keypair.address()
    }

    pub fn entry(&self) -> Entry {
        read(&self.inner.entry).clone()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn dht(&self) -> &Dht {
        &self.inner.dht
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.inner.peers
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.inner.store
    }

    /// Signed manifest of the local collection.
    pub fn collection(&self) -> Collection {
        read(&self.inner.collection).clone()
    }

    /// Manifests of collections mirrored from other nodes.
    pub fn collections(&self) -> &CollectionCache {
        &self.inner.collections
    }

    /// Store holding the mirror of `address`'s collection, created on demand.
    pub fn database(&self, address: Address) -> Arc<dyn ContentStore> {
        self.inner
            .databases
            .entry(address)
            .or_insert_with(|| Arc::new(MemoryStore::new()))
            .value()
            .clone()
    }

    /// Store mirrored from `address`, if one exists.
    pub(crate) fn mirrored(&self, address: &Address) -> Option<Arc<dyn ContentStore>> {
        self.inner.databases.get(address).map(|s| s.value().clone())
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    // ========================================================================
    // Local entry
    // ========================================================================

    /// Apply `change` to the local entry and re-sign it.
    fn update_entry<F: FnOnce(&mut Entry)>(&self, change: F) -> Entry {
        let mut entry = write(&self.inner.entry);
        change(&mut entry);
        entry.sign(&self.inner.keypair);
        entry.clone()
    }

    /// Re-sign the local entry as it stands.
    pub fn sign_entry(&self) -> Entry {
        self.update_entry(|_| {})
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        self.update_entry(|e| e.name = name);
    }

    pub fn set_description(&self, description: impl Into<String>) {
        let description = description.into();
        self.update_entry(|e| e.description = description);
    }

    pub fn set_public_address(&self, host: impl Into<String>, port: u16) {
        let host = host.into();
        self.update_entry(|e| {
            e.public_address = host;
            e.port = port;
        });
    }

    /// Append `seed` to the local seed list. Returns false if already present.
    pub(crate) fn add_own_seed(&self, seed: Address) -> bool {
        if seed == self.address() {
            return false;
        }
        let mut added = false;
        self.update_entry(|e| added = e.add_seed(seed));
        added
    }

    /// Persist a tracked entry: the local one is updated in place, any other
    /// goes to the DHT.
    pub(crate) async fn store_tracked_entry(&self, entry: &Entry) -> Result<()> {
        if entry.address == self.address() {
            let seeds = entry.seeds.clone();
            self.update_entry(|e| {
                for seed in seeds {
                    e.add_seed(seed);
                }
            });
            return Ok(());
        }
        self.inner.dht.insert_entry(entry).await?;
        Ok(())
    }

    /// Publish a post: store it, rebuild the signed manifest and re-sign the
    /// entry with the new counters.
    pub async fn add_post(&self, post: Post) -> Result<u64> {
        post.validate()?;
        info!(title = %post.title, "adding post");
        let id = self.inner.store.insert_post(post).await?;
        self.refresh_collection().await?;
        Ok(id)
    }

    async fn refresh_collection(&self) -> Result<()> {
        let mut collection = self.inner.store.collection().await?;
        collection.sign(&self.inner.keypair);
        let post_count = self.inner.store.post_count().await?;
        let hash = collection.collection_hash();
        *write(&self.inner.collection) = collection;
        self.update_entry(|e| {
            e.post_count = post_count;
            e.collection_hash = hash;
        });
        Ok(())
    }

    pub async fn save_entry(&self, path: &Path) -> Result<()> {
        let json = self.entry().to_json()?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Adopt name, description and seeds from a stored entry of this identity.
    pub async fn load_entry(&self, path: &Path) -> Result<Entry> {
        let stored = Entry::from_json(&tokio::fs::read(path).await?)?;
        if stored.address != self.address() {
            return Err(Error::IdentityMismatch {
                expected: self.address(),
                actual: stored.address,
            });
        }
        stored.verify()?;
        Ok(self.update_entry(|e| {
            e.name = stored.name;
            e.description = stored.description;
            for seed in stored.seeds {
                e.add_seed(seed);
            }
        }))
    }

    /// Write the raw secret key, readable by the owner only.
    pub async fn save_key(keypair: &Keypair, path: &Path) -> Result<()> {
        tokio::fs::write(path, keypair.secret_key_bytes()).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o400)).await?;
        }
        Ok(())
    }

    pub async fn load_key(path: &Path) -> Result<Keypair> {
        let bytes = tokio::fs::read(path).await?;
        let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            Error::Codec(format!("key file holds {} bytes, expected 32", bytes.len()))
        })?;
        Ok(Keypair::from_secret_key_bytes(&secret))
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Find the entry for `target` locally or by walking the overlay.
    pub async fn resolve(&self, target: Address) -> Result<Entry> {
        Resolver::new(self, self.inner.config.max_resolve_hops)
            .resolve(target)
            .await
    }

    /// Dial `endpoint` and handshake, or return the live handle already
    /// registered for it or for the address behind it.
    pub async fn connect_direct(&self, endpoint: &str) -> Result<Arc<PeerHandle>> {
        if let Some(peer) = self.inner.peers.get_by_endpoint(endpoint)
            && peer.is_connected()
        {
            return Ok(peer);
        }

        let local = self.entry();
        let (remote, session) = self.inner.transport.dial(endpoint, &local).await?;
        if remote.address == local.address {
            session.close();
            return Err(Error::Unreachable(format!("{} is the local node", endpoint)));
        }

        let handle = Arc::new(PeerHandle::new(
            remote.clone(),
            endpoint,
            session.clone(),
            self.inner.config.connection_timeout,
            self.inner.config.rpc_timeout,
        ));
        let registered = self.inner.peers.insert(handle.clone());
        self.inner.peers.index_endpoint(endpoint, remote.address);
        if !Arc::ptr_eq(&registered, &handle) {
            debug!(peer = %remote.address.short(), "reusing existing session");
            session.close();
            return Ok(registered);
        }

        if let Err(e) = self.inner.dht.insert_entry(&remote).await {
            debug!(peer = %remote.address.short(), error = %e, "not caching peer entry");
        }
        spawn_stream_server(session, remote.address, self.handler());
        info!(peer = %remote.address.short(), endpoint, "connected");
        Ok(registered)
    }

    /// Connect to the node advertised by `entry`, checking that the endpoint
    /// really belongs to it.
    pub(crate) async fn connect_entry(&self, entry: &Entry) -> Result<Arc<PeerHandle>> {
        if let Some(peer) = self.inner.peers.get(&entry.address)
            && peer.is_connected()
        {
            return Ok(peer);
        }
        let peer = self.connect_direct(&entry.endpoint()).await?;
        if peer.address() != entry.address {
            return Err(Error::IdentityMismatch {
                expected: entry.address,
                actual: peer.address(),
            });
        }
        Ok(peer)
    }

    /// Registry hit, or resolve `address` and dial its endpoint.
    pub async fn connect(&self, address: Address) -> Result<Arc<PeerHandle>> {
        if let Some(peer) = self.inner.peers.get(&address)
            && peer.is_connected()
        {
            return Ok(peer);
        }
        let entry = self.resolve(address).await?;
        self.connect_entry(&entry).await
    }

    /// Register a session a remote opened to us. An existing live handle
    /// wins; the new session then only serves the remote's requests. The
    /// remote's advertised endpoint is not indexed.
    pub(crate) async fn accept_peer(&self, remote: &Entry, session: Arc<dyn Session>) {
        let handle = Arc::new(PeerHandle::new(
            remote.clone(),
            remote.endpoint(),
            session,
            self.inner.config.connection_timeout,
            self.inner.config.rpc_timeout,
        ));
        self.inner.peers.insert(handle);
        if let Err(e) = self.inner.dht.insert_entry(remote).await {
            debug!(peer = %remote.address.short(), error = %e, "not caching peer entry");
        }
    }

    /// Send the local entry to `peer`.
    pub async fn announce(&self, peer: &PeerHandle) -> Result<()> {
        peer.announce(&self.entry()).await
    }

    /// Connect to a known endpoint and fill the DHT from it.
    pub async fn bootstrap(&self, endpoint: &str) -> Result<usize> {
        let peer = self.connect_direct(endpoint).await?;
        let inserted = peer.bootstrap(&self.inner.dht).await?;
        if let Err(e) = self.announce(&peer).await {
            debug!(peer = %peer.address().short(), error = %e, "announce after bootstrap failed");
        }
        info!(endpoint, inserted, "bootstrapped");
        Ok(inserted)
    }

    // ========================================================================
    // Content
    // ========================================================================

    /// Mirror `address`'s collection into [`LocalNode::database`]. The owner
    /// is tried first, then each of its seeds. Integrity and identity
    /// failures abort immediately; connection failures move on to the next
    /// source.
    pub async fn mirror(
        &self,
        address: Address,
        progress: Option<mpsc::Sender<MirrorEvent>>,
    ) -> Result<MirrorReport> {
        if address == self.address() {
            return Err(Error::Unreachable("cannot mirror the local collection".into()));
        }
        let owner = self.resolve(address).await?;
        let store = self.database(address);

        let mut last_error = match self.mirror_from_owner(&owner, store.as_ref(), progress.clone()).await {
            Ok(report) => return Ok(report),
            Err(e) if !e.is_unreachable() && !matches!(e, Error::NotFound(_)) => return Err(e),
            Err(e) => e,
        };
        warn!(peer = %address.short(), error = %last_error, "owner unavailable, trying seeds");

        for seed in owner.seeds.iter().filter(|s| **s != self.address() && **s != address) {
            let peer = match self.connect(*seed).await {
                Ok(peer) => peer,
                Err(e) => {
                    debug!(seed = %seed.short(), error = %e, "seed unreachable");
                    last_error = e;
                    continue;
                }
            };
            peer.set_seed_for(owner.clone());
            match mirror(&peer, store.as_ref(), &self.inner.collections, progress.clone()).await {
                Ok(report) => return Ok(report),
                Err(e) if e.is_unreachable() => {
                    debug!(seed = %seed.short(), error = %e, "seed failed");
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    async fn mirror_from_owner(
        &self,
        owner: &Entry,
        store: &dyn ContentStore,
        progress: Option<mpsc::Sender<MirrorEvent>>,
    ) -> Result<MirrorReport> {
        let peer = self.connect_entry(owner).await?;
        peer.clear_seed_for();
        peer.refresh_entry().await?;
        mirror(&peer, store, &self.inner.collections, progress).await
    }

    // ========================================================================
    // Background work
    // ========================================================================

    /// Start the explorer. Returns false if it is already running.
    pub fn start_exploring(&self) -> bool {
        if self.inner.exploring.swap(true, Ordering::SeqCst) {
            return false;
        }
        Explorer::new(self.clone()).spawn();
        true
    }

    /// Start a seed manager for `address`.
    pub async fn track(&self, address: Address) -> Result<SeedManager> {
        let manager = SeedManager::new(address, self.clone()).await?;
        manager.start();
        Ok(manager)
    }

    /// Stop background tasks, drop every session and persist state when a
    /// data directory is configured.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.peers.clear();

        if let Some(path) = self.inner.config.dht_path()
            && let Err(e) = self.inner.dht.save(&path).await
        {
            warn!(path = %path.display(), error = %e, "failed to save dht table");
        }
        if let Some(path) = self.inner.config.entry_path()
            && let Err(e) = self.save_entry(&path).await
        {
            warn!(path = %path.display(), error = %e, "failed to save entry");
        }

        self.inner.transport.shutdown().await;
        self.inner.dht.quit().await;
        info!(address = %self.address().short(), "local node stopped");
    }
}
