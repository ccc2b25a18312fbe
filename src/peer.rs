//! # Peer Handles
//!
//! A [`PeerHandle`] is the local proxy for one remote node. It owns the
//! [`Session`] to that node and exposes every RPC as a method that opens
//! exactly one stream, performs one exchange and releases the stream on all
//! paths before returning.
//!
//! ## Lifecycle
//!
//! ```text
//! connect_direct / inbound handshake ──► PeerRegistry ──► terminate / shutdown
//! ```
//!
//! Every stream-opening call first runs [`PeerHandle::check_connection`]:
//! no session fails `NoSession`, a closed one `SessionClosed`, and a ping that
//! does not return in time `Timeout`.
//!
//! ## Entry Cache
//!
//! [`PeerHandle::entry`] caches the remote entry on first fetch and never
//! expires it. Callers that need fresh counters use
//! [`PeerHandle::refresh_entry`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::dht::{Dht, KeyValue};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::identity::Address;
use crate::messages::{read_frame, write_frame, Request, Response};
use crate::protocols::{Session, Stream};
use crate::store::{Collection, Piece, Post};

/// Pieces a `stream_pieces` reader may buffer ahead of its consumer.
const PIECE_STREAM_BUFFER: usize = 16;

// ============================================================================
// Rate Limiting
// ============================================================================

/// Window over which per-class budgets refill.
const LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Lookups, announces and add-peer requests per window.
const QUERY_LIMIT: usize = 600;

/// Search, recent and popular requests per window.
const SEARCH_LIMIT: usize = 120;

/// Collection and piece transfers per window.
const TRANSFER_LIMIT: usize = 60;

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    limit: usize,
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            tokens: limit as f64,
            last_update: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        let rate = self.limit as f64 / LIMIT_WINDOW.as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(self.limit as f64);
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-peer budgets for inbound requests, one bucket per request class.
#[derive(Debug)]
pub struct PeerLimiter {
    query: TokenBucket,
    search: TokenBucket,
    transfer: TokenBucket,
}

impl Default for PeerLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerLimiter {
    pub fn new() -> Self {
        Self::with_limits(QUERY_LIMIT, SEARCH_LIMIT, TRANSFER_LIMIT)
    }

    pub fn with_limits(query: usize, search: usize, transfer: usize) -> Self {
        Self {
            query: TokenBucket::new(query),
            search: TokenBucket::new(search),
            transfer: TokenBucket::new(transfer),
        }
    }

    /// Charge `request` against its class. Pings are free.
    pub fn allow(&mut self, request: &Request) -> bool {
        match request {
            Request::Ping => true,
            Request::Query { .. }
            | Request::FindClosest { .. }
            | Request::Announce { .. }
            | Request::AddPeer { .. } => self.query.try_consume(),
            Request::Search { .. } | Request::Recent { .. } | Request::Popular { .. } => {
                self.search.try_consume()
            }
            Request::Collection { .. } | Request::Pieces { .. } => self.transfer.try_consume(),
        }
    }
}

// ============================================================================
// Peer Handle
// ============================================================================

pub struct PeerHandle {
    address: Address,
    public_key: [u8; 32],
    endpoint: String,
    session: RwLock<Option<Arc<dyn Session>>>,
    entry: RwLock<Option<Entry>>,
    seed_for: RwLock<Option<Entry>>,
    limiter: Mutex<PeerLimiter>,
    last_rtt_micros: AtomicU64,
    connection_timeout: Duration,
    rpc_timeout: Duration,
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("address", &self.address)
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl PeerHandle {
    /// Wrap a session whose handshake produced the verified `entry`.
    pub fn new(
        entry: Entry,
        endpoint: impl Into<String>,
        session: Arc<dyn Session>,
        connection_timeout: Duration,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            address: entry.address,
            public_key: entry.public_key,
            endpoint: endpoint.into(),
            session: RwLock::new(Some(session)),
            entry: RwLock::new(Some(entry)),
            seed_for: RwLock::new(None),
            limiter: Mutex::new(PeerLimiter::new()),
            last_rtt_micros: AtomicU64::new(0),
            connection_timeout,
            rpc_timeout,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public_key
    }

    /// Endpoint the session was established with.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn session(&self) -> Option<Arc<dyn Session>> {
        self.session.read().ok().and_then(|s| s.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.session().is_some_and(|s| !s.is_closed())
    }

    /// Last measured round-trip time, falling back to the transport's estimate.
    pub fn rtt(&self) -> Option<Duration> {
        match self.last_rtt_micros.load(Ordering::Relaxed) {
            0 => self.session().and_then(|s| s.transport_rtt()),
            micros => Some(Duration::from_micros(micros)),
        }
    }

    /// Charge an inbound request against this peer's budget.
    pub fn allow_request(&self, request: &Request) -> bool {
        match self.limiter.lock() {
            Ok(mut limiter) => limiter.allow(request),
            Err(_) => false,
        }
    }

    pub fn seed_for(&self) -> Option<Entry> {
        self.seed_for.read().ok().and_then(|s| s.clone())
    }

    /// Mark this peer as a seed replicating `entry`'s collection.
    pub fn set_seed_for(&self, entry: Entry) {
        if let Ok(mut slot) = self.seed_for.write() {
            *slot = Some(entry);
        }
    }

    pub fn clear_seed_for(&self) {
        if let Ok(mut slot) = self.seed_for.write() {
            *slot = None;
        }
    }

    /// Close and drop the session. Later calls fail with `NoSession`.
    pub fn terminate(&self) {
        let session = self.session.write().ok().and_then(|mut s| s.take());
        if let Some(session) = session {
            session.close();
            debug!(peer = %self.address.short(), "peer terminated");
        }
    }

    /// Verify the session is usable and answers a ping within `timeout`.
    pub async fn check_connection(&self, timeout: Duration) -> Result<Arc<dyn Session>> {
        let session = self.session().ok_or(Error::NoSession)?;
        if session.is_closed() {
            return Err(Error::SessionClosed);
        }
        let rtt = tokio::time::timeout(timeout, session.ping())
            .await
            .map_err(|_| Error::Timeout(timeout))??;
        self.last_rtt_micros
            .store(rtt.as_micros().max(1) as u64, Ordering::Relaxed);
        Ok(session)
    }

    /// Acquire a stream after a liveness check. The caller must close it.
    pub async fn open_stream(&self) -> Result<Stream> {
        let session = self.check_connection(self.connection_timeout).await?;
        tokio::time::timeout(self.connection_timeout, session.open_stream())
            .await
            .map_err(|_| Error::Timeout(self.connection_timeout))?
    }

    /// One request/response exchange on a fresh stream.
    async fn request(&self, request: Request) -> Result<Response> {
        let mut stream = self.open_stream().await?;
        trace!(peer = %self.address.short(), kind = request.kind(), "sending request");
        let result = tokio::time::timeout(self.rpc_timeout, stream.round_trip(&request)).await;
        stream.close().await;
        result.map_err(|_| Error::Timeout(self.rpc_timeout))??.into_result()
    }

    fn unexpected(&self, what: &str, response: Response) -> Error {
        warn!(peer = %self.address.short(), expected = what, got = ?response, "unexpected response");
        Error::Remote(format!("expected {} response", what))
    }

    pub async fn ping(&self) -> Result<Duration> {
        let session = self.check_connection(self.connection_timeout).await?;
        drop(session);
        self.rtt().ok_or(Error::NoSession)
    }

    /// Exact lookup of `address` in the remote's view.
    pub async fn query(&self, address: Address) -> Result<Option<KeyValue>> {
        match self.request(Request::Query { address }).await? {
            Response::Value(value) => Ok(value),
            other => Err(self.unexpected("value", other)),
        }
    }

    /// The remote's closest known records to `address`, closest first.
    pub async fn find_closest(&self, address: Address) -> Result<Vec<KeyValue>> {
        match self.request(Request::FindClosest { address }).await? {
            Response::Closest(records) => Ok(records),
            other => Err(self.unexpected("closest", other)),
        }
    }

    pub async fn search(&self, term: &str, page: usize) -> Result<Vec<Post>> {
        let request = Request::Search {
            term: term.to_string(),
            page,
        };
        match self.request(request).await? {
            Response::Posts(posts) => Ok(posts),
            other => Err(self.unexpected("posts", other)),
        }
    }

    pub async fn recent(&self, page: usize) -> Result<Vec<Post>> {
        match self.request(Request::Recent { page }).await? {
            Response::Posts(posts) => Ok(posts),
            other => Err(self.unexpected("posts", other)),
        }
    }

    pub async fn popular(&self, page: usize) -> Result<Vec<Post>> {
        match self.request(Request::Popular { page }).await? {
            Response::Posts(posts) => Ok(posts),
            other => Err(self.unexpected("posts", other)),
        }
    }

    /// Push `entry` into the remote's DHT.
    pub async fn announce(&self, entry: &Entry) -> Result<()> {
        let request = Request::Announce {
            entry: entry.clone(),
        };
        match self.request(request).await? {
            Response::Ack => Ok(()),
            other => Err(self.unexpected("ack", other)),
        }
    }

    /// Ask the remote to record us as a seed of `address`'s collection.
    pub async fn request_add_peer(&self, address: Address) -> Result<()> {
        match self.request(Request::AddPeer { address }).await? {
            Response::Ack => Ok(()),
            other => Err(self.unexpected("ack", other)),
        }
    }

    /// Fill `dht` with this peer's entry and its closest records to `dht`'s
    /// own address. Returns how many records were inserted.
    pub async fn bootstrap(&self, dht: &Dht) -> Result<usize> {
        let mut inserted = 0;
        let own = self.entry().await?;
        if dht.insert_entry(&own).await? {
            inserted += 1;
        }
        for record in self.find_closest(dht.address()).await? {
            match record.entry() {
                Ok(_) => {
                    if dht.insert(record).await {
                        inserted += 1;
                    }
                }
                Err(e) => debug!(peer = %self.address.short(), error = %e, "skipping invalid bootstrap record"),
            }
        }
        debug!(peer = %self.address.short(), inserted, "bootstrap complete");
        Ok(inserted)
    }

    pub async fn fetch_collection_manifest(
        &self,
        address: Address,
        public_key: [u8; 32],
    ) -> Result<Collection> {
        match self.request(Request::Collection { address, public_key }).await? {
            Response::Collection(collection) => Ok(collection),
            other => Err(self.unexpected("collection", other)),
        }
    }

    /// Stream `count` pieces of `address`'s collection starting at `since`.
    ///
    /// Pieces arrive in index order. The reader task owns the stream and
    /// closes it when the remote signals the end, on error, or when the
    /// receiver is dropped.
    pub async fn stream_pieces(
        &self,
        address: Address,
        since: u64,
        count: u64,
    ) -> Result<mpsc::Receiver<Result<Piece>>> {
        let mut stream = self.open_stream().await?;
        let request = Request::Pieces {
            address,
            since,
            count,
        };
        if let Err(e) = write_frame(&mut stream.send, &request).await {
            stream.close().await;
            return Err(e);
        }

        let (tx, rx) = mpsc::channel(PIECE_STREAM_BUFFER);
        let rpc_timeout = self.rpc_timeout;
        let peer = self.address;
        tokio::spawn(async move {
            loop {
                let frame = tokio::time::timeout(rpc_timeout, read_frame::<_, Response>(&mut stream.recv)).await;
                let item = match frame {
                    Err(_) => Err(Error::Timeout(rpc_timeout)),
                    Ok(Err(e)) => Err(e),
                    Ok(Ok(response)) => match response.into_result() {
                        Ok(Response::Piece(piece)) => Ok(piece),
                        Ok(Response::EndOfPieces) => break,
                        Ok(other) => Err(Error::Remote(format!("unexpected {:?} in piece stream", other))),
                        Err(e) => Err(e),
                    },
                };
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
            stream.close().await;
            trace!(peer = %peer.short(), "piece stream closed");
        });
        Ok(rx)
    }

    /// The remote's entry, fetched once and cached.
    pub async fn entry(&self) -> Result<Entry> {
        if let Some(entry) = self.entry.read().ok().and_then(|e| e.clone()) {
            return Ok(entry);
        }

        let record = self
            .query(self.address)
            .await?
            .ok_or(Error::NotFound(self.address))?;
        let entry = Entry::from_json(&record.value)?;
        if entry.address != self.address || entry.public_key != self.public_key {
            return Err(Error::IdentityMismatch {
                expected: self.address,
                actual: entry.address,
            });
        }
        entry.verify()?;

        if let Ok(mut slot) = self.entry.write() {
            *slot = Some(entry.clone());
        }
        Ok(entry)
    }

    /// Drop the cached entry and fetch it again.
    pub async fn refresh_entry(&self) -> Result<Entry> {
        if let Ok(mut slot) = self.entry.write() {
            *slot = None;
        }
        self.entry().await
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Live peer handles keyed by address, plus an endpoint index.
///
/// Created empty by the node and cleared on shutdown.
#[derive(Default)]
pub struct PeerRegistry {
    peers: DashMap<Address, Arc<PeerHandle>>,
    endpoints: DashMap<String, Address>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &Address) -> Option<Arc<PeerHandle>> {
        self.peers.get(address).map(|p| p.value().clone())
    }

    pub fn get_by_endpoint(&self, endpoint: &str) -> Option<Arc<PeerHandle>> {
        let address = *self.endpoints.get(endpoint)?.value();
        self.get(&address)
    }

    /// Insert `handle` unless a live handle for its address exists. Returns
    /// the handle that ended up registered. Endpoints are not indexed here;
    /// see [`PeerRegistry::index_endpoint`].
    pub fn insert(&self, handle: Arc<PeerHandle>) -> Arc<PeerHandle> {
        let registered = match self.peers.entry(handle.address()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                if existing.get().is_connected() {
                    existing.get().clone()
                } else {
                    existing.insert(handle.clone());
                    handle
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle.clone());
                handle
            }
        };
        registered
    }

    /// Record that dialing `endpoint` reached `address`. Only endpoints this
    /// node dialed itself are indexed; an inbound peer's advertised endpoint
    /// is unverified.
    pub fn index_endpoint(&self, endpoint: &str, address: Address) {
        self.endpoints.insert(endpoint.to_string(), address);
    }

    pub fn remove(&self, address: &Address) -> Option<Arc<PeerHandle>> {
        let (_, handle) = self.peers.remove(address)?;
        self.endpoints.retain(|_, a| a != address);
        Some(handle)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.peers.contains_key(address)
    }

    pub fn is_connected(&self, address: &Address) -> bool {
        self.get(address).is_some_and(|p| p.is_connected())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn handles(&self) -> Vec<Arc<PeerHandle>> {
        self.peers.iter().map(|p| p.value().clone()).collect()
    }

    /// Terminate every handle and empty the registry.
    pub fn clear(&self) {
        for handle in self.handles() {
            handle.terminate();
        }
        self.peers.clear();
        self.endpoints.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn limiter_exhausts_and_pings_are_free() {
        let mut limiter = PeerLimiter::with_limits(2, 1, 1);
        let query = Request::Query { address: Address::random() };
        assert!(limiter.allow(&query));
        assert!(limiter.allow(&query));
        assert!(!limiter.allow(&query));

        for _ in 0..10 {
            assert!(limiter.allow(&Request::Ping));
        }

        assert!(limiter.allow(&Request::Recent { page: 0 }));
        assert!(!limiter.allow(&Request::Popular { page: 0 }));
    }

    #[test]
    fn limiter_classes_are_independent() {
        let mut limiter = PeerLimiter::with_limits(1, 1, 1);
        assert!(limiter.allow(&Request::Query { address: Address::random() }));
        assert!(limiter.allow(&Request::Search { term: "x".into(), page: 0 }));
        assert!(limiter.allow(&Request::Pieces { address: Address::random(), since: 0, count: 1 }));
    }

    struct DeadSession;

    #[async_trait::async_trait]
    impl Session for DeadSession {
        fn is_closed(&self) -> bool {
            true
        }
        async fn open_stream(&self) -> Result<Stream> {
            Err(Error::SessionClosed)
        }
        async fn accept_stream(&self) -> Option<Stream> {
            None
        }
        fn close(&self) {}
    }

    fn handle() -> PeerHandle {
        let entry = Entry::new(&Keypair::generate(), "127.0.0.1", 1);
        PeerHandle::new(entry, "127.0.0.1:1", Arc::new(DeadSession), Duration::from_secs(1), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn closed_session_fails_before_any_stream() {
        let peer = handle();
        assert!(matches!(peer.check_connection(Duration::from_secs(1)).await, Err(Error::SessionClosed)));
        assert!(matches!(peer.query(Address::random()).await, Err(Error::SessionClosed)));
    }

    #[tokio::test]
    async fn terminated_handle_has_no_session() {
        let peer = handle();
        peer.terminate();
        assert!(matches!(peer.find_closest(Address::random()).await, Err(Error::NoSession)));
        assert!(!peer.is_connected());
    }

    #[tokio::test]
    async fn cached_entry_needs_no_network() {
        let peer = handle();
        let entry = peer.entry().await.unwrap();
        assert_eq!(entry.address, peer.address());
    }

    #[test]
    fn registry_keeps_live_handle_and_clears() {
        let registry = PeerRegistry::new();
        let first = Arc::new(handle());
        let registered = registry.insert(first.clone());
        assert!(Arc::ptr_eq(&registered, &first));
        assert!(registry.get_by_endpoint("127.0.0.1:1").is_none());
        registry.index_endpoint("127.0.0.1:1", first.address());
        assert!(registry.get_by_endpoint("127.0.0.1:1").is_some());
        assert_eq!(registry.len(), 1);

        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.get_by_endpoint("127.0.0.1:1").is_none());
    }

    #[test]
    fn remove_drops_every_indexed_endpoint() {
        let registry = PeerRegistry::new();
        let peer = Arc::new(handle());
        registry.insert(peer.clone());
        registry.index_endpoint("127.0.0.1:1", peer.address());
        registry.index_endpoint("localhost:1", peer.address());

        assert!(registry.remove(&peer.address()).is_some());
        assert!(registry.get_by_endpoint("127.0.0.1:1").is_none());
        assert!(registry.get_by_endpoint("localhost:1").is_none());
    }
}
