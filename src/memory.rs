//! # In-Process Transport
//!
//! A [`MemoryNetwork`] connects any number of nodes inside one process.
//! Endpoints are plain strings; every stream is a `tokio::io::duplex` pipe.
//! Handshakes still exchange and verify signed entries, so identity checks
//! behave as they do over QUIC.
//!
//! [`MemoryNetwork::disconnect`] takes an endpoint offline and closes every
//! session that touches it, which is how tests model unreachable peers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::protocols::{spawn_stream_server, InboundHandler, Session, Stream, Transport};

/// Buffer size of one in-memory stream pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Streams a session end may have pending before `open_stream` waits.
const PENDING_STREAMS: usize = 32;

struct Link {
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Link {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

/// One end of an in-memory session.
pub struct MemorySession {
    link: Arc<Link>,
    outgoing: mpsc::Sender<Stream>,
    incoming: Mutex<mpsc::Receiver<Stream>>,
}

impl MemorySession {
    fn pair() -> (Arc<MemorySession>, Arc<MemorySession>, Arc<Link>) {
        let link = Arc::new(Link {
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        let (a_tx, b_rx) = mpsc::channel(PENDING_STREAMS);
        let (b_tx, a_rx) = mpsc::channel(PENDING_STREAMS);
        let a = Arc::new(MemorySession {
            link: link.clone(),
            outgoing: a_tx,
            incoming: Mutex::new(a_rx),
        });
        let b = Arc::new(MemorySession {
            link: link.clone(),
            outgoing: b_tx,
            incoming: Mutex::new(b_rx),
        });
        (a, b, link)
    }
}

#[async_trait]
impl Session for MemorySession {
    fn is_closed(&self) -> bool {
        self.link.closed.load(Ordering::SeqCst)
    }

    async fn open_stream(&self) -> Result<Stream> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let (remote_recv, remote_send) = tokio::io::split(remote);
        self.outgoing
            .send(Stream::new(remote_send, remote_recv))
            .await
            .map_err(|_| Error::SessionClosed)?;
        let (recv, send) = tokio::io::split(local);
        Ok(Stream::new(send, recv))
    }

    async fn accept_stream(&self) -> Option<Stream> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.link.cancel.cancelled() => None,
            stream = incoming.recv() => stream,
        }
    }

    fn close(&self) {
        self.link.close();
    }
}

/// Shared registry of listening endpoints.
#[derive(Default)]
pub struct MemoryNetwork {
    listeners: DashMap<String, Arc<dyn InboundHandler>>,
    links: DashMap<String, Vec<Arc<Link>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport reachable at `endpoint` on this network.
    pub fn transport(self: &Arc<Self>, endpoint: impl Into<String>) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
            endpoint: endpoint.into(),
        })
    }

    /// Take `endpoint` offline: new dials fail and its sessions close.
    pub fn disconnect(&self, endpoint: &str) {
        self.listeners.remove(endpoint);
        if let Some((_, links)) = self.links.remove(endpoint) {
            for link in links {
                link.close();
            }
        }
        debug!(endpoint, "memory endpoint disconnected");
    }

    pub fn is_listening(&self, endpoint: &str) -> bool {
        self.listeners.contains_key(endpoint)
    }

    fn track(&self, endpoint: &str, link: &Arc<Link>) {
        let mut links = self.links.entry(endpoint.to_string()).or_default();
        links.retain(|l| !l.closed.load(Ordering::SeqCst));
        links.push(link.clone());
    }
}

pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    endpoint: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(&self, endpoint: &str, local: &Entry) -> Result<(Entry, Arc<dyn Session>)> {
        if !self.network.is_listening(&self.endpoint) {
            return Err(Error::Unreachable(format!("{} is offline", self.endpoint)));
        }
        let handler = self
            .network
            .listeners
            .get(endpoint)
            .map(|h| h.value().clone())
            .ok_or_else(|| Error::Unreachable(format!("nothing listening on {}", endpoint)))?;

        local.verify()?;
        let (client, server, link) = MemorySession::pair();
        self.network.track(endpoint, &link);
        self.network.track(&self.endpoint, &link);

        let server_session: Arc<dyn Session> = server;
        let remote = match handler.handshake(local.clone(), server_session.clone()).await {
            Ok(entry) => entry,
            Err(e) => {
                link.close();
                return Err(e);
            }
        };
        if let Err(e) = remote.verify() {
            link.close();
            return Err(e);
        }

        spawn_stream_server(server_session, local.address, handler);
        debug!(peer = %remote.address.short(), endpoint, "memory session established");
        let client: Arc<dyn Session> = client;
        Ok((remote, client))
    }

    fn listen(&self, handler: Arc<dyn InboundHandler>) -> Result<()> {
        self.network.listeners.insert(self.endpoint.clone(), handler);
        Ok(())
    }

    fn local_endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn shutdown(&self) {
        self.network.disconnect(&self.endpoint);
    }
}
