//! Trait seams between the overlay logic and the network.
//!
//! | Trait | Implemented by | Purpose |
//! |-------|----------------|---------|
//! | [`Session`] | `QuicSession`, `MemorySession` | one multiplexed connection |
//! | [`Transport`] | `QuicTransport`, `MemoryTransport` | dial + handshake, listen |
//! | [`InboundHandler`] | the node's RPC dispatcher | accept handshakes, serve streams |
//!
//! The overlay only ever sees these traits, so the same resolver, mirror and
//! gossip code runs over QUIC in production and over in-process pipes in tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::config::CONNECTION_TIMEOUT;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::identity::Address;
use crate::messages::{read_frame, write_frame, Request, Response};

/// One logical bidirectional stream. Used for exactly one exchange.
pub struct Stream {
    pub send: Box<dyn AsyncWrite + Send + Unpin>,
    pub recv: Box<dyn AsyncRead + Send + Unpin>,
}

impl Stream {
    pub fn new(
        send: impl AsyncWrite + Send + Unpin + 'static,
        recv: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            send: Box::new(send),
            recv: Box::new(recv),
        }
    }

    /// Send one request and read one response.
    pub async fn round_trip(&mut self, request: &Request) -> Result<Response> {
        write_frame(&mut self.send, request).await?;
        read_frame(&mut self.recv).await
    }

    /// Release the stream. Errors are irrelevant at this point.
    pub async fn close(mut self) {
        let _ = self.send.shutdown().await;
    }
}

#[async_trait]
pub trait Session: Send + Sync + 'static {
    fn is_closed(&self) -> bool;

    /// Open a new outbound stream.
    async fn open_stream(&self) -> Result<Stream>;

    /// Wait for the remote to open a stream. `None` once the session ends.
    async fn accept_stream(&self) -> Option<Stream>;

    /// Round-trip time reported by the transport, if it tracks one.
    fn transport_rtt(&self) -> Option<Duration> {
        None
    }

    fn close(&self);

    /// Liveness probe: one `Ping`/`Pong` exchange on a fresh stream.
    async fn ping(&self) -> Result<Duration> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let started = Instant::now();
        let mut stream = tokio::time::timeout(CONNECTION_TIMEOUT, self.open_stream()).await??;
        let result = stream.round_trip(&Request::Ping).await;
        stream.close().await;
        match result?.into_result()? {
            Response::Pong => Ok(started.elapsed()),
            other => Err(Error::Remote(format!("unexpected ping reply {:?}", other))),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Dial `endpoint`, exchange signed entries and return the remote's
    /// verified entry together with the new session.
    async fn dial(&self, endpoint: &str, local: &Entry) -> Result<(Entry, Arc<dyn Session>)>;

    /// Start accepting sessions, handing each to `handler`.
    fn listen(&self, handler: Arc<dyn InboundHandler>) -> Result<()>;

    /// Endpoint other nodes can dial to reach this transport.
    fn local_endpoint(&self) -> String;

    async fn shutdown(&self);
}

#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    /// A remote completed its half of the handshake with a verified entry.
    /// Returns the local entry to send back.
    async fn handshake(&self, remote: Entry, session: Arc<dyn Session>) -> Result<Entry>;

    /// Serve one stream the remote opened.
    async fn serve_stream(&self, remote: Address, stream: Stream);
}

/// Serve every stream `remote` opens on `session` until the session ends.
pub fn spawn_stream_server(
    session: Arc<dyn Session>,
    remote: Address,
    handler: Arc<dyn InboundHandler>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(stream) = session.accept_stream().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler.serve_stream(remote, stream).await;
            });
        }
        tracing::debug!(peer = %remote.short(), "session stream server stopped");
    })
}
