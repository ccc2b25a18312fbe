//! # QUIC Transport
//!
//! Production [`Transport`]: one quinn endpoint serving both directions, with
//! mutual TLS over self-signed Ed25519 certificates.
//!
//! ## Session Setup
//!
//! ```text
//! dialer                                listener
//!   │ ── QUIC + mTLS ──────────────────────► │
//!   │ ── bi stream #0: Handshake{entry} ───► │  verify entry, check TLS key
//!   │ ◄── Handshake{entry} ───────────────── │  InboundHandler::handshake
//!   │  verify entry, check TLS key           │
//! ```
//!
//! Every later bi stream carries one request/response exchange.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use quinn::{ClientConfig, Connection, Endpoint, Incoming};
use tracing::{debug, info, warn};

use crate::config::CONNECTION_TIMEOUT;
use crate::crypto::{
    create_client_config, create_server_config, extract_verified_key, generate_ed25519_cert,
    SERVER_NAME,
};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::identity::{Address, Keypair};
use crate::messages::{read_frame, write_frame, Handshake};
use crate::protocols::{spawn_stream_server, InboundHandler, Session, Stream, Transport};

pub struct QuicSession {
    connection: Connection,
}

impl QuicSession {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }
}

#[async_trait]
impl Session for QuicSession {
    fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    async fn open_stream(&self) -> Result<Stream> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Stream::new(send, recv))
    }

    async fn accept_stream(&self) -> Option<Stream> {
        match self.connection.accept_bi().await {
            Ok((send, recv)) => Some(Stream::new(send, recv)),
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::LocallyClosed)
            | Err(quinn::ConnectionError::TimedOut) => None,
            Err(e) => {
                debug!(remote = %self.remote_address(), error = %e, "session ended");
                None
            }
        }
    }

    fn transport_rtt(&self) -> Option<Duration> {
        Some(self.connection.rtt())
    }

    fn close(&self) {
        self.connection.close(0u32.into(), b"closed");
    }
}

pub struct QuicTransport {
    endpoint: Endpoint,
    client_config: ClientConfig,
    advertised: String,
}

impl QuicTransport {
    /// Bind a QUIC endpoint on `addr` presenting a certificate for `keypair`.
    pub fn bind(addr: SocketAddr, keypair: &Keypair) -> Result<Self> {
        let (certs, key) = generate_ed25519_cert(keypair)?;
        let server_config = create_server_config(certs.clone(), key.clone_key())?;
        let client_config = create_client_config(certs, key)?;

        let endpoint = Endpoint::server(server_config, addr)
            .with_context(|| format!("failed to bind QUIC endpoint on {}", addr))?;
        let local = endpoint
            .local_addr()
            .context("failed to read bound address")?;
        info!(addr = %local, address = %keypair.address().short(), "QUIC endpoint bound");

        Ok(Self {
            endpoint,
            client_config,
            advertised: local.to_string(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    async fn connect(&self, endpoint: &str) -> anyhow::Result<Connection> {
        let addr = tokio::net::lookup_host(endpoint)
            .await
            .with_context(|| format!("failed to resolve {}", endpoint))?
            .next()
            .with_context(|| format!("no address for {}", endpoint))?;

        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, SERVER_NAME)
            .context("failed to start QUIC connection")?;

        let connection = tokio::time::timeout(CONNECTION_TIMEOUT, connecting)
            .await
            .context("connection timed out")?
            .context("QUIC handshake failed")?;
        Ok(connection)
    }
}

/// Check the handshake entry against the key proven during TLS.
fn check_handshake_entry(entry: &Entry, tls_key: Option<[u8; 32]>) -> Result<()> {
    let Some(tls_key) = tls_key else {
        return Err(Error::Transport("peer presented no usable certificate".into()));
    };
    if entry.public_key != tls_key {
        return Err(Error::IdentityMismatch {
            expected: Address::from_public_key(&tls_key),
            actual: entry.address,
        });
    }
    entry.verify()
}

#[async_trait]
impl Transport for QuicTransport {
    async fn dial(&self, endpoint: &str, local: &Entry) -> Result<(Entry, Arc<dyn Session>)> {
        let connection = self
            .connect(endpoint)
            .await
            .map_err(|e| Error::Unreachable(format!("{}: {:#}", endpoint, e)))?;

        let exchange = async {
            let (mut send, mut recv) = connection
                .open_bi()
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
            write_frame(&mut send, &Handshake { entry: local.clone() }).await?;
            let _ = send.finish();
            let reply: Handshake = read_frame(&mut recv).await?;
            Ok::<_, Error>(reply.entry)
        };

        let remote = match tokio::time::timeout(CONNECTION_TIMEOUT, exchange).await {
            Ok(Ok(entry)) => entry,
            Ok(Err(e)) => {
                connection.close(1u32.into(), b"handshake failed");
                return Err(e);
            }
            Err(_) => {
                connection.close(1u32.into(), b"handshake timeout");
                return Err(Error::Timeout(CONNECTION_TIMEOUT));
            }
        };

        if let Err(e) = check_handshake_entry(&remote, extract_verified_key(&connection)) {
            connection.close(1u32.into(), b"identity rejected");
            return Err(e);
        }

        debug!(peer = %remote.address.short(), endpoint, "outbound session established");
        Ok((remote, Arc::new(QuicSession::new(connection))))
    }

    fn listen(&self, handler: Arc<dyn InboundHandler>) -> Result<()> {
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            while let Some(incoming) = endpoint.accept().await {
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(incoming, handler).await {
                        warn!(error = %e, "inbound connection rejected");
                    }
                });
            }
            debug!("QUIC accept loop stopped");
        });
        Ok(())
    }

    fn local_endpoint(&self) -> String {
        self.advertised.clone()
    }

    async fn shutdown(&self) {
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

async fn handle_connection(incoming: Incoming, handler: Arc<dyn InboundHandler>) -> Result<()> {
    let connection = incoming
        .await
        .map_err(|e| Error::Transport(format!("failed to accept connection: {}", e)))?;
    let remote_addr = connection.remote_address();
    let tls_key = extract_verified_key(&connection);

    let (mut send, mut recv) = tokio::time::timeout(CONNECTION_TIMEOUT, connection.accept_bi())
        .await?
        .map_err(|e| Error::Transport(e.to_string()))?;
    let hello: Handshake = tokio::time::timeout(CONNECTION_TIMEOUT, read_frame(&mut recv)).await??;

    if let Err(e) = check_handshake_entry(&hello.entry, tls_key) {
        connection.close(1u32.into(), b"identity rejected");
        return Err(e);
    }

    let remote = hello.entry.address;
    let session: Arc<dyn Session> = Arc::new(QuicSession::new(connection));
    let local = handler.handshake(hello.entry, session.clone()).await?;
    write_frame(&mut send, &Handshake { entry: local }).await?;
    let _ = send.finish();

    debug!(peer = %remote.short(), addr = %remote_addr, "inbound session established");
    spawn_stream_server(session, remote, handler);
    Ok(())
}
