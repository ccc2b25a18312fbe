//! # Inbound Request Handling
//!
//! [`NodeHandler`] is the node's [`InboundHandler`]. Every transport hands it
//! completed handshakes and the streams remotes open afterwards.
//!
//! ## Dispatch
//!
//! | Request | Served from |
//! |---------|-------------|
//! | `Ping` | always answered, never rate limited |
//! | `Query` | local entry for the local address, else the DHT |
//! | `FindClosest` | DHT |
//! | `Search`, `Recent`, `Popular` | local content store |
//! | `Announce` | verified, then inserted into the DHT |
//! | `Collection`, `Pieces` | local collection, or a mirrored one when seeding |
//! | `AddPeer` | requester appended to the matching entry's seeds |
//!
//! Each request is charged against the sending peer's [`PeerLimiter`] first;
//! an exhausted budget is answered with `RateLimited`.
//!
//! [`PeerLimiter`]: crate::peer::PeerLimiter

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::dht::KeyValue;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::identity::Address;
use crate::messages::{read_frame, write_frame, Request, Response};
use crate::node::{LocalNode, NodeInner};
use crate::protocols::{InboundHandler, Session, Stream};
use crate::store::ContentStore;

/// Time a remote gets to send its request after opening a stream.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on handling one non-streaming request.
const REQUEST_PROCESS_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) struct NodeHandler {
    node: Weak<NodeInner>,
}

impl NodeHandler {
    pub(crate) fn new(node: Weak<NodeInner>) -> Self {
        Self { node }
    }

    fn node(&self) -> Result<LocalNode> {
        self.node
            .upgrade()
            .map(LocalNode::from_inner)
            .ok_or_else(|| Error::Unreachable("local node has shut down".into()))
    }
}

#[async_trait]
impl InboundHandler for NodeHandler {
    async fn handshake(&self, remote: Entry, session: Arc<dyn Session>) -> Result<Entry> {
        let node = self.node()?;
        if remote.address == node.address() {
            return Err(Error::Unreachable("refusing session with the local identity".into()));
        }
        node.accept_peer(&remote, session).await;
        debug!(peer = %remote.address.short(), "accepted inbound session");
        Ok(node.entry())
    }

    async fn serve_stream(&self, remote: Address, mut stream: Stream) {
        let Ok(node) = self.node() else {
            stream.close().await;
            return;
        };
        if let Err(e) = handle_stream(&node, remote, &mut stream).await {
            debug!(peer = %remote.short(), error = %e, "stream ended with error");
        }
        stream.close().await;
    }
}

async fn handle_stream(node: &LocalNode, remote: Address, stream: &mut Stream) -> Result<()> {
    let request: Request = tokio::time::timeout(REQUEST_READ_TIMEOUT, read_frame(&mut stream.recv))
        .await
        .map_err(|_| Error::Timeout(REQUEST_READ_TIMEOUT))??;
    trace!(peer = %remote.short(), kind = request.kind(), "inbound request");

    if let Some(peer) = node.peers().get(&remote)
        && !peer.allow_request(&request)
    {
        warn!(peer = %remote.short(), kind = request.kind(), "rate limit exceeded");
        return write_frame(&mut stream.send, &Response::RateLimited).await;
    }

    if let Request::Pieces {
        address,
        since,
        count,
    } = request
    {
        return serve_pieces(node, stream, address, since, count).await;
    }

    let response = match tokio::time::timeout(REQUEST_PROCESS_TIMEOUT, handle_request(node, remote, request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => Response::Error {
            message: e.to_string(),
        },
        Err(_) => {
            warn!(peer = %remote.short(), "request processing timed out");
            Response::Error {
                message: "request processing timeout".to_string(),
            }
        }
    };
    write_frame(&mut stream.send, &response).await
}

async fn handle_request(node: &LocalNode, remote: Address, request: Request) -> Result<Response> {
    match request {
        Request::Ping => Ok(Response::Pong),
        Request::Query { address } => {
            if address == node.address() {
                return Ok(Response::Value(Some(KeyValue::from_entry(&node.entry())?)));
            }
            Ok(Response::Value(node.dht().query(&address).await))
        }
        Request::FindClosest { address } => {
            let closest = node.dht().find_closest(&address).await;
            debug!(peer = %remote.short(), target = %address.short(), returned = closest.len(), "find_closest");
            Ok(Response::Closest(closest))
        }
        Request::Search { term, page } => Ok(Response::Posts(node.store().search(&term, page).await?)),
        Request::Recent { page } => Ok(Response::Posts(node.store().recent(page).await?)),
        Request::Popular { page } => Ok(Response::Posts(node.store().popular(page).await?)),
        Request::Announce { entry } => {
            if entry.address == node.address() {
                return Ok(Response::Ack);
            }
            let added = node.dht().insert_entry(&entry).await?;
            debug!(peer = %remote.short(), announced = %entry.address.short(), added, "announce");
            Ok(Response::Ack)
        }
        Request::Collection { address, public_key } => {
            if address == node.address() {
                return Ok(Response::Collection(node.collection()));
            }
            match node.collections().get(&address) {
                Some(collection) => {
                    collection.verify(&public_key)?;
                    Ok(Response::Collection(collection))
                }
                None => Err(Error::NotFound(address)),
            }
        }
        Request::AddPeer { address } => {
            add_peer(node, remote, address).await?;
            Ok(Response::Ack)
        }
        Request::Pieces { .. } => Err(Error::Remote("pieces must be streamed".into())),
    }
}

/// Record `requester` as a seed of `address`'s collection.
async fn add_peer(node: &LocalNode, requester: Address, address: Address) -> Result<()> {
    if address == node.address() {
        if node.add_own_seed(requester) {
            debug!(seed = %requester.short(), "new seed for local collection");
        }
        return Ok(());
    }
    if address == requester {
        return Ok(());
    }
    let Some(record) = node.dht().query(&address).await else {
        return Err(Error::NotFound(address));
    };
    let mut entry = record.entry()?;
    if entry.add_seed(requester) {
        node.dht().insert_entry(&entry).await?;
        debug!(seed = %requester.short(), owner = %address.short(), "recorded seed");
    }
    Ok(())
}

/// Write `count` pieces starting at `since`, then `EndOfPieces`.
async fn serve_pieces(node: &LocalNode, stream: &mut Stream, address: Address, since: u64, count: u64) -> Result<()> {
    let store: Arc<dyn ContentStore> = if address == node.address() {
        node.store().clone()
    } else if let Some(store) = node.mirrored(&address) {
        store
    } else {
        let message = format!("no collection for {}", address);
        return write_frame(&mut stream.send, &Response::Error { message }).await;
    };

    let mut sent = 0u64;
    for index in since..since.saturating_add(count) {
        match store.query_piece(index, false).await? {
            Some(piece) => {
                write_frame(&mut stream.send, &Response::Piece(piece)).await?;
                sent += 1;
            }
            None => break,
        }
    }
    trace!(owner = %address.short(), since, sent, "pieces served");
    write_frame(&mut stream.send, &Response::EndOfPieces).await
}
