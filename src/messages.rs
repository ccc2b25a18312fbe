//! # Wire Protocol Messages
//!
//! Every stream carries length-prefixed bincode frames: a `u32` big-endian
//! length followed by the encoded message.
//!
//! ## Exchanges
//!
//! | Request | Response |
//! |---------|----------|
//! | first stream of a session | `Handshake` both ways |
//! | `Ping` | `Pong` |
//! | `Query` | `Value` |
//! | `FindClosest` | `Closest` |
//! | `Search` / `Recent` / `Popular` | `Posts` |
//! | `Announce` / `AddPeer` | `Ack` |
//! | `Collection` | `Collection` |
//! | `Pieces` | `Piece`* then `EndOfPieces` |
//!
//! Any request may instead be answered with `Error` or `RateLimited`.
//!
//! ## Limits
//!
//! - `MAX_FRAME_SIZE`: largest accepted frame (4 MiB). A full piece of
//!   posts within `MAX_POST_TEXT` fits
//! - All decoding goes through [`decode`] with that limit enforced

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::dht::KeyValue;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::identity::Address;
use crate::store::{Collection, Piece, Post};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

/// Canonical encoding, used for wire frames and for hashing/signing.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize with size bounds enforced.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Handshake {
    pub entry: Entry,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    Ping,
    Query {
        address: Address,
    },
    FindClosest {
        address: Address,
    },
    Search {
        term: String,
        page: usize,
    },
    Recent {
        page: usize,
    },
    Popular {
        page: usize,
    },
    Announce {
        entry: Entry,
    },
    /// Manifest of the collection owned by `address`.
    Collection {
        address: Address,
        public_key: [u8; 32],
    },
    /// Stream `count` pieces of `address`'s collection starting at `since`.
    Pieces {
        address: Address,
        since: u64,
        count: u64,
    },
    /// Record the requester as a seed of `address`'s collection.
    AddPeer {
        address: Address,
    },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::Query { .. } => "query",
            Request::FindClosest { .. } => "find_closest",
            Request::Search { .. } => "search",
            Request::Recent { .. } => "recent",
            Request::Popular { .. } => "popular",
            Request::Announce { .. } => "announce",
            Request::Collection { .. } => "collection",
            Request::Pieces { .. } => "pieces",
            Request::AddPeer { .. } => "add_peer",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Pong,
    Ack,
    Value(Option<KeyValue>),
    Closest(Vec<KeyValue>),
    Posts(Vec<Post>),
    Collection(Collection),
    Piece(Piece),
    EndOfPieces,
    RateLimited,
    Error { message: String },
}

impl Response {
    /// Turn the error variants into `Err`, pass everything else through.
    pub fn into_result(self) -> Result<Response> {
        match self {
            Response::RateLimited => Err(Error::RateLimited),
            Response::Error { message } => Err(Error::Remote(message)),
            other => Ok(other),
        }
    }
}

pub async fn write_frame<W, T>(send: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let bytes = encode(message)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(Error::Codec(format!(
            "frame too large: {} bytes (max {})",
            bytes.len(),
            MAX_FRAME_SIZE
        )));
    }
    let len = bytes.len() as u32;
    send.write_all(&len.to_be_bytes()).await?;
    send.write_all(&bytes).await?;
    send.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(recv: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Codec(format!(
            "frame too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }
    let mut bytes = vec![0u8; len];
    recv.read_exact(&mut bytes).await?;
    Ok(decode(&bytes)?)
}
