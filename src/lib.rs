//! # Seedmesh - Peer-to-Peer Collection Mirroring
//!
//! Seedmesh nodes publish signed entries into a Kademlia-style overlay, find
//! each other by walking the overlay hop by hop, and mirror each other's post
//! collections with per-piece integrity checks.
//!
//! - **Identity**: Ed25519 keypairs; an address is the BLAKE3 hash of the public key
//! - **Entries**: self-signed records advertising endpoint, collection hash and seeds
//! - **Resolution**: bounded depth-first walk over live sessions
//! - **Mirroring**: pieces verified against the owner's signed manifest
//! - **Gossip**: seed list propagation and background exploration
//!
//! ## Architecture
//!
//! [`LocalNode`] is the composition root. The DHT table runs as an actor
//! behind a cheap [`Dht`] handle; sessions, peer handles and the explorer
//! share state through concurrent maps and channels, and every background
//! task stops on the node's cancellation token.
//!
//! ## Security Model
//!
//! - QUIC sessions use mutual TLS with Ed25519 certificates, and the key
//!   proven in TLS must match the key in the handshake entry
//! - Every entry is verified before it is trusted or stored
//! - Mirrored pieces are checked against a manifest signed by the owner
//! - Inbound requests are rate limited per peer
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | [`LocalNode`], the public API |
//! | `identity` | Keypairs and addresses |
//! | `entry` | Signed node entries |
//! | `crypto` | Domain-separated signatures, TLS certificates |
//! | `dht` | Routing table actor and `KeyValue` records |
//! | `peer` | Peer handles, rate limiting, registry |
//! | `resolver` | Address resolution walk |
//! | `mirror` | Collection mirroring |
//! | `seed` | Seed list propagation |
//! | `explorer` | Background discovery |
//! | `store` | Posts, pieces, manifests, content stores |
//! | `protocols` | Session, transport and handler traits |
//! | `transport` | QUIC transport |
//! | `memory` | In-process transport |
//! | `rpc` | Inbound request dispatch |
//! | `messages` | Wire types and framing |

mod config;
mod crypto;
mod dht;
mod entry;
mod error;
mod explorer;
mod identity;
mod memory;
mod messages;
mod mirror;
mod node;
mod peer;
mod protocols;
mod resolver;
mod rpc;
mod seed;
mod store;
mod transport;

pub use config::{
    NodeConfig, CONNECTION_TIMEOUT, DEFAULT_CLOSEST_COUNT, DEFAULT_EXPLORE_INTERVAL,
    DEFAULT_MAX_RESOLVE_HOPS, DEFAULT_SEED_SEARCH_INTERVAL, RPC_TIMEOUT,
};
pub use dht::{Dht, KeyValue};
pub use entry::Entry;
pub use error::{Error, Result};
pub use explorer::EXPLORE_BUFFER_SIZE;
pub use identity::{Address, Keypair};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use messages::{Request, Response};
pub use mirror::{mirror, verify_manifest, CollectionCache, MirrorEvent, MirrorReport, PIECE_BUFFER};
pub use node::LocalNode;
pub use peer::{PeerHandle, PeerLimiter, PeerRegistry};
pub use protocols::{InboundHandler, Session, Stream, Transport};
pub use resolver::Resolver;
pub use seed::{merge_seeds, SeedManager, SeedState};
pub use store::{
    piece_count, Collection, ContentStore, MemoryStore, Piece, Post, HASH_LEN, MAX_POST_TEXT, PIECE_SIZE,
};
pub use transport::QuicTransport;
