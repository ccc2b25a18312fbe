//! # Mirror Engine
//!
//! Copies a remote collection into a local [`ContentStore`], verifying every
//! piece against the owner's signed manifest before it is stored.
//!
//! ## Flow
//!
//! ```text
//! peer.entry() ──► fetch manifest ──► verify against entry
//!                                          │
//!       local post_count == entry.post_count? ── yes ──► Complete
//!                                          │ no
//!   stream pieces since ──► hash check ──► bounded channel ──► insert_pieces
//!                               │
//!                        mismatch: abort
//! ```
//!
//! Resumption restarts at the last (possibly partial) local piece, so a
//! mirror that was interrupted or that lags behind re-fetches at most one
//! piece it already had.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::identity::Address;
use crate::peer::PeerHandle;
use crate::store::{piece_count, Collection, ContentStore, Piece};

/// Verified pieces that may wait for the store before the stream pauses.
pub const PIECE_BUFFER: usize = 100;

/// Progress notifications of one mirror run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MirrorEvent {
    /// Piece at this absolute index was verified and handed to the store.
    Piece(u64),
    Complete,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MirrorReport {
    pub owner: Option<Address>,
    /// Index of the first piece requested.
    pub since: u64,
    /// Pieces verified and handed to the store.
    pub pieces: u64,
    /// Posts the store wrote.
    pub posts: u64,
}

/// Manifests of collections this node has mirrored, keyed by owner.
#[derive(Default)]
pub struct CollectionCache {
    manifests: DashMap<Address, Collection>,
}

impl CollectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, owner: &Address) -> Option<Collection> {
        self.manifests.get(owner).map(|c| c.value().clone())
    }

    pub fn insert(&self, owner: Address, manifest: Collection) {
        self.manifests.insert(owner, manifest);
    }

    pub fn contains(&self, owner: &Address) -> bool {
        self.manifests.contains_key(owner)
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }
}

/// Check a manifest was signed by `entry`'s owner and matches the
/// collection hash the entry advertises.
pub fn verify_manifest(entry: &Entry, manifest: &Collection) -> Result<()> {
    manifest.verify(&entry.public_key)?;
    if manifest.collection_hash() != entry.collection_hash {
        return Err(Error::InvalidSignature(format!(
            "manifest does not match collection hash advertised by {}",
            entry.address
        )));
    }
    Ok(())
}

/// First piece to request when `local_posts` posts are already stored.
pub fn resume_index(local_posts: u64) -> u64 {
    piece_count(local_posts).saturating_sub(1)
}

async fn emit(progress: &Option<mpsc::Sender<MirrorEvent>>, event: MirrorEvent) {
    if let Some(tx) = progress {
        let _ = tx.send(event).await;
    }
}

/// Mirror the collection `peer` serves into `store`.
///
/// When the handle is marked as a seed the seeded owner's collection is
/// fetched, otherwise the peer's own.
pub async fn mirror(
    peer: &PeerHandle,
    store: &dyn ContentStore,
    collections: &CollectionCache,
    progress: Option<mpsc::Sender<MirrorEvent>>,
) -> Result<MirrorReport> {
    let entry = match peer.seed_for() {
        Some(entry) => entry,
        None => peer.entry().await?,
    };
    let owner = entry.address;

    let manifest = peer.fetch_collection_manifest(owner, entry.public_key).await?;
    verify_manifest(&entry, &manifest)?;

    let local = store.post_count().await?;
    let mut report = MirrorReport {
        owner: Some(owner),
        ..Default::default()
    };
    if local == entry.post_count {
        debug!(owner = %owner.short(), posts = local, "mirror up to date");
        collections.insert(owner, manifest);
        emit(&progress, MirrorEvent::Complete).await;
        return Ok(report);
    }

    let since = resume_index(local);
    let count = manifest.size.saturating_sub(since);
    report.since = since;
    info!(
        owner = %owner.short(),
        via = %peer.address().short(),
        since,
        count,
        "mirroring collection"
    );

    let mut incoming = peer.stream_pieces(owner, since, count).await?;
    let (tx, rx) = mpsc::channel::<Piece>(PIECE_BUFFER);

    let producer = async {
        let mut verified = 0u64;
        let mut warned_full = false;
        while let Some(item) = incoming.recv().await {
            let piece = item?;
            let index = since + verified;
            let expected = manifest.hash_at(index).ok_or(Error::HashMismatch { index })?;
            if piece.hash().as_slice() != expected {
                warn!(owner = %owner.short(), index, "piece hash mismatch");
                return Err(Error::HashMismatch { index });
            }

            if tx.capacity() == 0 && !warned_full {
                warned_full = true;
                debug!(owner = %owner.short(), "piece buffer full, waiting for store");
            }
            tx.send(piece)
                .await
                .map_err(|_| Error::Transport("store stopped accepting pieces".into()))?;
            verified += 1;
            emit(&progress, MirrorEvent::Piece(index)).await;
        }
        drop(tx);
        if verified < count {
            return Err(Error::Transport(format!(
                "piece stream ended after {} of {} pieces",
                verified, count
            )));
        }
        Ok::<u64, Error>(verified)
    };

    let (produced, stored) = tokio::join!(producer, store.insert_pieces(rx, true));
    report.pieces = produced?;
    report.posts = stored?;

    if let Err(e) = peer.request_add_peer(owner).await {
        warn!(owner = %owner.short(), error = %e, "failed to register as seed");
    }
    collections.insert(owner, manifest);
    emit(&progress, MirrorEvent::Complete).await;
    info!(owner = %owner.short(), pieces = report.pieces, posts = report.posts, "mirror complete");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::store::{MemoryStore, PIECE_SIZE};
    use crate::store::tests::post;

    #[test]
    fn resume_index_restarts_at_last_piece() {
        assert_eq!(resume_index(0), 0);
        assert_eq!(resume_index(1), 0);
        assert_eq!(resume_index(PIECE_SIZE), 0);
        assert_eq!(resume_index(PIECE_SIZE + 1), 1);
        assert_eq!(resume_index(3 * PIECE_SIZE), 2);
    }

    #[tokio::test]
    async fn manifest_must_match_entry() {
        let kp = Keypair::generate();
        let store = MemoryStore::new();
        store.insert_post(post("a")).await.unwrap();
        let mut manifest = store.collection().await.unwrap();
        manifest.sign(&kp);

        let mut entry = Entry::new(&kp, "127.0.0.1", 1);
        entry.collection_hash = manifest.collection_hash();
        entry.sign(&kp);
        assert!(verify_manifest(&entry, &manifest).is_ok());

        let other = Keypair::generate();
        let mut forged = manifest.clone();
        forged.sign(&other);
        assert!(matches!(verify_manifest(&entry, &forged), Err(Error::InvalidSignature(_))));

        let mut stale = entry.clone();
        stale.collection_hash = [7; 32];
        stale.sign(&kp);
        assert!(matches!(verify_manifest(&stale, &manifest), Err(Error::InvalidSignature(_))));
    }

    #[test]
    fn collection_cache_basics() {
        let cache = CollectionCache::new();
        let owner = Address::random();
        assert!(cache.is_empty());
        cache.insert(owner, Collection::default());
        assert!(cache.contains(&owner));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&owner), Some(Collection::default()));
    }
}
