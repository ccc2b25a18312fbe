//! # Content Store
//!
//! Posts are grouped into fixed-size [`Piece`]s; piece `i` holds the posts with
//! ids `i * PIECE_SIZE .. (i + 1) * PIECE_SIZE`. A [`Collection`] manifest lists
//! one 32-byte digest per piece and is signed by the collection's owner.
//!
//! [`ContentStore`] is the seam the mirror engine and the inbound handlers
//! consume. [`MemoryStore`] is the in-process implementation.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::crypto::{sign_with_domain, verify_with_domain, MANIFEST_SIGNATURE_DOMAIN};
use crate::error::{Error, Result};
use crate::identity::Keypair;
use crate::messages::encode;

/// Posts per piece.
pub const PIECE_SIZE: u64 = 1000;

/// Results per search/recent/popular page.
pub const PAGE_SIZE: usize = 25;

/// Length of one digest in a manifest hash list.
pub const HASH_LEN: usize = 32;

/// Combined byte length allowed for a post's text fields. With the fixed
/// fields and encoding overhead a full piece stays below the frame limit.
pub const MAX_POST_TEXT: usize = 3 * 1024;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Position within the owning collection.
    pub id: u64,
    pub title: String,
    pub info_hash: String,
    pub size: u64,
    pub file_count: u32,
    pub seeders: u32,
    pub leechers: u32,
    pub upload_date: u64,
    pub tags: String,
    pub meta: String,
}

impl Post {
    /// A post must carry a title and an info hash, and its text must fit
    /// in [`MAX_POST_TEXT`].
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::Codec("post title is empty".into()));
        }
        if self.info_hash.trim().is_empty() {
            return Err(Error::Codec("post info hash is empty".into()));
        }
        let text = self.title.len() + self.info_hash.len() + self.tags.len() + self.meta.len();
        if text > MAX_POST_TEXT {
            return Err(Error::Codec(format!(
                "post text is {} bytes, limit is {}",
                text, MAX_POST_TEXT
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    pub posts: Vec<Post>,
}

impl Piece {
    /// BLAKE3 over the canonical encoding of the posts.
    pub fn hash(&self) -> [u8; 32] {
        let bytes = encode(&self.posts).unwrap_or_default();
        *blake3::hash(&bytes).as_bytes()
    }
}

/// Signed manifest over a collection's pieces.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    /// Concatenated piece digests, `HASH_LEN` bytes each.
    pub hash_list: Vec<u8>,
    /// Number of pieces.
    pub size: u64,
    pub signature: Vec<u8>,
}

impl Collection {
    pub fn from_pieces<'a>(pieces: impl IntoIterator<Item = &'a Piece>) -> Self {
        let mut hash_list = Vec::new();
        let mut size = 0;
        for piece in pieces {
            hash_list.extend_from_slice(&piece.hash());
            size += 1;
        }
        Self {
            hash_list,
            size,
            signature: Vec::new(),
        }
    }

    /// Digest expected for piece `index`.
    pub fn hash_at(&self, index: u64) -> Option<&[u8]> {
        let start = usize::try_from(index).ok()?.checked_mul(HASH_LEN)?;
        self.hash_list.get(start..start.checked_add(HASH_LEN)?)
    }

    /// Value stored in the owning entry's `collection_hash`.
    pub fn collection_hash(&self) -> [u8; 32] {
        *blake3::hash(&self.hash_list).as_bytes()
    }

    pub fn sign(&mut self, keypair: &Keypair) {
        self.signature = sign_with_domain(keypair, MANIFEST_SIGNATURE_DOMAIN, &self.hash_list);
    }

    /// Check the owner's signature and that `size` agrees with the hash list.
    pub fn verify(&self, public_key: &[u8; 32]) -> Result<()> {
        let expected = self.size.checked_mul(HASH_LEN as u64);
        if expected != Some(self.hash_list.len() as u64) {
            return Err(Error::InvalidSignature(format!(
                "manifest lists {} bytes for {} pieces",
                self.hash_list.len(),
                self.size
            )));
        }
        verify_with_domain(public_key, MANIFEST_SIGNATURE_DOMAIN, &self.hash_list, &self.signature)?;
        Ok(())
    }
}

/// Number of pieces needed for `post_count` posts.
pub fn piece_count(post_count: u64) -> u64 {
    post_count.div_ceil(PIECE_SIZE)
}

#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    /// Store a new post and return its id.
    async fn insert_post(&self, post: Post) -> Result<u64>;

    /// Piece `index`, rebuilt from posts when `force_refresh` is set.
    async fn query_piece(&self, index: u64, force_refresh: bool) -> Result<Option<Piece>>;

    async fn post_count(&self) -> Result<u64>;

    /// Drain `rx` into the store. Existing posts are replaced only when
    /// `overwrite` is set. Returns the number of posts written.
    async fn insert_pieces(&self, rx: mpsc::Receiver<Piece>, overwrite: bool) -> Result<u64>;

    async fn search(&self, term: &str, page: usize) -> Result<Vec<Post>>;

    /// Newest first by upload date.
    async fn recent(&self, page: usize) -> Result<Vec<Post>>;

    /// Most seeded first.
    async fn popular(&self, page: usize) -> Result<Vec<Post>>;

    /// Unsigned manifest over every piece currently stored.
    async fn collection(&self) -> Result<Collection> {
        let count = piece_count(self.post_count().await?);
        let mut pieces = Vec::with_capacity(count as usize);
        for index in 0..count {
            let piece = self.query_piece(index, index + 1 == count).await?;
            pieces.push(piece.unwrap_or_default());
        }
        Ok(Collection::from_pieces(&pieces))
    }
}

#[derive(Default)]
struct MemoryInner {
    posts: BTreeMap<u64, Post>,
    pieces: HashMap<u64, Piece>,
}

impl MemoryInner {
    fn build_piece(&self, index: u64) -> Option<Piece> {
        let start = index.checked_mul(PIECE_SIZE)?;
        let posts: Vec<Post> = self
            .posts
            .range(start..start.saturating_add(PIECE_SIZE))
            .map(|(_, p)| p.clone())
            .collect();
        if posts.is_empty() {
            None
        } else {
            Some(Piece { posts })
        }
    }

    fn page<F>(&self, page: usize, mut keep: F, order: fn(&Post, &Post) -> std::cmp::Ordering) -> Vec<Post>
    where
        F: FnMut(&Post) -> bool,
    {
        let mut hits: Vec<Post> = self.posts.values().filter(|p| keep(p)).cloned().collect();
        hits.sort_by(order);
        hits.into_iter().skip(page.saturating_mul(PAGE_SIZE)).take(PAGE_SIZE).collect()
    }
}

/// In-memory [`ContentStore`] keyed by post id.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn posts(&self) -> Vec<Post> {
        self.inner.read().await.posts.values().cloned().collect()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn insert_post(&self, mut post: Post) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let id = inner.posts.last_key_value().map(|(k, _)| k + 1).unwrap_or(0);
        post.id = id;
        inner.posts.insert(id, post);
        inner.pieces.remove(&(id / PIECE_SIZE));
        Ok(id)
    }

    async fn query_piece(&self, index: u64, force_refresh: bool) -> Result<Option<Piece>> {
        if !force_refresh
            && let Some(piece) = self.inner.read().await.pieces.get(&index)
        {
            return Ok(Some(piece.clone()));
        }

        let mut inner = self.inner.write().await;
        let piece = inner.build_piece(index);
        match &piece {
            Some(p) => {
                inner.pieces.insert(index, p.clone());
            }
            None => {
                inner.pieces.remove(&index);
            }
        }
        Ok(piece)
    }

    async fn post_count(&self) -> Result<u64> {
        Ok(self.inner.read().await.posts.len() as u64)
    }

    async fn insert_pieces(&self, mut rx: mpsc::Receiver<Piece>, overwrite: bool) -> Result<u64> {
        let mut written = 0u64;
        while let Some(piece) = rx.recv().await {
            let mut inner = self.inner.write().await;
            for post in piece.posts {
                let index = post.id / PIECE_SIZE;
                if !overwrite && inner.posts.contains_key(&post.id) {
                    continue;
                }
                inner.posts.insert(post.id, post);
                inner.pieces.remove(&index);
                written += 1;
            }
        }
        debug!(written, "piece stream drained");
        Ok(written)
    }

    async fn search(&self, term: &str, page: usize) -> Result<Vec<Post>> {
        let needle = term.to_lowercase();
        let inner = self.inner.read().await;
        Ok(inner.page(
            page,
            |p| p.title.to_lowercase().contains(&needle) || p.tags.to_lowercase().contains(&needle),
            |a, b| a.id.cmp(&b.id),
        ))
    }

    async fn recent(&self, page: usize) -> Result<Vec<Post>> {
        let inner = self.inner.read().await;
        Ok(inner.page(page, |_| true, |a, b| b.upload_date.cmp(&a.upload_date).then(a.id.cmp(&b.id))))
    }

    async fn popular(&self, page: usize) -> Result<Vec<Post>> {
        let inner = self.inner.read().await;
        Ok(inner.page(page, |_| true, |a, b| b.seeders.cmp(&a.seeders).then(a.id.cmp(&b.id))))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn post(title: &str) -> Post {
        Post {
            title: title.into(),
            info_hash: hex::encode(blake3::hash(title.as_bytes()).as_bytes()),
            size: 1024,
            file_count: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn insert_post_assigns_sequential_ids() {
        let store = MemoryStore::new();
        assert_eq!(store.insert_post(post("a")).await.unwrap(), 0);
        assert_eq!(store.insert_post(post("b")).await.unwrap(), 1);
        assert_eq!(store.post_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn pieces_split_on_piece_size() {
        let store = MemoryStore::new();
        for i in 0..(PIECE_SIZE + 5) {
            store.insert_post(post(&format!("p{i}"))).await.unwrap();
        }
        let first = store.query_piece(0, false).await.unwrap().unwrap();
        let second = store.query_piece(1, false).await.unwrap().unwrap();
        assert_eq!(first.posts.len() as u64, PIECE_SIZE);
        assert_eq!(second.posts.len(), 5);
        assert!(store.query_piece(2, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cached_piece_is_invalidated_by_insert() {
        let store = MemoryStore::new();
        store.insert_post(post("a")).await.unwrap();
        let before = store.query_piece(0, false).await.unwrap().unwrap();
        store.insert_post(post("b")).await.unwrap();
        let after = store.query_piece(0, false).await.unwrap().unwrap();
        assert_ne!(before.hash(), after.hash());
        assert_eq!(after.posts.len(), 2);
    }

    #[tokio::test]
    async fn insert_pieces_respects_overwrite() {
        let store = MemoryStore::new();
        store.insert_post(post("original")).await.unwrap();

        let mut replacement = post("replacement");
        replacement.id = 0;

        let (tx, rx) = mpsc::channel(4);
        tx.send(Piece { posts: vec![replacement.clone()] }).await.unwrap();
        drop(tx);
        assert_eq!(store.insert_pieces(rx, false).await.unwrap(), 0);

        let (tx, rx) = mpsc::channel(4);
        tx.send(Piece { posts: vec![replacement] }).await.unwrap();
        drop(tx);
        assert_eq!(store.insert_pieces(rx, true).await.unwrap(), 1);
        assert_eq!(store.posts().await[0].title, "replacement");
    }

    #[tokio::test]
    async fn search_recent_popular() {
        let store = MemoryStore::new();
        let mut a = post("Debian ISO");
        a.upload_date = 10;
        a.seeders = 1;
        let mut b = post("Arch ISO");
        b.upload_date = 20;
        b.seeders = 9;
        let mut c = post("Music");
        c.upload_date = 5;
        c.tags = "audio iso-free".into();
        store.insert_post(a).await.unwrap();
        store.insert_post(b).await.unwrap();
        store.insert_post(c).await.unwrap();

        let hits = store.search("iso", 0).await.unwrap();
        assert_eq!(hits.len(), 3);
        assert!(store.search("iso", 1).await.unwrap().is_empty());

        assert_eq!(store.recent(0).await.unwrap()[0].title, "Arch ISO");
        assert_eq!(store.popular(0).await.unwrap()[0].title, "Arch ISO");
    }

    #[tokio::test]
    async fn collection_manifest_signs_and_verifies() {
        let store = MemoryStore::new();
        for i in 0..(2 * PIECE_SIZE + 1) {
            store.insert_post(post(&format!("p{i}"))).await.unwrap();
        }
        let kp = Keypair::generate();
        let mut collection = store.collection().await.unwrap();
        assert_eq!(collection.size, 3);
        assert_eq!(collection.hash_list.len(), 3 * HASH_LEN);
        collection.sign(&kp);
        assert!(collection.verify(&kp.public_key_bytes()).is_ok());

        let piece = store.query_piece(1, false).await.unwrap().unwrap();
        assert_eq!(collection.hash_at(1).unwrap(), &piece.hash());
        assert!(collection.hash_at(3).is_none());

        collection.hash_list[0] ^= 0xFF;
        assert!(collection.verify(&kp.public_key_bytes()).is_err());
    }

    #[test]
    fn validate_requires_title_and_hash() {
        assert!(post("ok").validate().is_ok());
        assert!(Post::default().validate().is_err());
        let mut missing_hash = post("x");
        missing_hash.info_hash.clear();
        assert!(missing_hash.validate().is_err());
    }

    #[test]
    fn validate_bounds_post_text() {
        let mut big = post("big");
        big.meta = "m".repeat(MAX_POST_TEXT);
        assert!(big.validate().is_err());

        let mut limit = post("limit");
        let used = limit.title.len() + limit.info_hash.len();
        limit.meta = "m".repeat(MAX_POST_TEXT - used);
        assert!(limit.validate().is_ok());
    }

    #[test]
    fn full_piece_of_largest_posts_fits_in_a_frame() {
        let mut largest = post("largest");
        let used = largest.title.len() + largest.info_hash.len();
        largest.meta = "m".repeat(MAX_POST_TEXT - used);
        largest.id = u64::MAX;
        assert!(largest.validate().is_ok());

        let piece = Piece {
            posts: vec![largest; PIECE_SIZE as usize],
        };
        let frame = encode(&crate::messages::Response::Piece(piece)).unwrap();
        assert!(frame.len() < crate::messages::MAX_FRAME_SIZE);
    }

    #[test]
    fn oversized_manifest_size_is_rejected() {
        let manifest = Collection {
            hash_list: vec![0; HASH_LEN],
            size: u64::MAX,
            signature: Vec::new(),
        };
        assert!(matches!(manifest.verify(&[0; 32]), Err(Error::InvalidSignature(_))));
        assert!(manifest.hash_at(u64::MAX).is_none());
    }

    #[tokio::test]
    async fn huge_page_number_yields_nothing() {
        let store = MemoryStore::new();
        store.insert_post(post("x")).await.unwrap();
        assert!(store.search("x", usize::MAX).await.unwrap().is_empty());
        assert!(store.recent(usize::MAX).await.unwrap().is_empty());
        assert!(store.popular(usize::MAX).await.unwrap().is_empty());
    }

    #[test]
    fn piece_count_rounds_up() {
        assert_eq!(piece_count(0), 0);
        assert_eq!(piece_count(1), 1);
        assert_eq!(piece_count(PIECE_SIZE), 1);
        assert_eq!(piece_count(PIECE_SIZE + 1), 2);
    }
}
