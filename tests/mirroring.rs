//! Collection mirroring between in-process nodes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use seedmesh::{
    Collection, ContentStore, Error, Keypair, LocalNode, MemoryNetwork, MemoryStore, MirrorEvent,
    NodeConfig, Piece, Post, Result, HASH_LEN, PIECE_SIZE,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

fn post(i: u64) -> Post {
    Post {
        title: format!("post {i}"),
        info_hash: hex::encode(blake3::hash(&i.to_be_bytes()).as_bytes()),
        size: 1024 + i,
        file_count: 1,
        upload_date: i,
        ..Default::default()
    }
}

async fn filled_store(posts: u64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for i in 0..posts {
        store.insert_post(post(i)).await.unwrap();
    }
    store
}

async fn node(network: &Arc<MemoryNetwork>, endpoint: &str) -> LocalNode {
    LocalNode::with_transport(NodeConfig::default(), Keypair::generate(), network.transport(endpoint))
        .await
        .expect("node start failed")
}

async fn owner(network: &Arc<MemoryNetwork>, endpoint: &str, store: Arc<dyn ContentStore>) -> LocalNode {
    LocalNode::with_store(NodeConfig::default(), Keypair::generate(), network.transport(endpoint), store)
        .await
        .expect("owner start failed")
}

fn drain(rx: &mut mpsc::Receiver<MirrorEvent>) -> Vec<MirrorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn mirror_three_pieces_from_partial_local_piece() {
    let network = MemoryNetwork::new();
    let o = owner(&network, "o:1", filled_store(2 * PIECE_SIZE + 10).await).await;
    let m = node(&network, "m:1").await;
    m.connect_direct("o:1").await.unwrap();

    // half of piece 0 is already stored locally
    let local = m.database(o.address());
    for i in 0..PIECE_SIZE / 2 {
        local.insert_post(post(i)).await.unwrap();
    }

    let (tx, mut rx) = mpsc::channel(16);
    let report = timeout(TEST_TIMEOUT, m.mirror(o.address(), Some(tx)))
        .await
        .expect("mirror timed out")
        .expect("mirror failed");

    assert_eq!(report.since, 0);
    assert_eq!(report.pieces, 3);
    assert_eq!(
        drain(&mut rx),
        vec![
            MirrorEvent::Piece(0),
            MirrorEvent::Piece(1),
            MirrorEvent::Piece(2),
            MirrorEvent::Complete
        ]
    );
    assert_eq!(local.post_count().await.unwrap(), 2 * PIECE_SIZE + 10);

    // digests sit at offsets 0, 32 and 64 of the manifest
    let manifest = m.collections().get(&o.address()).expect("manifest cached");
    for index in 0..3u64 {
        let piece = local.query_piece(index, true).await.unwrap().unwrap();
        let offset = index as usize * HASH_LEN;
        assert_eq!(&manifest.hash_list[offset..offset + HASH_LEN], &piece.hash());
    }
}

#[tokio::test]
async fn mirror_is_idempotent() {
    let network = MemoryNetwork::new();
    let o = owner(&network, "o:1", filled_store(PIECE_SIZE + 1).await).await;
    let m = node(&network, "m:1").await;
    m.connect_direct("o:1").await.unwrap();

    let first = m.mirror(o.address(), None).await.unwrap();
    assert_eq!(first.pieces, 2);

    let (tx, mut rx) = mpsc::channel(16);
    let second = m.mirror(o.address(), Some(tx)).await.unwrap();
    assert_eq!(second.pieces, 0);
    assert_eq!(drain(&mut rx), vec![MirrorEvent::Complete]);
    assert_eq!(m.database(o.address()).post_count().await.unwrap(), PIECE_SIZE + 1);
}

#[tokio::test]
async fn mirror_resumes_after_owner_publishes() {
    let network = MemoryNetwork::new();
    let o = owner(&network, "o:1", filled_store(PIECE_SIZE + 5).await).await;
    let m = node(&network, "m:1").await;
    m.connect_direct("o:1").await.unwrap();
    m.mirror(o.address(), None).await.unwrap();

    o.add_post(post(9999)).await.unwrap();
    let report = m.mirror(o.address(), None).await.unwrap();
    assert_eq!(report.since, 1);
    assert_eq!(report.pieces, 1);
    assert_eq!(m.database(o.address()).post_count().await.unwrap(), PIECE_SIZE + 6);
}

#[tokio::test]
async fn mirror_registers_mirror_as_seed() {
    let network = MemoryNetwork::new();
    let o = owner(&network, "o:1", filled_store(3).await).await;
    let m = node(&network, "m:1").await;
    m.connect_direct("o:1").await.unwrap();

    m.mirror(o.address(), None).await.unwrap();
    assert!(o.entry().seeds.contains(&m.address()));
    assert!(o.entry().verify().is_ok());
}

#[tokio::test]
async fn mirror_of_empty_collection_completes() {
    let network = MemoryNetwork::new();
    let o = node(&network, "o:1").await;
    let m = node(&network, "m:1").await;
    m.connect_direct("o:1").await.unwrap();

    let report = m.mirror(o.address(), None).await.unwrap();
    assert_eq!(report.pieces, 0);
}

/// Serves an honest manifest but tampers with one piece.
struct TamperedPiece {
    inner: MemoryStore,
    index: u64,
}

/// Serves honest pieces under a manifest with one flipped digest byte.
struct TamperedManifest {
    inner: MemoryStore,
}

#[async_trait]
impl ContentStore for TamperedPiece {
    async fn insert_post(&self, post: Post) -> Result<u64> {
        self.inner.insert_post(post).await
    }

    async fn query_piece(&self, index: u64, force_refresh: bool) -> Result<Option<Piece>> {
        let piece = self.inner.query_piece(index, force_refresh).await?;
        Ok(piece.map(|mut p| {
            if index == self.index {
                p.posts[0].title.push_str(" (edited)");
            }
            p
        }))
    }

    async fn post_count(&self) -> Result<u64> {
        self.inner.post_count().await
    }

    async fn insert_pieces(&self, rx: mpsc::Receiver<Piece>, overwrite: bool) -> Result<u64> {
        self.inner.insert_pieces(rx, overwrite).await
    }

    async fn search(&self, term: &str, page: usize) -> Result<Vec<Post>> {
        self.inner.search(term, page).await
    }

    async fn recent(&self, page: usize) -> Result<Vec<Post>> {
        self.inner.recent(page).await
    }

    async fn popular(&self, page: usize) -> Result<Vec<Post>> {
        self.inner.popular(page).await
    }

    async fn collection(&self) -> Result<Collection> {
        self.inner.collection().await
    }
}

#[async_trait]
impl ContentStore for TamperedManifest {
    async fn insert_post(&self, post: Post) -> Result<u64> {
        self.inner.insert_post(post).await
    }

    async fn query_piece(&self, index: u64, force_refresh: bool) -> Result<Option<Piece>> {
        self.inner.query_piece(index, force_refresh).await
    }

    async fn post_count(&self) -> Result<u64> {
        self.inner.post_count().await
    }

    async fn insert_pieces(&self, rx: mpsc::Receiver<Piece>, overwrite: bool) -> Result<u64> {
        self.inner.insert_pieces(rx, overwrite).await
    }

    async fn search(&self, term: &str, page: usize) -> Result<Vec<Post>> {
        self.inner.search(term, page).await
    }

    async fn recent(&self, page: usize) -> Result<Vec<Post>> {
        self.inner.recent(page).await
    }

    async fn popular(&self, page: usize) -> Result<Vec<Post>> {
        self.inner.popular(page).await
    }

    async fn collection(&self) -> Result<Collection> {
        let mut collection = self.inner.collection().await?;
        if let Some(byte) = collection.hash_list.first_mut() {
            *byte ^= 0x01;
        }
        Ok(collection)
    }
}

async fn fill(store: &MemoryStore, posts: u64) {
    for i in 0..posts {
        store.insert_post(post(i)).await.unwrap();
    }
}

#[tokio::test]
async fn corrupted_piece_aborts_with_its_index() {
    let network = MemoryNetwork::new();
    let inner = MemoryStore::new();
    fill(&inner, 3 * PIECE_SIZE).await;
    let o = owner(&network, "o:1", Arc::new(TamperedPiece { inner, index: 1 })).await;
    let m = node(&network, "m:1").await;
    m.connect_direct("o:1").await.unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let result = m.mirror(o.address(), Some(tx)).await;
    assert!(matches!(result, Err(Error::HashMismatch { index: 1 })));

    // piece 0 was verified and stored, nothing after the bad piece was
    assert_eq!(drain(&mut rx), vec![MirrorEvent::Piece(0)]);
    assert_eq!(m.database(o.address()).post_count().await.unwrap(), PIECE_SIZE);
    assert!(!m.collections().contains(&o.address()));
}

#[tokio::test]
async fn corrupted_manifest_entry_rejects_first_piece() {
    let network = MemoryNetwork::new();
    let inner = MemoryStore::new();
    fill(&inner, 2 * PIECE_SIZE).await;
    let o = owner(&network, "o:1", Arc::new(TamperedManifest { inner })).await;
    let m = node(&network, "m:1").await;
    m.connect_direct("o:1").await.unwrap();

    let result = m.mirror(o.address(), None).await;
    assert!(matches!(result, Err(Error::HashMismatch { index: 0 })));
    assert_eq!(m.database(o.address()).post_count().await.unwrap(), 0);
}

#[tokio::test]
async fn mirror_falls_back_to_seed_when_owner_is_offline() {
    let network = MemoryNetwork::new();
    let o = owner(&network, "o:1", filled_store(PIECE_SIZE + 20).await).await;
    let s = node(&network, "s:1").await;
    let m = node(&network, "m:1").await;

    s.connect_direct("o:1").await.unwrap();
    s.mirror(o.address(), None).await.unwrap();
    assert_eq!(o.entry().seeds, vec![s.address()]);

    // m learns the owner entry that lists s, and where s lives
    m.connect_direct("o:1").await.unwrap();
    m.connect_direct("s:1").await.unwrap();
    network.disconnect("o:1");

    let report = timeout(TEST_TIMEOUT, m.mirror(o.address(), None))
        .await
        .expect("mirror timed out")
        .expect("seed mirror failed");
    assert_eq!(report.owner, Some(o.address()));
    assert_eq!(report.pieces, 2);
    assert_eq!(m.database(o.address()).post_count().await.unwrap(), PIECE_SIZE + 20);

    let seeded = m.peers().get(&s.address()).unwrap().seed_for().unwrap();
    assert_eq!(seeded.address, o.address());
}

#[tokio::test]
async fn mirror_without_any_source_fails() {
    let network = MemoryNetwork::new();
    let o = owner(&network, "o:1", filled_store(5).await).await;
    let m = node(&network, "m:1").await;
    m.connect_direct("o:1").await.unwrap();
    network.disconnect("o:1");

    let result = m.mirror(o.address(), None).await;
    assert!(result.as_ref().is_err_and(|e| e.is_unreachable()), "{result:?}");
}

#[tokio::test]
async fn search_is_rate_limited_per_peer() {
    let network = MemoryNetwork::new();
    let _o = owner(&network, "o:1", filled_store(5).await).await;
    let m = node(&network, "m:1").await;
    let peer = m.connect_direct("o:1").await.unwrap();

    let mut limited = false;
    for _ in 0..200 {
        match peer.search("post", 0).await {
            Ok(posts) => assert_eq!(posts.len(), 5),
            Err(Error::RateLimited) => {
                limited = true;
                break;
            }
            Err(e) => panic!("unexpected error {e}"),
        }
    }
    assert!(limited);

    // pings are never limited
    assert!(peer.ping().await.is_ok());
}
