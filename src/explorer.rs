//! # Explorer
//!
//! Background discovery. Candidates flow through a bounded queue:
//!
//! ```text
//! seed(): closest(local) + closest(random) ──try_send──► queue ──► worker
//!                                                         ▲          │
//!                          newly learned records ─────────┘   connect, reinsert,
//!                                                              find_closest(random)
//! ```
//!
//! When the queue drains the worker waits `explore_interval` and seeds
//! again. The loop ends when the node's cancellation token fires.

use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, trace};

use crate::dht::KeyValue;
use crate::error::Result;
use crate::identity::Address;
use crate::node::LocalNode;

/// Capacity of the candidate queue.
pub const EXPLORE_BUFFER_SIZE: usize = 100;

/// Recently failed addresses skipped until the next seeding round.
const FAILED_CACHE_SIZE: usize = 256;

pub struct Explorer {
    node: LocalNode,
    tx: mpsc::Sender<KeyValue>,
    rx: mpsc::Receiver<KeyValue>,
    failed: LruCache<Address, ()>,
}

impl Explorer {
    pub fn new(node: LocalNode) -> Self {
        let (tx, rx) = mpsc::channel(EXPLORE_BUFFER_SIZE);
        let capacity = NonZeroUsize::new(FAILED_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            node,
            tx,
            rx,
            failed: LruCache::new(capacity),
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let cancel = self.node.cancel_token().clone();
        let interval = self.node.config().explore_interval;
        info!(interval = ?interval, "explorer started");

        loop {
            let queued = self.seed().await;
            trace!(queued, "explorer seeded");
            while let Ok(record) = self.rx.try_recv() {
                if cancel.is_cancelled() {
                    debug!("explorer stopped");
                    return;
                }
                self.visit(record).await;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("explorer stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            self.failed.clear();
        }
    }

    /// Queue the records closest to the local address and to a random one.
    async fn seed(&mut self) -> usize {
        let dht = self.node.dht();
        let mut records = dht.find_closest(&self.node.address()).await;
        records.extend(dht.find_closest(&Address::random()).await);

        let mut queued = 0;
        let mut seen = std::collections::HashSet::new();
        for record in records {
            if record.key == self.node.address() || !seen.insert(record.key) {
                continue;
            }
            if self.offer(record) {
                queued += 1;
            }
        }
        queued
    }

    /// Non-blocking enqueue; full queues drop the record.
    fn offer(&self, record: KeyValue) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(record)) => {
                debug!(candidate = %record.key.short(), "explore queue full, dropping candidate");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    async fn visit(&mut self, record: KeyValue) {
        let address = record.key;
        if address == self.node.address() || self.failed.contains(&address) {
            return;
        }
        if self.node.peers().is_connected(&address) {
            return;
        }
        match self.explore(record).await {
            Ok(learned) => {
                if learned > 0 {
                    debug!(peer = %address.short(), learned, "explored peer");
                }
            }
            Err(e) => {
                trace!(peer = %address.short(), error = %e, "explore failed");
                self.failed.put(address, ());
            }
        }
    }

    /// Connect to the candidate, refresh its DHT record and queue the
    /// records it knows that the local DHT did not.
    async fn explore(&mut self, record: KeyValue) -> Result<usize> {
        let entry = record.entry()?;
        let peer = self.node.connect_entry(&entry).await?;
        self.node.dht().insert(record).await;

        let mut learned = 0;
        for candidate in peer.find_closest(Address::random()).await? {
            if candidate.key == self.node.address() || candidate.entry().is_err() {
                continue;
            }
            if self.node.dht().insert(candidate.clone()).await {
                learned += 1;
                self.offer(candidate);
            }
        }
        Ok(learned)
    }
}
