//! # Seed Propagation
//!
//! A [`SeedManager`] keeps the seed list of one tracked address current. On
//! every tick it re-resolves the tracked entry, asks each known seed for its
//! copy of that entry, and unions the seed lists it finds. A grown list is
//! written back to the DHT (or to the local entry when the local address is
//! tracked).
//!
//! ## States
//!
//! | State | Meaning |
//! |-------|---------|
//! | `Created` | entry fetched, task not started |
//! | `Running` | periodic task active, first tick immediate |
//! | `Stopped` | cancelled; a running tick finishes first |

use std::sync::{Arc, Mutex, RwLock};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::identity::Address;
use crate::node::LocalNode;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeedState {
    Created,
    Running,
    Stopped,
}

/// Ordered union: `local` keeps its order, unseen `remote` seeds follow.
pub fn merge_seeds(local: &[Address], remote: &[Address]) -> Vec<Address> {
    let mut merged = local.to_vec();
    for seed in remote {
        if !merged.contains(seed) {
            merged.push(*seed);
        }
    }
    merged
}

struct SeedInner {
    track: Address,
    node: LocalNode,
    entry: RwLock<Entry>,
    state: Mutex<SeedState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SeedManager {
    inner: Arc<SeedInner>,
}

impl SeedManager {
    /// Resolve `track` and prepare a manager for it. Fails if the address
    /// cannot be resolved.
    pub async fn new(track: Address, node: LocalNode) -> Result<Self> {
        let entry = node.resolve(track).await?;
        let cancel = node.cancel_token().child_token();
        Ok(Self {
            inner: Arc::new(SeedInner {
                track,
                node,
                entry: RwLock::new(entry),
                state: Mutex::new(SeedState::Created),
                cancel,
                task: Mutex::new(None),
            }),
        })
    }

    pub fn track(&self) -> Address {
        self.inner.track
    }

    /// Last entry the manager holds for the tracked address.
    pub fn entry(&self) -> Entry {
        self.inner
            .entry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn state(&self) -> SeedState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SeedState) {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Spawn the periodic task. Only the first call has an effect.
    pub fn start(&self) {
        if self.state() != SeedState::Created {
            return;
        }
        self.set_state(SeedState::Running);

        let manager = self.clone();
        let period = self.inner.node.config().seed_search_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = manager.inner.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = manager.tick().await {
                            warn!(track = %manager.inner.track.short(), error = %e, "seed search failed");
                        }
                    }
                }
            }
            manager.set_state(SeedState::Stopped);
            debug!(track = %manager.inner.track.short(), "seed manager stopped");
        });
        *self.inner.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        info!(track = %self.inner.track.short(), period = ?period, "seed manager started");
    }

    /// Request the task to stop after the current tick.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
        if self.state() == SeedState::Created {
            self.set_state(SeedState::Stopped);
        }
    }

    /// Wait for the task to exit after [`SeedManager::stop`].
    pub async fn join(&self) {
        let handle = self.inner.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.set_state(SeedState::Stopped);
    }

    /// One seed search round. Returns how many seeds were added.
    pub async fn tick(&self) -> Result<usize> {
        let node = &self.inner.node;
        let track = self.inner.track;

        let mut entry = self.entry();
        match node.resolve(track).await {
            Ok(fresh) if fresh.updated > entry.updated => {
                let seeds = merge_seeds(&fresh.seeds, &entry.seeds);
                entry = fresh;
                entry.seeds = seeds;
            }
            Ok(fresh) => entry.seeds = merge_seeds(&entry.seeds, &fresh.seeds),
            Err(e) => debug!(track = %track.short(), error = %e, "re-resolve failed, using cached entry"),
        }
        let before = entry.seeds.len();

        let seeds: Vec<Address> = entry
            .seeds
            .iter()
            .copied()
            .filter(|s| *s != node.address() && *s != track)
            .collect();
        for seed in seeds {
            let remote = match self.fetch_from_seed(seed).await {
                Ok(remote) => remote,
                Err(e) => {
                    warn!(track = %track.short(), seed = %seed.short(), error = %e, "seed skipped");
                    continue;
                }
            };
            let merged = merge_seeds(&entry.seeds, &remote.seeds);
            if merged.len() > entry.seeds.len() {
                entry.seeds = merged;
                if let Err(e) = node.store_tracked_entry(&entry).await {
                    warn!(track = %track.short(), seed = %seed.short(), error = %e, "storing merged seeds failed");
                }
            }
        }

        let added = entry.seeds.len() - before;
        if added > 0 {
            info!(track = %track.short(), added, total = entry.seeds.len(), "seed list grew");
        }
        *self.inner.entry.write().unwrap_or_else(|e| e.into_inner()) = entry;
        Ok(added)
    }

    /// The tracked entry as known by `seed`.
    async fn fetch_from_seed(&self, seed: Address) -> Result<Entry> {
        let track = self.inner.track;
        let peer = self.inner.node.connect(seed).await?;
        let record = peer.query(track).await?.ok_or(Error::NotFound(track))?;
        let remote = record.entry()?;
        if remote.address != track {
            return Err(Error::IdentityMismatch {
                expected: track,
                actual: remote.address,
            });
        }
        Ok(remote)
    }
}
