//! # Address Resolution
//!
//! Finds the signed [`Entry`] for an address by walking the overlay one hop
//! at a time over live sessions.
//!
//! ## Algorithm
//!
//! 1. The local address resolves to the local entry without touching the
//!    network.
//! 2. A verified DHT record for the target is returned as is.
//! 3. Otherwise the DHT's closest records seed a worklist. Each step pops the
//!    closest unvisited candidate, connects to it and asks it for the target.
//!    On a miss the candidate's own closest records are pushed on top of the
//!    worklist, so the walk goes depth first, closest first.
//!
//! The walk stops at the first verified entry for the target, when the
//! worklist runs dry, or when the hop budget is spent. A candidate that
//! cannot be reached ends its own branch only.
//!
//! ## Outcome
//!
//! | Situation | Result |
//! |-----------|--------|
//! | entry found | `Ok(entry)`, also stored in the DHT |
//! | every attempted peer failed | `Err(Unreachable)` |
//! | otherwise | `Err(NotFound)` |

use std::collections::HashSet;

use tracing::{debug, trace, warn};

use crate::dht::KeyValue;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::identity::Address;
use crate::node::LocalNode;

pub struct Resolver<'a> {
    node: &'a LocalNode,
    max_hops: usize,
}

/// Counters for one resolution walk.
#[derive(Default)]
struct Walk {
    visited: HashSet<Address>,
    worklist: Vec<KeyValue>,
    hops: usize,
    attempted: usize,
    failed: usize,
}

impl Walk {
    /// Queue `records` so the first one is popped next.
    fn push_closest(&mut self, records: Vec<KeyValue>) {
        for record in records.into_iter().rev() {
            if !self.visited.contains(&record.key) {
                self.worklist.push(record);
            }
        }
    }
}

impl<'a> Resolver<'a> {
    pub fn new(node: &'a LocalNode, max_hops: usize) -> Self {
        Self { node, max_hops }
    }

    pub async fn resolve(&self, target: Address) -> Result<Entry> {
        if target == self.node.address() {
            return Ok(self.node.entry());
        }

        let dht = self.node.dht();
        if let Some(record) = dht.query(&target).await {
            match record.entry() {
                Ok(entry) => {
                    trace!(target = %target.short(), "resolved from dht");
                    return Ok(entry);
                }
                Err(e) => warn!(target = %target.short(), error = %e, "cached record failed verification"),
            }
        }

        let mut walk = Walk::default();
        walk.visited.insert(self.node.address());
        walk.push_closest(dht.find_closest(&target).await);

        while let Some(record) = walk.worklist.pop() {
            if !walk.visited.insert(record.key) {
                continue;
            }
            if walk.hops >= self.max_hops {
                debug!(target = %target.short(), hops = walk.hops, "hop budget exhausted");
                break;
            }
            walk.hops += 1;

            let candidate = match record.entry() {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(candidate = %record.key.short(), error = %e, "skipping invalid candidate");
                    continue;
                }
            };
            if let Some(found) = self.step(&mut walk, target, &candidate).await {
                if let Err(e) = dht.insert_entry(&found).await {
                    debug!(target = %target.short(), error = %e, "not caching resolved entry");
                }
                debug!(target = %target.short(), hops = walk.hops, "resolved");
                return Ok(found);
            }
        }

        if walk.attempted > 0 && walk.failed == walk.attempted {
            Err(Error::Unreachable(format!(
                "{} candidate(s) for {} could not be reached",
                walk.failed, target
            )))
        } else {
            Err(Error::NotFound(target))
        }
    }

    /// Ask `candidate` for `target`. Returns the entry on a hit; on a miss the
    /// candidate's closest records are queued.
    async fn step(&self, walk: &mut Walk, target: Address, candidate: &Entry) -> Option<Entry> {
        walk.attempted += 1;
        let peer = match self.node.connect_entry(candidate).await {
            Ok(peer) => peer,
            Err(e) => {
                debug!(candidate = %candidate.address.short(), error = %e, "candidate unreachable");
                walk.failed += 1;
                return None;
            }
        };

        match peer.query(target).await {
            Ok(Some(record)) => match record.entry() {
                Ok(entry) if entry.address == target => return Some(entry),
                Ok(_) => debug!(candidate = %candidate.address.short(), "answer is for another address"),
                Err(e) => warn!(candidate = %candidate.address.short(), error = %e, "candidate returned invalid entry"),
            },
            Ok(None) => {}
            Err(e) => {
                debug!(candidate = %candidate.address.short(), error = %e, "query failed");
                walk.failed += 1;
                return None;
            }
        }

        match peer.find_closest(target).await {
            Ok(records) => {
                trace!(candidate = %candidate.address.short(), returned = records.len(), "closer candidates");
                walk.push_closest(records);
            }
            Err(e) => debug!(candidate = %candidate.address.short(), error = %e, "find_closest failed"),
        }
        None
    }
}
