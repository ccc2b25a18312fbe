//! # Local DHT Table
//!
//! Records are [`KeyValue`] pairs: an [`Address`] key and the JSON-encoded
//! [`Entry`] it belongs to. Records live in 256 k-buckets indexed by the
//! length of the common prefix with the local address.
//!
//! ## Architecture
//!
//! [`Dht`] is a cheap-to-clone handle. All state lives in a single actor task
//! reached over an mpsc channel, so the table is shared between the resolver,
//! the explorer, seed managers and inbound handlers without external locks.
//!
//! ## Bucket Policy
//!
//! A full bucket evicts its least-recently-seen record to admit a new one.
//! No liveness probing happens here; the explorer keeps live records fresh
//! by re-inserting them.

use std::collections::BinaryHeap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::identity::{distance_cmp, Address, ADDRESS_BITS};

/// Records per bucket.
pub const DEFAULT_K: usize = 20;

/// Largest payload accepted for one record.
pub const MAX_VALUE_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Address,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn from_entry(entry: &Entry) -> Result<Self> {
        Ok(Self {
            key: entry.address,
            value: entry.to_json()?,
        })
    }

    /// Decode the payload and check it is a valid entry for `key`.
    pub fn entry(&self) -> Result<Entry> {
        let entry = Entry::from_json(&self.value)?;
        if entry.address != self.key {
            return Err(Error::IdentityMismatch {
                expected: self.key,
                actual: entry.address,
            });
        }
        entry.verify()?;
        Ok(entry)
    }
}

#[derive(Debug, Clone, Default)]
struct RoutingBucket {
    /// Least recently seen first.
    records: Vec<KeyValue>,
}

impl RoutingBucket {
    /// Insert or refresh. Returns true when the key was not present.
    fn touch(&mut self, record: KeyValue, k: usize) -> bool {
        if let Some(pos) = self.records.iter().position(|r| r.key == record.key) {
            self.records.remove(pos);
            self.records.push(record);
            return false;
        }
        if self.records.len() >= k && !self.records.is_empty() {
            let evicted = self.records.remove(0);
            debug!(evicted = %evicted.key.short(), "bucket full, evicting least recently seen");
        }
        self.records.push(record);
        true
    }

    fn get(&self, key: &Address) -> Option<&KeyValue> {
        self.records.iter().find(|r| &r.key == key)
    }
}

fn bucket_index(self_id: &Address, other: &Address) -> usize {
    let dist = self_id.xor_distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            let leading = byte.leading_zeros() as usize;
            return byte_idx * 8 + leading;
        }
    }
    ADDRESS_BITS - 1
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: Address,
    k: usize,
    buckets: Vec<RoutingBucket>,
}

impl RoutingTable {
    pub fn new(self_id: Address, k: usize) -> Self {
        Self {
            self_id,
            k,
            buckets: vec![RoutingBucket::default(); ADDRESS_BITS],
        }
    }

    /// Returns true when `record.key` was not in the table before.
    pub fn insert(&mut self, record: KeyValue) -> bool {
        if record.key == self.self_id {
            return false;
        }
        let idx = bucket_index(&self.self_id, &record.key);
        self.buckets[idx].touch(record, self.k)
    }

    pub fn get(&self, key: &Address) -> Option<&KeyValue> {
        if *key == self.self_id {
            return None;
        }
        self.buckets[bucket_index(&self.self_id, key)].get(key)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.records.len()).sum()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `k` records ordered by XOR distance to `target`, closest first.
    pub fn closest(&self, target: &Address, k: usize) -> Vec<KeyValue> {
        if k == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct DistRecord {
            dist: [u8; 32],
            record: KeyValue,
        }

        impl Ord for DistRecord {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for DistRecord {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<DistRecord> = BinaryHeap::with_capacity(k + 1);

        for bucket in &self.buckets {
            for record in &bucket.records {
                let dist = record.key.xor_distance(target);

                if heap.len() < k {
                    heap.push(DistRecord { dist, record: record.clone() });
                } else if let Some(max_entry) = heap.peek()
                    && distance_cmp(&dist, &max_entry.dist) == std::cmp::Ordering::Less
                {
                    heap.push(DistRecord { dist, record: record.clone() });
                    heap.pop();
                }
            }
        }

        heap.into_sorted_vec().into_iter().map(|d| d.record).collect()
    }

    fn all(&self) -> Vec<KeyValue> {
        self.buckets.iter().flat_map(|b| b.records.iter().cloned()).collect()
    }
}

enum Command {
    Query(Address, oneshot::Sender<Option<KeyValue>>),
    FindClosest(Address, usize, oneshot::Sender<Vec<KeyValue>>),
    Insert(KeyValue, oneshot::Sender<bool>),
    Has(Address, oneshot::Sender<bool>),
    Len(oneshot::Sender<usize>),
    Snapshot(oneshot::Sender<Vec<KeyValue>>),
    Quit,
}

struct DhtActor {
    routing: RoutingTable,
    cmd_rx: mpsc::Receiver<Command>,
}

impl DhtActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Query(key, reply) => {
                    let _ = reply.send(self.routing.get(&key).cloned());
                }
                Command::FindClosest(target, k, reply) => {
                    let _ = reply.send(self.routing.closest(&target, k));
                }
                Command::Insert(record, reply) => {
                    let _ = reply.send(self.routing.insert(record));
                }
                Command::Has(key, reply) => {
                    let _ = reply.send(self.routing.get(&key).is_some());
                }
                Command::Len(reply) => {
                    let _ = reply.send(self.routing.len());
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.routing.all());
                }
                Command::Quit => break,
            }
        }
        debug!("dht actor stopped");
    }
}

/// Handle to the local DHT table.
#[derive(Clone)]
pub struct Dht {
    cmd_tx: mpsc::Sender<Command>,
    address: Address,
    closest_count: usize,
}

impl Dht {
    pub fn new(address: Address, closest_count: usize) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(100);
        let actor = DhtActor {
            routing: RoutingTable::new(address, DEFAULT_K),
            cmd_rx,
        };
        tokio::spawn(actor.run());
        Self {
            cmd_tx,
            address,
            closest_count,
        }
    }

    /// The local identity this table is centred on.
    pub fn address(&self) -> Address {
        self.address
    }

    pub async fn query(&self, key: &Address) -> Option<KeyValue> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Query(*key, tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Closest records to `target`, closest first, at most `closest_count`.
    pub async fn find_closest(&self, target: &Address) -> Vec<KeyValue> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::FindClosest(*target, self.closest_count, tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Insert or refresh a record. Returns true when the key is new.
    pub async fn insert(&self, record: KeyValue) -> bool {
        if record.value.len() > MAX_VALUE_SIZE {
            warn!(key = %record.key.short(), size = record.value.len(), "dropping oversized record");
            return false;
        }
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Insert(record, tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Verify `entry` and store it. Seeds already known for the address are
    /// kept, and an older entry never replaces a newer one.
    pub async fn insert_entry(&self, entry: &Entry) -> Result<bool> {
        entry.verify()?;
        let mut merged = entry.clone();
        if let Some(existing) = self.query(&entry.address).await.and_then(|r| r.entry().ok()) {
            if existing.updated > entry.updated {
                merged = existing.clone();
            }
            for seed in entry.seeds.iter().chain(existing.seeds.iter()) {
                merged.add_seed(*seed);
            }
        }
        Ok(self.insert(KeyValue::from_entry(&merged)?).await)
    }

    pub async fn has(&self, key: &Address) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Has(*key, tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn len(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Len(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Write every record to `path` as JSON.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Snapshot(tx))
            .await
            .map_err(|_| Error::Transport("dht actor stopped".into()))?;
        let records = rx
            .await
            .map_err(|_| Error::Transport("dht actor stopped".into()))?;
        let json = serde_json::to_vec_pretty(&records)?;
        tokio::fs::write(path, json).await?;
        debug!(path = %path.display(), records = records.len(), "saved dht table");
        Ok(())
    }

    /// Insert every valid record from `path`. Returns how many were loaded.
    pub async fn load(&self, path: &Path) -> Result<usize> {
        let bytes = tokio::fs::read(path).await?;
        let records: Vec<KeyValue> = serde_json::from_slice(&bytes)?;
        let mut loaded = 0;
        for record in records {
            match record.entry() {
                Ok(_) => {
                    self.insert(record).await;
                    loaded += 1;
                }
                Err(e) => warn!(key = %record.key.short(), error = %e, "skipping invalid stored record"),
            }
        }
        debug!(path = %path.display(), loaded, "loaded dht table");
        Ok(loaded)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn addr_with_first_byte(b: u8) -> Address {
        let mut bytes = [0u8; 32];
        bytes[0] = b;
        Address::from_bytes(bytes)
    }

    fn record(key: Address) -> KeyValue {
        KeyValue { key, value: vec![1, 2, 3] }
    }

    #[test]
    fn bucket_index_is_common_prefix_length() {
        let zero = Address::from_bytes([0u8; 32]);
        assert_eq!(bucket_index(&zero, &addr_with_first_byte(0x80)), 0);
        assert_eq!(bucket_index(&zero, &addr_with_first_byte(0x01)), 7);
        let mut last = [0u8; 32];
        last[31] = 1;
        assert_eq!(bucket_index(&zero, &Address::from_bytes(last)), 255);
    }

    #[test]
    fn routing_table_ignores_self() {
        let me = addr_with_first_byte(0);
        let mut table = RoutingTable::new(me, DEFAULT_K);
        assert!(!table.insert(record(me)));
        assert!(table.is_empty());
    }

    #[test]
    fn insert_reports_new_keys_only() {
        let mut table = RoutingTable::new(addr_with_first_byte(0), DEFAULT_K);
        let key = addr_with_first_byte(5);
        assert!(table.insert(record(key)));
        assert!(!table.insert(record(key)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn full_bucket_evicts_least_recently_seen() {
        let me = Address::from_bytes([0u8; 32]);
        let mut table = RoutingTable::new(me, 2);
        let keys: Vec<Address> = (1..=3u8)
            .map(|i| {
                let mut bytes = [0u8; 32];
                bytes[0] = 0x80;
                bytes[31] = i;
                Address::from_bytes(bytes)
            })
            .collect();
        table.insert(record(keys[0]));
        table.insert(record(keys[1]));
        table.insert(record(keys[0]));
        table.insert(record(keys[2]));
        assert!(table.get(&keys[0]).is_some());
        assert!(table.get(&keys[1]).is_none());
        assert!(table.get(&keys[2]).is_some());
    }

    #[test]
    fn closest_is_sorted_by_distance() {
        let me = Address::from_bytes([0xAA; 32]);
        let mut table = RoutingTable::new(me, DEFAULT_K);
        for b in [0x10u8, 0x01, 0x40, 0x02] {
            table.insert(record(addr_with_first_byte(b)));
        }
        let target = Address::from_bytes([0u8; 32]);
        let got: Vec<u8> = table.closest(&target, 3).iter().map(|r| r.key.as_bytes()[0]).collect();
        assert_eq!(got, vec![0x01, 0x02, 0x10]);
    }

    #[test]
    fn keyvalue_entry_checks_key_and_signature() {
        let kp = Keypair::generate();
        let entry = Entry::new(&kp, "127.0.0.1", 1);
        let kv = KeyValue::from_entry(&entry).unwrap();
        assert_eq!(kv.entry().unwrap(), entry);

        let wrong_key = KeyValue { key: Address::random(), value: kv.value.clone() };
        assert!(matches!(wrong_key.entry(), Err(Error::IdentityMismatch { .. })));
    }

    #[tokio::test]
    async fn actor_handle_roundtrip() {
        let me = Keypair::generate().address();
        let dht = Dht::new(me, DEFAULT_K);
        let entry = Entry::new(&Keypair::generate(), "127.0.0.1", 1);

        assert!(!dht.has(&entry.address).await);
        assert!(dht.insert_entry(&entry).await.unwrap());
        assert!(dht.has(&entry.address).await);
        assert_eq!(dht.query(&entry.address).await.unwrap().entry().unwrap(), entry);
        assert_eq!(dht.find_closest(&entry.address).await.len(), 1);
        assert_eq!(dht.address(), me);
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dht.json");

        let dht = Dht::new(Keypair::generate().address(), DEFAULT_K);
        for _ in 0..5 {
            dht.insert_entry(&Entry::new(&Keypair::generate(), "127.0.0.1", 1)).await.unwrap();
        }
        dht.save(&path).await.unwrap();

        let restored = Dht::new(Keypair::generate().address(), DEFAULT_K);
        assert_eq!(restored.load(&path).await.unwrap(), 5);
        assert_eq!(restored.len().await, 5);
    }
}
