//! Node configuration and timing constants.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound on liveness probes and stream acquisition.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on one request/response exchange over an open stream.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Default period between SeedManager ticks.
pub const DEFAULT_SEED_SEARCH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default pause before the explorer re-seeds an empty queue.
pub const DEFAULT_EXPLORE_INTERVAL: Duration = Duration::from_secs(30);

/// Hop budget for one resolution walk. Worst-case latency is
/// `64 * CONNECTION_TIMEOUT`.
pub const DEFAULT_MAX_RESOLVE_HOPS: usize = 64;

/// Number of candidates returned by `find_closest`.
pub const DEFAULT_CLOSEST_COUNT: usize = 20;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Socket the QUIC endpoint binds to.
    pub bind_addr: SocketAddr,
    /// Host advertised in the local entry; empty means "use the bound IP".
    pub public_address: String,
    pub name: String,
    pub description: String,
    /// Directory for the key file, entry and DHT table. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub connection_timeout: Duration,
    pub rpc_timeout: Duration,
    pub seed_search_interval: Duration,
    pub explore_interval: Duration,
    pub max_resolve_hops: usize,
    pub closest_count: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5050)),
            public_address: String::new(),
            name: String::new(),
            description: String::new(),
            data_dir: None,
            connection_timeout: CONNECTION_TIMEOUT,
            rpc_timeout: RPC_TIMEOUT,
            seed_search_interval: DEFAULT_SEED_SEARCH_INTERVAL,
            explore_interval: DEFAULT_EXPLORE_INTERVAL,
            max_resolve_hops: DEFAULT_MAX_RESOLVE_HOPS,
            closest_count: DEFAULT_CLOSEST_COUNT,
        }
    }
}

impl NodeConfig {
    pub fn key_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("identity.key"))
    }

    pub fn entry_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("entry.json"))
    }

    pub fn dht_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("dht.json"))
    }
}
