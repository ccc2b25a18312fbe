//! Resolution walks over small in-process networks.

use std::sync::Arc;
use std::time::Duration;

use seedmesh::{Address, Error, Keypair, LocalNode, MemoryNetwork, NodeConfig};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn node_with(network: &Arc<MemoryNetwork>, endpoint: &str, config: NodeConfig) -> LocalNode {
    LocalNode::with_transport(config, Keypair::generate(), network.transport(endpoint))
        .await
        .expect("node start failed")
}

async fn node(network: &Arc<MemoryNetwork>, endpoint: &str) -> LocalNode {
    node_with(network, endpoint, NodeConfig::default()).await
}

#[tokio::test]
async fn resolve_self_needs_no_network() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a:1").await;

    let entry = a.resolve(a.address()).await.expect("self resolve failed");
    assert_eq!(entry, a.entry());
    assert!(a.peers().is_empty());
}

#[tokio::test]
async fn resolve_hits_dht_cache_without_network() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a:1").await;
    let b = node(&network, "b:1").await;
    a.connect_direct("b:1").await.unwrap();

    network.disconnect("b:1");
    let entry = a.resolve(b.address()).await.expect("cached resolve failed");
    assert_eq!(entry.address, b.address());
    assert!(entry.verify().is_ok());
}

#[tokio::test]
async fn resolve_walks_two_remote_hops() {
    // x knows y, y knows z, only z knows w
    let network = MemoryNetwork::new();
    let x = node(&network, "x:1").await;
    let y = node(&network, "y:1").await;
    let z = node(&network, "z:1").await;
    let w = node(&network, "w:1").await;

    y.connect_direct("z:1").await.unwrap();
    z.connect_direct("w:1").await.unwrap();
    x.connect_direct("y:1").await.unwrap();
    assert!(!x.dht().has(&w.address()).await);

    let entry = timeout(TEST_TIMEOUT, x.resolve(w.address()))
        .await
        .expect("resolve timed out")
        .expect("resolve failed");
    assert_eq!(entry.address, w.address());
    assert!(entry.verify().is_ok());

    // the walk went x -> y -> z and never dialed w
    assert!(x.peers().contains(&y.address()));
    assert!(x.peers().contains(&z.address()));
    assert!(!x.peers().contains(&w.address()));

    // and the result is cached
    assert!(x.dht().has(&w.address()).await);
}

#[tokio::test]
async fn resolve_absent_address_terminates_on_cycle() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a:1").await;
    let b = node(&network, "b:1").await;
    let _c = node(&network, "c:1").await;

    a.connect_direct("b:1").await.unwrap();
    a.connect_direct("c:1").await.unwrap();
    b.connect_direct("c:1").await.unwrap();

    let missing = Address::random();
    let result = timeout(TEST_TIMEOUT, a.resolve(missing))
        .await
        .expect("resolve looped");
    assert!(matches!(result, Err(Error::NotFound(addr)) if addr == missing));
}

#[tokio::test]
async fn resolve_with_empty_dht_is_not_found() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a:1").await;
    assert!(matches!(a.resolve(Address::random()).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn resolve_respects_hop_budget() {
    let network = MemoryNetwork::new();
    let config = NodeConfig {
        max_resolve_hops: 1,
        ..NodeConfig::default()
    };
    let a = node_with(&network, "a:1", config).await;
    let b = node(&network, "b:1").await;
    let c = node(&network, "c:1").await;
    let d = node(&network, "d:1").await;

    b.connect_direct("c:1").await.unwrap();
    c.connect_direct("d:1").await.unwrap();
    a.connect_direct("b:1").await.unwrap();

    assert!(matches!(a.resolve(d.address()).await, Err(Error::NotFound(_))));
    assert!(!a.peers().contains(&c.address()));
}

#[tokio::test]
async fn resolve_with_only_dead_candidates_is_unreachable() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a:1").await;
    let _b = node(&network, "b:1").await;
    a.connect_direct("b:1").await.unwrap();

    network.disconnect("b:1");
    let result = timeout(TEST_TIMEOUT, a.resolve(Address::random()))
        .await
        .expect("resolve timed out");
    assert!(matches!(result, Err(Error::Unreachable(_))));
}

#[tokio::test]
async fn dead_branch_does_not_stop_the_walk() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a:1").await;
    let _dead = node(&network, "dead:1").await;
    let b = node(&network, "b:1").await;
    let target = node(&network, "t:1").await;

    b.connect_direct("t:1").await.unwrap();
    a.connect_direct("dead:1").await.unwrap();
    a.connect_direct("b:1").await.unwrap();
    network.disconnect("dead:1");

    let entry = a.resolve(target.address()).await.expect("resolve failed");
    assert_eq!(entry.address, target.address());
}

#[tokio::test]
async fn connect_by_address_resolves_then_dials() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a:1").await;
    let b = node(&network, "b:1").await;
    let c = node(&network, "c:1").await;
    b.connect_direct("c:1").await.unwrap();
    a.connect_direct("b:1").await.unwrap();

    let peer = a.connect(c.address()).await.expect("connect failed");
    assert_eq!(peer.address(), c.address());
    assert!(peer.ping().await.is_ok());
    assert_eq!(peer.entry().await.unwrap().address, c.address());
}
