// NeighborList Tests
// Capacity, LRU eviction, blacklist and sampling over an in-process network

use async_trait::async_trait;
use gossipmesh::identity::NodeId;
use gossipmesh::membership::{NeighborList, DEFAULT_NEIGHBOR_CAPACITY};
use gossipmesh::protocol::{Envelope, Reply};
use gossipmesh::transport::{
    Connection, InboundHandler, Listener, MemoryNetwork, MemoryTransport, Transport,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

struct Ack;

#[async_trait]
impl InboundHandler for Ack {
    async fn handle(&self, _envelope: Envelope) -> Reply {
        Reply::Ack
    }
}

fn node(n: u16) -> NodeId {
    NodeId::parse(&format!("10.0.0.{}:7000", n)).unwrap()
}

/// Network with `count` listening peers, ids `node(1)..=node(count)`
async fn network(count: u16) -> (MemoryNetwork, Vec<Listener>) {
    let network = MemoryNetwork::new();
    let transport = network.transport();
    let mut listeners = Vec::new();
    for n in 1..=count {
        listeners.push(transport.listen(&node(n), Arc::new(Ack)).await.unwrap());
    }
    (network, listeners)
}

fn list(network: &MemoryNetwork, capacity: usize) -> NeighborList<MemoryTransport> {
    NeighborList::new(capacity, Arc::new(network.transport()))
}

// ============================================================================
// ADMISSION
// ============================================================================

#[tokio::test]
async fn test_update_admits_reachable_peer() {
    let (network, _listeners) = network(1).await;
    let neighbors = list(&network, 4);

    assert!(neighbors.update(&node(1)).await);
    assert!(neighbors.contains(&node(1)));
    assert_eq!(neighbors.len(), 1);
}

#[tokio::test]
async fn test_update_known_peer_is_not_new() {
    let (network, _listeners) = network(1).await;
    let neighbors = list(&network, 4);

    assert!(neighbors.update(&node(1)).await);
    assert!(!neighbors.update(&node(1)).await);
    assert_eq!(neighbors.len(), 1);
}

#[tokio::test]
async fn test_update_unreachable_peer_leaves_list_untouched() {
    let (network, _listeners) = network(1).await;
    let neighbors = list(&network, 4);
    neighbors.update(&node(1)).await;

    assert!(!neighbors.update(&node(9)).await);
    assert_eq!(neighbors.peers(), vec![node(1)]);
}

#[tokio::test]
async fn test_default_capacity() {
    let network = MemoryNetwork::new();
    let neighbors = list(&network, DEFAULT_NEIGHBOR_CAPACITY);
    assert_eq!(neighbors.capacity(), 256);
    assert!(neighbors.is_empty());
}

// ============================================================================
// LRU ORDER & EVICTION
// ============================================================================

#[tokio::test]
async fn test_update_moves_member_to_front() {
    let (network, _listeners) = network(3).await;
    let neighbors = list(&network, 4);
    for n in 1..=3 {
        neighbors.update(&node(n)).await;
    }
    assert_eq!(neighbors.peers(), vec![node(3), node(2), node(1)]);

    neighbors.update(&node(1)).await;
    assert_eq!(neighbors.peers(), vec![node(1), node(3), node(2)]);
}

#[tokio::test]
async fn test_full_list_evicts_least_recently_touched() {
    let (network, _listeners) = network(4).await;
    let neighbors = list(&network, 3);
    for n in 1..=3 {
        neighbors.update(&node(n)).await;
    }
    // Touch 1 so 2 becomes least recent
    neighbors.update(&node(1)).await;
    let lru_connection = neighbors.connection(&node(2)).unwrap();

    assert!(neighbors.update(&node(4)).await);

    assert_eq!(neighbors.len(), 3);
    assert!(!neighbors.contains(&node(2)));
    assert!(lru_connection.is_closed());
    assert_eq!(neighbors.peers(), vec![node(4), node(1), node(3)]);
}

#[tokio::test]
async fn test_delete_closes_connection() {
    let (network, _listeners) = network(2).await;
    let neighbors = list(&network, 4);
    neighbors.update(&node(1)).await;
    neighbors.update(&node(2)).await;
    let connection = neighbors.connection(&node(1)).unwrap();

    assert!(neighbors.delete(&node(1)));
    assert!(!neighbors.delete(&node(1)));
    assert!(connection.is_closed());
    assert_eq!(neighbors.peers(), vec![node(2)]);
}

#[tokio::test]
async fn test_clear_closes_everything() {
    let (network, _listeners) = network(3).await;
    let neighbors = list(&network, 4);
    for n in 1..=3 {
        neighbors.update(&node(n)).await;
    }
    let connections: Vec<_> = (1..=3)
        .filter_map(|n| neighbors.connection(&node(n)))
        .collect();

    neighbors.clear();

    assert!(neighbors.is_empty());
    assert!(connections.iter().all(|c| c.is_closed()));
}

// ============================================================================
// RECONNECT
// ============================================================================

#[tokio::test]
async fn test_reconnect_moves_member_to_back() {
    let (network, _listeners) = network(3).await;
    let neighbors = list(&network, 4);
    for n in 1..=3 {
        neighbors.update(&node(n)).await;
    }
    let old = neighbors.connection(&node(3)).unwrap();

    assert!(neighbors.reconnect(&node(3), &old).await);

    assert!(old.is_closed());
    assert!(!neighbors.connection(&node(3)).unwrap().is_closed());
    assert_eq!(neighbors.peers(), vec![node(2), node(1), node(3)]);
}

#[tokio::test]
async fn test_reconnect_to_crashed_peer_evicts() {
    let (network, _listeners) = network(2).await;
    let neighbors = list(&network, 4);
    neighbors.update(&node(1)).await;
    neighbors.update(&node(2)).await;
    let broken = neighbors.connection(&node(1)).unwrap();

    assert!(network.disconnect(&node(1)));
    assert!(!neighbors.reconnect(&node(1), &broken).await);

    assert_eq!(neighbors.peers(), vec![node(2)]);
}

#[tokio::test]
async fn test_reconnect_unknown_peer() {
    let (network, _listeners) = network(1).await;
    let other = list(&network, 4);
    other.update(&node(1)).await;
    let foreign = other.connection(&node(1)).unwrap();

    let neighbors = list(&network, 4);
    assert!(!neighbors.reconnect(&node(1), &foreign).await);
    assert!(neighbors.is_empty());
}

#[tokio::test]
async fn test_stale_failure_does_not_close_replacement() {
    let (network, _listeners) = network(3).await;
    let neighbors = list(&network, 4);
    for n in 1..=3 {
        neighbors.update(&node(n)).await;
    }
    let stale = neighbors.connection(&node(2)).unwrap();
    assert!(neighbors.reconnect(&node(2), &stale).await);
    let fresh = neighbors.connection(&node(2)).unwrap();
    let order = neighbors.peers();

    // A relay still holding the old connection fails on it
    let result = stale.send(&Envelope::peer_request("t", node(9), 1)).await;
    assert!(result.is_err());
    assert!(neighbors.reconnect(&node(2), &stale).await);

    assert!(!fresh.is_closed());
    assert!(Arc::ptr_eq(&fresh, &neighbors.connection(&node(2)).unwrap()));
    assert!(fresh.send(&Envelope::peer_request("t", node(9), 1)).await.is_ok());
    assert_eq!(neighbors.peers(), order);
}

// ============================================================================
// BLACKLIST
// ============================================================================

#[tokio::test]
async fn test_blacklisted_peer_never_admitted() {
    let (network, _listeners) = network(2).await;
    let neighbors = list(&network, 4);
    neighbors.add_blacklist(&node(1));

    assert!(neighbors.is_blacklisted(&node(1)));
    assert!(!neighbors.update(&node(1)).await);
    assert!(neighbors.update(&node(2)).await);

    assert_eq!(neighbors.peers(), vec![node(2)]);
    assert_eq!(neighbors.sample(4), vec![node(2)]);
}

#[tokio::test]
async fn test_blacklisting_member_evicts_it() {
    let (network, _listeners) = network(2).await;
    let neighbors = list(&network, 4);
    neighbors.update(&node(1)).await;
    neighbors.update(&node(2)).await;

    neighbors.add_blacklist(&node(2));

    assert_eq!(neighbors.peers(), vec![node(1)]);
}

// ============================================================================
// SAMPLING
// ============================================================================

#[tokio::test]
async fn test_sample_returns_distinct_members() {
    let (network, _listeners) = network(8).await;
    let neighbors = list(&network, 8);
    for n in 1..=8 {
        neighbors.update(&node(n)).await;
    }

    for k in 0..=8 {
        let sample = neighbors.sample(k);
        let distinct: HashSet<_> = sample.iter().cloned().collect();
        assert_eq!(sample.len(), k);
        assert_eq!(distinct.len(), k);
        assert!(sample.iter().all(|id| neighbors.contains(id)));
    }
}

#[tokio::test]
async fn test_sample_larger_than_membership() {
    let (network, _listeners) = network(3).await;
    let neighbors = list(&network, 8);
    for n in 1..=3 {
        neighbors.update(&node(n)).await;
    }

    assert_eq!(neighbors.sample(10).len(), 3);
    assert!(list(&network, 8).sample(5).is_empty());
}

#[tokio::test]
async fn test_sample_connections_match_members() {
    let (network, _listeners) = network(4).await;
    let neighbors = list(&network, 4);
    for n in 1..=4 {
        neighbors.update(&node(n)).await;
    }

    for (id, connection) in neighbors.sample_connections(3) {
        assert_eq!(connection.peer(), &id);
        assert!(Arc::ptr_eq(&connection, &neighbors.connection(&id).unwrap()));
    }
}

#[tokio::test]
async fn test_sample_does_not_reorder() {
    let (network, _listeners) = network(4).await;
    let neighbors = list(&network, 4);
    for n in 1..=4 {
        neighbors.update(&node(n)).await;
    }
    let before = neighbors.peers();

    neighbors.sample(2);
    neighbors.sample_connections(3);

    assert_eq!(neighbors.peers(), before);
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_capacity_and_lru_hold(
        capacity in 1usize..6,
        touches in prop::collection::vec(1u16..10, 1..40),
        banned in 1u16..10,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let (network, _listeners) = network(9).await;
            let neighbors = list(&network, capacity);
            neighbors.add_blacklist(&node(banned));

            // Reference model: most recent first, banned ids skipped
            let mut model: Vec<NodeId> = Vec::new();
            for n in touches {
                neighbors.update(&node(n)).await;
                if n == banned {
                    continue;
                }
                model.retain(|id| id != &node(n));
                model.insert(0, node(n));
                model.truncate(capacity);
            }

            let peers = neighbors.peers();
            prop_assert!(peers.len() <= capacity);
            prop_assert!(!peers.contains(&node(banned)));
            prop_assert_eq!(peers, model);
            Ok(())
        })?;
    }
}
