//! Rehash E2E tests.
//!
//! | Scenario                         | Verification                              |
//! |----------------------------------|-------------------------------------------|
//! | Join while transfer is held      | Writes reach old and new owners           |
//! | Joiner down during dual-write    | Write fails instead of being acknowledged |
//! | Leave                            | Every key keeps `num_owners` copies       |
//! | Unreachable joiner               | Joiner excluded, data intact              |
//! | Writes during join               | No lost writes                            |
//! | Random join/leave                | Committed ids strictly increase           |

use super::{wait_for, TestCluster};
use crate::config::{CacheConfig, GridConfig, RehashConfig};
use crate::rebalancing::SegmentTransferState;
use crate::types::{EntryMetadata, NodeAddress};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

const CACHE: &str = "default";

fn config(num_segments: u32, num_owners: u32, rehash: RehashConfig) -> GridConfig {
    GridConfig::new().with_cache(
        CACHE,
        CacheConfig::new(num_segments, num_owners).with_rehash_config(rehash),
    )
}

fn key(i: usize) -> Bytes {
    Bytes::from(format!("key-{}", i))
}

fn value(i: usize) -> Bytes {
    Bytes::from(format!("value-{}", i))
}

async fn load(cluster: &TestCluster, node: &NodeAddress, count: usize) {
    let cache = cluster.cache(node, CACHE).unwrap();
    for i in 0..count {
        cache.put(key(i), value(i), EntryMetadata::default()).await.unwrap();
    }
}

#[tokio::test]
async fn test_writes_during_transfer_reach_both_owners() {
    let rehash = RehashConfig::default()
        .with_max_concurrent_transfers(8)
        .with_transfer_timeout(Duration::from_secs(30));
    let cluster = TestCluster::start(config(8, 1, rehash), 1).await.unwrap();
    let old = cluster.first_node();
    load(&cluster, &old, 40).await;

    cluster.chaos.hold("push_batch", CACHE);
    let new = cluster.add_node().await.unwrap();

    let manager = cluster.grid().manager(CACHE).unwrap();
    let pending = manager.pending_topology().expect("rehash in flight");
    let moved: Vec<usize> = (0..40)
        .filter(|&i| pending.hash.locate_owners(&key(i)) == [new.clone()])
        .collect();
    assert!(moved.len() >= 2, "expected keys moving to the joiner");
    let (written, removed) = (moved[0], moved[1]);

    let in_transfer = |i: usize| {
        let view = manager.routing_view();
        let segment = view.segment_of(&key(i));
        view.pending
            .as_ref()
            .is_some_and(|p| p.table.state(segment) == SegmentTransferState::Transferring)
    };
    let transferring = wait_for(
        || in_transfer(written) && in_transfer(removed),
        Duration::from_secs(5),
        Duration::from_millis(5),
    )
    .await;
    assert!(transferring);

    let cache = cluster.cache(&old, CACHE).unwrap();
    cache
        .put(key(written), Bytes::from_static(b"rewritten"), EntryMetadata::default())
        .await
        .unwrap();
    cache.remove(key(removed)).await.unwrap();

    // Dual-write: the holder and the joiner both saw the write.
    let holders = cluster.holders_of(CACHE, &key(written));
    assert!(holders.contains(&old) && holders.contains(&new), "{:?}", holders);
    assert!(cluster.holders_of(CACHE, &key(removed)).is_empty());
    // Reads still come from the holder.
    let entry = cluster.cache(&new, CACHE).unwrap().get(&key(written)).await.unwrap();
    assert_eq!(entry.unwrap().value, Bytes::from_static(b"rewritten"));

    cluster.chaos.release_all();
    cluster.await_stable().await.unwrap();

    // The held snapshot must neither undo the write nor resurrect the removal.
    assert_eq!(cluster.holders_of(CACHE, &key(written)), vec![new.clone()]);
    let entry = cache.get(&key(written)).await.unwrap().unwrap();
    assert_eq!(entry.value, Bytes::from_static(b"rewritten"));
    assert!(cache.get(&key(removed)).await.unwrap().is_none());
    assert!(cluster.holders_of(CACHE, &key(removed)).is_empty());

    for i in (0..40).filter(|&i| i != written && i != removed) {
        let entry = cache.get(&key(i)).await.unwrap();
        assert_eq!(entry.map(|e| e.value), Some(value(i)), "key {}", i);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failed_dual_write_is_not_acknowledged() {
    let rehash = RehashConfig::default()
        .with_max_concurrent_transfers(8)
        .with_retry(2, Duration::from_millis(5))
        .with_transfer_timeout(Duration::from_secs(30));
    let cluster = TestCluster::start(config(8, 1, rehash), 1).await.unwrap();
    let old = cluster.first_node();
    load(&cluster, &old, 40).await;

    cluster.chaos.hold("push_batch", CACHE);
    let new = cluster.add_node().await.unwrap();

    let manager = cluster.grid().manager(CACHE).unwrap();
    let pending = manager.pending_topology().expect("rehash in flight");
    let moved = (0..40)
        .find(|&i| pending.hash.locate_owners(&key(i)) == [new.clone()])
        .expect("a key moving to the joiner");

    // Every moving segment has its first batch parked, so the crash below
    // only hits the client write.
    let moving = manager
        .current_topology()
        .hash
        .changed_segments(&pending.hash)
        .len() as u64;
    let parked = wait_for(
        || cluster.chaos.held_requests() >= moving,
        Duration::from_secs(5),
        Duration::from_millis(5),
    )
    .await;
    assert!(parked);
    let view = manager.routing_view();
    let segment = view.segment_of(&key(moved));
    assert!(view
        .pending
        .as_ref()
        .is_some_and(|p| p.table.state(segment) == SegmentTransferState::Transferring));

    let cache = cluster.cache(&old, CACHE).unwrap();
    cluster.crash_node(&new, Duration::from_secs(60));
    let err = cache
        .put(key(moved), Bytes::from_static(b"unacked"), EntryMetadata::default())
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "{:?}", err);

    cluster.recover_nodes();
    cache
        .put(key(moved), Bytes::from_static(b"rewritten"), EntryMetadata::default())
        .await
        .unwrap();

    cluster.chaos.release_all();
    cluster.await_stable().await.unwrap();

    assert_eq!(cluster.holders_of(CACHE, &key(moved)), vec![new.clone()]);
    let entry = cache.get(&key(moved)).await.unwrap().unwrap();
    assert_eq!(entry.value, Bytes::from_static(b"rewritten"));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_leave_restores_redundancy() {
    let cluster = TestCluster::start(config(16, 2, RehashConfig::default()), 3)
        .await
        .unwrap();
    load(&cluster, &cluster.first_node(), 100).await;

    let leaver = TestCluster::node_name(2);
    cluster.remove_node(&leaver).await.unwrap();
    cluster.await_stable().await.unwrap();

    let cache = cluster.cache(&cluster.first_node(), CACHE).unwrap();
    for i in 0..100 {
        let entry = cache.get(&key(i)).await.unwrap();
        assert_eq!(entry.map(|e| e.value), Some(value(i)), "key {}", i);

        let holders = cluster.holders_of(CACHE, &key(i));
        assert_eq!(holders.len(), 2, "key {} held by {:?}", i, holders);
        assert!(!holders.contains(&leaver));
        let owners: HashSet<_> = cluster.owners_of(CACHE, &key(i)).into_iter().collect();
        assert_eq!(owners, holders.into_iter().collect());
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_joiner_is_excluded() {
    let rehash = RehashConfig::default()
        .with_retry(2, Duration::from_millis(5))
        .with_transfer_timeout(Duration::from_millis(500));
    let cluster = TestCluster::start(config(8, 2, rehash), 2).await.unwrap();
    load(&cluster, &cluster.first_node(), 30).await;
    let before = cluster.topology_id(CACHE).unwrap();

    let joiner = TestCluster::node_name(2);
    cluster.crash_node(&joiner, Duration::from_secs(60));
    cluster.add_node().await.unwrap();
    cluster.await_stable().await.unwrap();

    let manager = cluster.grid().manager(CACHE).unwrap();
    let current = manager.current_topology();
    assert!(current.topology_id > before);
    assert!(!current.is_member(&joiner));
    assert!(current.hash.segments_owned_by(&joiner).is_empty());

    cluster.recover_nodes();
    let cache = cluster.cache(&cluster.first_node(), CACHE).unwrap();
    for i in 0..30 {
        assert!(cache.get(&key(i)).await.unwrap().is_some(), "key {}", i);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_no_lost_writes_during_join() {
    let rehash = RehashConfig::default().with_batch_size(4);
    let cluster = Arc::new(TestCluster::start(config(32, 2, rehash), 2).await.unwrap());
    load(&cluster, &cluster.first_node(), 200).await;

    let writer = {
        let cluster = cluster.clone();
        tokio::spawn(async move {
            let cache = cluster.cache(&TestCluster::node_name(1), CACHE).unwrap();
            for i in 200..400 {
                cache.put(key(i), value(i), EntryMetadata::default()).await.unwrap();
            }
        })
    };
    cluster.add_node().await.unwrap();
    cluster.add_node().await.unwrap();
    writer.await.unwrap();
    cluster.await_stable().await.unwrap();

    let cache = cluster.cache(&cluster.first_node(), CACHE).unwrap();
    for i in 0..400 {
        let entry = cache.get(&key(i)).await.unwrap();
        assert_eq!(entry.map(|e| e.value), Some(value(i)), "key {}", i);
        assert_eq!(cluster.holders_of(CACHE, &key(i)).len(), 2, "key {}", i);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_topology_ids_increase_over_random_churn() {
    let cluster = TestCluster::start(config(12, 2, RehashConfig::default()), 2)
        .await
        .unwrap();
    cluster.serve(&cluster.first_node()).await.unwrap();
    load(&cluster, &cluster.first_node(), 50).await;

    let manager = cluster.grid().manager(CACHE).unwrap();
    let mut commits = manager.subscribe();
    let mut last_id = manager.current_topology().topology_id;
    let mut last_client_id = cluster.client_topology_id(CACHE).unwrap();
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..12 {
        let members = cluster.members();
        if members.len() <= 2 || rng.random_bool(0.5) {
            cluster.add_node().await.unwrap();
        } else {
            // Keep the served member.
            let candidates: Vec<_> = members.into_iter().skip(1).collect();
            let leaver = &candidates[rng.random_range(0..candidates.len())];
            cluster.remove_node(leaver).await.unwrap();
        }
        cluster.await_stable().await.unwrap();

        loop {
            match commits.try_recv() {
                Ok(topology) => {
                    assert!(topology.topology_id > last_id);
                    last_id = topology.topology_id;

                    let expected = 2.min(topology.members.len());
                    for s in 0..topology.hash.num_segments() {
                        assert_eq!(topology.hash.owners(s).len(), expected);
                    }
                }
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        let client_id = cluster.client_topology_id(CACHE).unwrap();
        assert!(client_id >= last_client_id);
        last_client_id = client_id;
    }

    let cache = cluster.cache(&cluster.first_node(), CACHE).unwrap();
    for i in 0..50 {
        assert!(cache.get(&key(i)).await.unwrap().is_some(), "key {}", i);
    }

    cluster.shutdown().await;
}
