//! Integration test: convergence.
//!
//! Several writers append concurrently and exchange history in arbitrary
//! orders. Once everything has propagated, every replica must hold the same
//! entries, heads and gids.

use std::sync::Arc;

use reef_integration_tests::{Swarm, value};
use reef_log::{JoinOptions, Log, LogSnapshot};
use tokio::sync::Mutex;

fn assert_converged(s: &Swarm) -> LogSnapshot {
    let reference = s.replica(0).snapshot();
    for i in 1..s.len() {
        assert_eq!(s.replica(i).snapshot(), reference, "replica {i} diverged");
    }
    reference
}

/// Deterministic pseudo-random sequence for picking sync pairs.
struct Lcg(u32);

impl Lcg {
    fn next(&mut self, bound: usize) -> usize {
        self.0 = self.0.wrapping_mul(1103515245).wrapping_add(12345);
        (self.0 >> 16) as usize % bound
    }
}

/// Three writers, one exchange round: everyone ends up identical.
#[tokio::test]
async fn test_concurrent_writers_converge() {
    let mut s = Swarm::new(3);
    for round in 0..5 {
        for w in 0..3 {
            s.append(w, value(w, round)).await;
        }
    }

    s.sync_all().await;
    let snapshot = assert_converged(&s);
    assert_eq!(snapshot.entries.len(), 15);
    assert_eq!(snapshot.heads.len(), 3);

    // Values are ordered identically everywhere.
    let reference: Vec<String> = s.replica(0).values().unwrap().into_iter().cloned().collect();
    for i in 1..3 {
        let values: Vec<String> = s.replica(i).values().unwrap().into_iter().cloned().collect();
        assert_eq!(values, reference);
    }
}

/// Gossip in a random order while writers keep appending.
#[tokio::test]
async fn test_random_gossip_converges() {
    let mut s = Swarm::new(4);
    let mut rng = Lcg(0xDEAD_BEEF);

    for step in 0..60 {
        let writer = rng.next(4);
        s.append(writer, value(writer, step)).await;

        let from = rng.next(4);
        let to = rng.next(4);
        if from != to {
            s.sync(from, to).await;
        }
    }

    s.sync_all().await;
    let snapshot = assert_converged(&s);
    assert_eq!(snapshot.entries.len(), 60);
}

/// After a merge append, the losing gids are shadowed on every replica.
#[tokio::test]
async fn test_merge_collapses_gids_everywhere() {
    let mut s = Swarm::new(3);
    for w in 0..3 {
        s.append(w, value(w, 0)).await;
    }
    s.sync_all().await;
    assert_eq!(s.replica(0).gids().len(), 3);
    assert!(s.replica(0).shadowed_gids().is_empty());

    let merged = s.append(0, "merge").await;
    s.sync_all().await;

    let gid = s.replica(0).get(&merged).unwrap().meta().unwrap().gid.clone();
    for i in 0..3 {
        let replica = s.replica(i);
        assert_eq!(replica.gids().len(), 3, "history keeps every gid");
        assert_eq!(replica.shadowed_gids().len(), 2, "replica {i}");
        assert!(!replica.shadowed_gids().contains(&gid));
    }
    assert_converged(&s);
}

/// A partitioned replica catches up once reconnected.
#[tokio::test]
async fn test_partition_heals() {
    let mut s = Swarm::new(3);
    s.append(0, value(0, 0)).await;
    s.sync_all().await;

    s.kill(2);
    for i in 1..10 {
        s.append(0, value(0, i)).await;
        s.append(2, value(2, i)).await;
    }
    s.sync(0, 1).await;
    s.sync(2, 1).await;
    assert_eq!(s.replica(1).len(), 10, "only the reachable side arrives");

    s.revive(2);
    s.sync_all().await;
    let snapshot = assert_converged(&s);
    assert_eq!(snapshot.entries.len(), 19);
}

/// Replicas joined concurrently from separate tasks agree with a
/// sequential replay.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_parallel_joins_converge() {
    let mut s = Swarm::new(4);
    for i in 0..10 {
        for w in 0..4 {
            s.append(w, value(w, i)).await;
        }
    }

    let sources: Vec<Log<String>> = (0..4).map(|i| s.replica(i).clone()).collect();
    let target = Arc::new(Mutex::new(s.replica(0).clone()));

    let mut handles = Vec::new();
    for source in sources.iter().skip(1).cloned() {
        let target = target.clone();
        handles.push(tokio::spawn(async move {
            let entries: Vec<_> = source.entries().cloned().collect();
            target
                .lock()
                .await
                .join(entries, JoinOptions::default())
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut sequential = sources[3].clone();
    for source in sources.iter().take(3) {
        sequential.join_log(source).await.unwrap();
    }

    let parallel = target.lock().await.snapshot();
    assert_eq!(parallel.entries.len(), 40);
    assert_eq!(parallel, sequential.snapshot());
}
