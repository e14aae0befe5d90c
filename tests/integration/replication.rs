//! Integration test: replication.
//!
//! One writer, one or more readers pulling history through their block
//! stores.

use reef_integration_tests::{Swarm, value};
use reef_log::{FetchOptions, TrimPolicy};

/// A reader pulls the writer's full history and stores every block locally.
#[tokio::test]
async fn test_reader_pulls_full_history() {
    let mut s = Swarm::new(2);
    for i in 0..20 {
        s.append(0, value(0, i)).await;
    }

    let report = s.sync(0, 1).await;
    assert_eq!(report.join.added.len(), 20);
    assert!(report.missing.is_empty());
    assert!(report.timed_out.is_empty());

    assert_eq!(s.replica(1).snapshot().entries, s.replica(0).snapshot().entries);
    assert_eq!(s.replica(1).head_hashes(), s.replica(0).head_hashes());
    assert_eq!(s.local_block_count(1).await, 20);
}

/// A bounded pull takes the newest entries and leaves a tail to fill later.
#[tokio::test]
async fn test_bounded_pull_then_backfill() {
    let mut s = Swarm::new(2);
    let mut hashes = Vec::new();
    for i in 0..20 {
        hashes.push(s.append(0, value(0, i)).await);
    }

    let report = s.sync_with(0, 1, FetchOptions::new().length(5)).await;
    assert_eq!(report.join.added.len(), 5);

    let reader = s.replica(1);
    let values: Vec<&String> = reader.values().unwrap();
    let expected: Vec<String> = (15..20).map(|i| value(0, i)).collect();
    assert_eq!(values, expected.iter().collect::<Vec<_>>());
    assert_eq!(reader.tail_hashes(), vec![hashes[14]]);

    let report = s.sync(0, 1).await;
    assert_eq!(report.join.added.len(), 15);
    assert!(s.replica(1).tail_hashes().is_empty());
    assert_eq!(s.replica(1).len(), 20);
}

/// Appends made after a pull build on the writer's history.
#[tokio::test]
async fn test_reader_extends_writer_history() {
    let mut s = Swarm::new(2);
    for i in 0..3 {
        s.append(0, value(0, i)).await;
    }
    s.sync(0, 1).await;

    let writer_head = s.replica(0).head_hashes()[0];
    let reply = s.append(1, value(1, 0)).await;

    let entry = s.replica(1).get(&reply).unwrap();
    let meta = entry.meta().unwrap();
    assert_eq!(meta.next, vec![writer_head]);
    assert!(meta.clock > s.replica(0).get(&writer_head).unwrap().meta().unwrap().clock);

    s.sync(1, 0).await;
    assert_eq!(s.replica(0).head_hashes(), &[reply]);
    assert_eq!(s.replica(0).len(), 4);
}

/// An unreachable writer yields missing heads rather than an error.
#[tokio::test]
async fn test_unreachable_writer() {
    let mut s = Swarm::new(2);
    for i in 0..5 {
        s.append(0, value(0, i)).await;
    }

    s.kill(0);
    let report = s.sync(0, 1).await;
    assert_eq!(report.missing, s.replica(0).head_hashes().to_vec());
    assert!(s.replica(1).is_empty());

    s.revive(0);
    let report = s.sync(0, 1).await;
    assert!(report.missing.is_empty());
    assert_eq!(s.replica(1).len(), 5);
}

/// History keeps flowing through an intermediate replica.
#[tokio::test]
async fn test_relay_through_intermediate() {
    let mut s = Swarm::new(3);
    for i in 0..10 {
        s.append(0, value(0, i)).await;
    }

    s.sync(0, 1).await;
    s.kill(0);
    let report = s.sync(1, 2).await;

    assert!(report.missing.is_empty());
    assert_eq!(s.replica(2).snapshot().entries, s.replica(0).snapshot().entries);
}

/// Bounded replicas trim what they pull down to the retention limit.
#[tokio::test]
async fn test_bounded_replicas_trim_pulled_history() {
    let mut s = Swarm::with_trim(2, TrimPolicy::length(5));
    for i in 0..20 {
        s.append(0, value(0, i)).await;
    }
    assert_eq!(s.replica(0).len(), 5);

    let report = s.sync(0, 1).await;
    assert_eq!(s.replica(1).len(), 5);
    assert_eq!(report.join.trimmed.len(), 15);

    let expected: Vec<String> = (15..20).map(|i| value(0, i)).collect();
    assert_eq!(
        s.replica(1).values().unwrap(),
        expected.iter().collect::<Vec<_>>()
    );
}
