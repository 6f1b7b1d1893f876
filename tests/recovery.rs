//! Leader-initiated recovery of a single shard.

mod common;

use common::*;
use futures::future::join_all;
use shardsync::replication::{MarkOutcome, MarkerAction, RecoveryPhase, UpdateOutcome};
use shardsync::state::{MarkerReason, RecoveryMarker, ReplicaId, ReplicaState, Update};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Settings where a failed catch-up attempt waits long enough for the test
/// to observe the replica while it is RECOVERING
fn slow_catch_up(backoff_ms: u64) -> shardsync::replication::NodeSettings {
    let mut settings = settings();
    settings.recovery.catch_up_backoff_ms = backoff_ms;
    settings.recovery.catch_up_attempts = 4;
    settings
}

#[tokio::test]
async fn test_mark_recover_clear() {
    let s = shard("shard1");
    let cluster = Cluster::start(&["n1", "n2", "n3"], &[s.clone()], slow_catch_up(1_000)).await;
    let leader = cluster.node("n1", &s);

    leader.write(update("doc-1", "first")).await.unwrap();

    cluster.network.partition(&address("n1"), &address("n2"));
    let receipt = leader.write(update("doc-2", "second")).await.unwrap();
    assert!(matches!(
        receipt.outcomes[&ReplicaId::new("n2")],
        UpdateOutcome::Unreachable { .. }
    ));
    assert!(receipt.outcomes[&ReplicaId::new("n3")].is_acked());

    // The marker is stamped with the leader's generation and outlives RECOVERING
    let marker = cluster.wait_for_marker(&s, "n2").await;
    assert_eq!(marker.leader_generation, receipt.generation);
    assert_eq!(marker.attempt, 1);
    cluster.wait_for_state(&s, "n2", ReplicaState::Recovering).await;
    assert_eq!(cluster.marker(&s, "n2").await.map(|m| m.id), Some(marker.id));

    let phases = leader.recovery_status().await.unwrap();
    let n2 = phases.iter().find(|p| p.replica.as_str() == "n2").unwrap();
    assert_eq!(n2.phase, RecoveryPhase::Recovering);
    assert_eq!(cluster.state(&s, "n1").await, Some(ReplicaState::Active));

    cluster.network.heal();
    cluster.wait_for_state(&s, "n2", ReplicaState::Active).await;
    cluster.wait_for_no_markers(&s).await;

    let record = cluster.store.replica(&s, &ReplicaId::new("n2")).await.unwrap().unwrap().value;
    assert_eq!(record.recovery_ref, Some(marker.id));
    let replica = cluster.node("n2", &s);
    assert_eq!(replica.index().last_offset().await, 2);
    assert!(replica.index().document("doc-2").await.is_some());

    cluster.stop().await;
}

#[tokio::test]
async fn test_stale_marker_is_discarded_without_recovery() {
    let s = shard("shard1");
    let cluster = Cluster::start(&["n1", "n2", "n3"], &[s.clone()], settings()).await;
    let leader = cluster.node("n1", &s);
    let generation = leader.role().await.generation();
    leader.write(update("doc-1", "first")).await.unwrap();
    cluster.wait_for_offset(&s, "n3", 1).await;

    let recorder = StateRecorder::start(&cluster.store, &s);
    let n3 = ReplicaId::new("n3");
    let stale = RecoveryMarker::new(
        s.clone(),
        n3.clone(),
        ReplicaId::new("n0"),
        generation - 1,
        MarkerReason::OperatorRequest,
    );

    // Evaluated directly, the marker is recognized as stale
    let agent = cluster.node("n3", &s).agent().clone();
    assert_eq!(agent.handle_marker(&stale).await.unwrap(), MarkerAction::Discarded);

    // Written to the store, it is removed without the replica recovering
    cluster
        .store
        .update_marker(&s, &n3, |_| Ok(Update::Put(stale.clone())))
        .await
        .unwrap();
    cluster.wait_for_no_markers(&s).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let record = cluster.store.replica(&s, &n3).await.unwrap().unwrap().value;
    assert_eq!(record.state, ReplicaState::Active);
    assert_ne!(record.recovery_ref, Some(stale.id));
    assert_eq!(recorder.history("n3"), vec![ReplicaState::Active]);
    assert_eq!(cluster.node("n3", &s).index().last_offset().await, 1);

    cluster.stop().await;
}

#[tokio::test]
async fn test_single_retry_and_mark_once() {
    let s = shard("shard1");
    let cluster = Cluster::start(&["n1", "n2", "n3"], &[s.clone()], slow_catch_up(5_000)).await;
    let leader = cluster.node("n1", &s);
    let (n1, n2, n3) = (address("n1"), address("n2"), address("n3"));

    cluster.network.partition(&n1, &n2);
    let receipt = leader.write(update("doc-1", "first")).await.unwrap();
    assert!(!receipt.outcomes[&ReplicaId::new("n2")].is_acked());

    // One retry for the unanswered update, none for the acknowledged one
    assert_eq!(cluster.network.update_attempts(&n1, &n2), 2);
    assert_eq!(cluster.network.update_attempts(&n1, &n3), 1);
    let marker = cluster.wait_for_marker(&s, "n2").await;

    let coordinator = leader.coordinator().clone();
    let replica = ReplicaId::new("n2");
    let (second, third, marks) = tokio::join!(
        leader.write(update("doc-2", "second")),
        leader.write(update("doc-3", "third")),
        join_all((0..4).map(|_| coordinator.mark_for_recovery(&replica, MarkerReason::OperatorRequest))),
    );
    assert!(!second.unwrap().outcomes[&replica].is_acked());
    assert!(!third.unwrap().outcomes[&replica].is_acked());
    for outcome in marks {
        match outcome.unwrap() {
            MarkOutcome::AlreadyMarked(m) => assert_eq!(m.id, marker.id),
            other => panic!("expected the outstanding marker, got {:?}", other),
        }
    }

    assert_eq!(cluster.network.update_attempts(&n1, &n2), 6);
    assert_eq!(cluster.network.update_attempts(&n1, &n3), 3);
    let markers = cluster.store.markers(&s).await.unwrap();
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].id, marker.id);
    assert_eq!(markers[0].attempt, 1);

    cluster.network.heal();
    cluster.stop().await;
}

#[tokio::test]
async fn test_partition_then_heal() {
    let s = shard("shard1");
    let cluster = Cluster::start(&["n1", "n2", "n3"], &[s.clone()], settings()).await;
    let leader = cluster.node("n1", &s);

    cluster.network.partition(&address("n1"), &address("n2"));
    leader.write(update("doc-1", "first")).await.unwrap();

    let state = cluster
        .wait_for_any_state(&s, "n2", &[ReplicaState::Recovering, ReplicaState::RecoveryFailed])
        .await;
    assert!(matches!(state, ReplicaState::Recovering | ReplicaState::RecoveryFailed));
    assert_eq!(cluster.state(&s, "n1").await, Some(ReplicaState::Active));
    assert!(leader.role().await.is_leader());

    // Catch-up cannot reach the leader, so the recovery fails and the marker stays
    cluster.wait_for_state(&s, "n2", ReplicaState::RecoveryFailed).await;
    let marker = cluster.marker(&s, "n2").await.expect("marker kept while RECOVERY_FAILED");
    let phases = leader.recovery_status().await.unwrap();
    let n2 = phases.iter().find(|p| p.replica.as_str() == "n2").unwrap();
    assert_eq!(n2.phase, RecoveryPhase::RecoveryFailed);

    // After healing, the next write re-enters recovery
    cluster.network.heal();
    let receipt = leader.write(update("doc-2", "second")).await.unwrap();
    assert!(receipt.outcomes[&ReplicaId::new("n3")].is_acked());

    cluster.wait_for_state(&s, "n2", ReplicaState::Active).await;
    cluster.wait_for_no_markers(&s).await;
    cluster.wait_for_offset(&s, "n2", receipt.offset).await;

    let record = cluster.store.replica(&s, &ReplicaId::new("n2")).await.unwrap().unwrap().value;
    assert_ne!(record.recovery_ref, Some(marker.id));
    assert_eq!(
        cluster.node("n2", &s).index().document_count().await,
        leader.index().document_count().await
    );

    cluster.stop().await;
}

#[tokio::test]
async fn test_operator_retry_after_failed_recovery() {
    let s = shard("shard1");
    let cluster = Cluster::start(&["n1", "n2"], &[s.clone()], settings()).await;
    let leader = cluster.node("n1", &s);

    cluster.network.partition(&address("n1"), &address("n2"));
    leader.write(update("doc-1", "first")).await.unwrap();
    cluster.wait_for_state(&s, "n2", ReplicaState::RecoveryFailed).await;
    let failed = cluster.marker(&s, "n2").await.unwrap();

    cluster.network.heal();
    let outcome = leader.retry_recovery(&ReplicaId::new("n2")).await.unwrap();
    match outcome {
        MarkOutcome::Reissued(m) => {
            assert_ne!(m.id, failed.id);
            assert_eq!(m.attempt, 2);
        }
        other => panic!("expected a reissued marker, got {:?}", other),
    }

    cluster.wait_for_state(&s, "n2", ReplicaState::Active).await;
    cluster.wait_for_no_markers(&s).await;
    cluster.wait_for_offset(&s, "n2", 1).await;

    // Only the leader can be asked to retry
    assert!(cluster.node("n2", &s).retry_recovery(&ReplicaId::new("n1")).await.is_err());

    cluster.stop().await;
}

#[tokio::test]
async fn test_partitioned_replica_does_not_delay_healthy_ones() {
    let mut settings = settings();
    settings.forwarding.retry_delay_ms = 1_500;

    let s = shard("shard1");
    let cluster = Cluster::start(&["n1", "n2", "n3"], &[s.clone()], settings).await;
    let leader = cluster.node("n1", &s);
    cluster.network.partition(&address("n1"), &address("n3"));

    let first = tokio::spawn({
        let leader = Arc::clone(&leader);
        async move { leader.write(update("doc-1", "first")).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let started = Instant::now();
    let second = tokio::spawn({
        let leader = Arc::clone(&leader);
        async move { leader.write(update("doc-2", "second")).await }
    });

    // n2 gets the second update while n3's first one is still waiting to retry
    cluster.wait_for_offset(&s, "n2", 2).await;
    assert!(
        started.elapsed() < Duration::from_millis(1_000),
        "n2 waited {:?} for the second update",
        started.elapsed()
    );

    let (n2, n3) = (ReplicaId::new("n2"), ReplicaId::new("n3"));
    for receipt in [first.await.unwrap().unwrap(), second.await.unwrap().unwrap()] {
        assert!(receipt.outcomes[&n2].is_acked());
        assert!(!receipt.outcomes[&n3].is_acked());
    }

    cluster.network.heal();
    cluster.stop().await;
}

#[tokio::test]
async fn test_replica_failing_startup_catch_up_is_marked() {
    let s = shard("shard1");
    let cluster = Cluster::new(&["n1", "n2"], &[s.clone()], settings());
    cluster.runtime("n1").start().await.unwrap();
    let leader = cluster.wait_for_leader(&s).await;
    leader.write(update("doc-1", "first")).await.unwrap();

    // n2 comes up unable to reach the leader it has to catch up from
    cluster.network.partition(&address("n1"), &address("n2"));
    cluster.runtime("n2").start().await.unwrap();
    cluster.wait_for_state(&s, "n2", ReplicaState::RecoveryFailed).await;

    let marker = cluster.wait_for_marker(&s, "n2").await;
    assert!(matches!(marker.reason, MarkerReason::ReplicaReported { .. }));
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        let phases = leader.recovery_status().await.unwrap();
        let n2 = phases.iter().find(|p| p.replica.as_str() == "n2").unwrap();
        assert_ne!(n2.phase, RecoveryPhase::Active);
        if n2.phase == RecoveryPhase::RecoveryFailed {
            break;
        }
        assert!(Instant::now() < deadline, "n2 stuck in {:?}", n2.phase);
        tokio::time::sleep(POLL).await;
    }
    assert!(cluster.marker(&s, "n2").await.is_some());

    // The failure holds until the next write reaches the healed replica
    cluster.network.heal();
    let receipt = leader.write(update("doc-2", "second")).await.unwrap();
    cluster.wait_for_state(&s, "n2", ReplicaState::Active).await;
    cluster.wait_for_no_markers(&s).await;
    cluster.wait_for_offset(&s, "n2", receipt.offset).await;

    cluster.stop().await;
}
