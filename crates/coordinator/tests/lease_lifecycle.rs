use coordinator::{Coordinator, CoordinatorConfig, Lease};
use std::sync::Arc;
use std::time::Duration;
use streams::{Checkpoint, Error, HashRange, Shard};
use test_support::{MemoryLeaseStore, MemoryTransport};
use tokio_util::sync::CancellationToken;

fn config(worker_id: &str) -> CoordinatorConfig {
    CoordinatorConfig {
        worker_id: worker_id.to_string(),
        stream_id: "stream-1".to_string(),
        shard_sync_interval: Duration::from_secs(60),
        assignment_interval: Duration::from_secs(1),
        renewal_interval: Duration::from_secs(10),
        steal_after: Duration::from_secs(30),
        auditor_interval: Duration::from_secs(5),
        auditor_confidence: 3,
    }
}

fn shard(shard_id: &str, parents: &[&str]) -> Shard {
    Shard {
        shard_id: shard_id.to_string(),
        parent_shard_ids: parents.iter().map(|parent| parent.to_string()).collect(),
        hash_range: HashRange {
            start: i64::MIN,
            end: i64::MAX,
        },
    }
}

#[tokio::test(start_paused = true)]
async fn discovers_claims_and_releases() {
    let transport = MemoryTransport::new("stream-1");
    transport.add_shard(shard("s-0", &[]), true);
    let store = Arc::new(MemoryLeaseStore::new());

    let (coordinator, mut assignments) =
        Coordinator::new(config("w-1"), transport.clone(), store.clone());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(coordinator.run(cancel.clone()));

    tokio::time::sleep(Duration::from_secs(3)).await;
    let assignment = assignments.try_recv().expect("lease should be claimed");
    assert_eq!(assignment.shard_id, "s-0");
    assert_eq!(assignment.checkpoint, Checkpoint::TrimHorizon);
    assert!(!assignment.lease_lost.is_cancelled());

    let lease = &store.leases()[0];
    assert_eq!(lease.owner.as_deref(), Some("w-1"));
    assert_eq!(lease.counter, 1);
    assert_eq!(lease.owner_switches_since_checkpoint, 1);

    cancel.cancel();
    task.await.unwrap();

    let lease = &store.leases()[0];
    assert_eq!(lease.owner, None);
    assert_eq!(lease.counter, 2);
}

#[tokio::test(start_paused = true)]
async fn renewal_keeps_the_counter_moving() {
    let transport = MemoryTransport::new("stream-1");
    transport.add_shard(shard("s-0", &[]), true);
    let store = Arc::new(MemoryLeaseStore::new());

    let (coordinator, mut assignments) =
        Coordinator::new(config("w-1"), transport.clone(), store.clone());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(coordinator.run(cancel.clone()));

    tokio::time::sleep(Duration::from_secs(2)).await;
    let _assignment = assignments.try_recv().unwrap();
    let counter_after_claim = store.leases()[0].counter;

    tokio::time::sleep(Duration::from_secs(25)).await;
    let lease = &store.leases()[0];
    assert!(
        lease.counter > counter_after_claim,
        "renewals should have advanced the counter: {lease:?}"
    );
    assert_eq!(lease.owner.as_deref(), Some("w-1"));
    assert!(lease.last_renewal_time.is_some());

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stale_leases_are_stolen_and_resume_from_their_checkpoint() {
    let transport = MemoryTransport::new("stream-1");
    transport.add_shard(shard("s-1", &[]), true);
    let store = Arc::new(MemoryLeaseStore::new());

    // W1 held this lease at checkpoint 0200 and stopped renewing.
    store.seed(Lease {
        shard_id: "s-1".to_string(),
        owner: Some("w-1".to_string()),
        counter: 5,
        checkpoint: Checkpoint::sequence("0200"),
        owner_switches_since_checkpoint: 0,
        parent_shard_ids: Vec::new(),
        last_renewal_time: None,
    });

    let (coordinator, mut assignments) =
        Coordinator::new(config("w-2"), transport.clone(), store.clone());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(coordinator.run(cancel.clone()));

    // Before the steal-after window elapses the lease is untouchable.
    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(assignments.try_recv().is_err());

    tokio::time::sleep(Duration::from_secs(4)).await;
    let assignment = assignments.try_recv().expect("stale lease should be stolen");
    assert_eq!(assignment.shard_id, "s-1");
    // Progress is preserved: W2 resumes exactly from W1's checkpoint.
    assert_eq!(assignment.checkpoint, Checkpoint::sequence("0200"));

    let lease = &store.leases()[0];
    assert_eq!(lease.owner.as_deref(), Some("w-2"));
    assert_eq!(lease.counter, 6);
    assert_eq!(lease.owner_switches_since_checkpoint, 1);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn children_wait_for_the_auditor_to_delete_the_drained_parent() {
    let transport = MemoryTransport::new("stream-1");
    // The parent has expired from enumeration; only its children remain.
    transport.add_shard(shard("c-1", &["p-0"]), true);
    transport.add_shard(shard("c-2", &["p-0"]), true);

    let store = Arc::new(MemoryLeaseStore::new());
    store.seed(Lease {
        shard_id: "p-0".to_string(),
        owner: None,
        counter: 3,
        checkpoint: Checkpoint::ShardEnd,
        owner_switches_since_checkpoint: 0,
        parent_shard_ids: Vec::new(),
        last_renewal_time: None,
    });

    let (coordinator, mut assignments) =
        Coordinator::new(config("w-1"), transport.clone(), store.clone());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(coordinator.run(cancel.clone()));

    // While the drained parent lease exists, neither child is claimable.
    tokio::time::sleep(Duration::from_secs(9)).await;
    assert!(assignments.try_recv().is_err());
    assert!(store
        .leases()
        .iter()
        .any(|lease| lease.shard_id == "p-0"));

    // Three consistent auditor observations delete the parent; the
    // children then become claimable.
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(store
        .leases()
        .iter()
        .all(|lease| lease.shard_id != "p-0"));

    let mut claimed = vec![
        assignments.try_recv().expect("first child claimed").shard_id,
        assignments.try_recv().expect("second child claimed").shard_id,
    ];
    claimed.sort();
    assert_eq!(claimed, vec!["c-1", "c-2"]);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn drained_parents_are_not_recreated_while_still_enumerated() {
    let transport = MemoryTransport::new("stream-1");
    // The parent is still within the retention window, so it stays in the
    // enumeration alongside its children.
    transport.add_shard(shard("p-0", &[]), false);
    transport.add_shard(shard("c-1", &["p-0"]), true);
    transport.add_shard(shard("c-2", &["p-0"]), true);

    let store = Arc::new(MemoryLeaseStore::new());
    store.seed(Lease {
        shard_id: "p-0".to_string(),
        owner: None,
        counter: 3,
        checkpoint: Checkpoint::ShardEnd,
        owner_switches_since_checkpoint: 0,
        parent_shard_ids: Vec::new(),
        last_renewal_time: None,
    });

    let (coordinator, mut assignments) =
        Coordinator::new(config("w-1"), transport.clone(), store.clone());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(coordinator.run(cancel.clone()));

    // Once the auditor deletes the drained parent, later discovery passes
    // must not resurrect it: its children already hold leases, and a fresh
    // parent lease would replay the shard and block them again.
    tokio::time::sleep(Duration::from_secs(70)).await;
    assert!(store.leases().iter().all(|lease| lease.shard_id != "p-0"));

    let mut claimed = vec![
        assignments.try_recv().expect("first child claimed").shard_id,
        assignments.try_recv().expect("second child claimed").shard_id,
    ];
    claimed.sort();
    assert_eq!(claimed, vec!["c-1", "c-2"]);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn completed_leases_are_never_claimed() {
    let transport = MemoryTransport::new("stream-1");
    transport.add_shard(shard("s-0", &[]), true);
    let store = Arc::new(MemoryLeaseStore::new());
    store.seed(Lease {
        shard_id: "s-0".to_string(),
        owner: None,
        counter: 9,
        checkpoint: Checkpoint::ShardEnd,
        owner_switches_since_checkpoint: 0,
        parent_shard_ids: Vec::new(),
        last_renewal_time: None,
    });

    let (coordinator, mut assignments) =
        Coordinator::new(config("w-1"), transport.clone(), store.clone());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(coordinator.run(cancel.clone()));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(assignments.try_recv().is_err());

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn checkpoint_advance_is_monotonic_idempotent_and_guarded() {
    let transport = MemoryTransport::new("stream-1");
    transport.add_shard(shard("s-0", &[]), true);
    let store = Arc::new(MemoryLeaseStore::new());

    let (coordinator, mut assignments) =
        Coordinator::new(config("w-1"), transport.clone(), store.clone());
    let handle = coordinator.handle();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(coordinator.run(cancel.clone()));

    tokio::time::sleep(Duration::from_secs(2)).await;
    let assignment = assignments.try_recv().unwrap();

    handle
        .advance_checkpoint("s-0", Checkpoint::sequence("0005"))
        .await
        .unwrap();
    let after_first = store.leases()[0].clone();
    assert_eq!(after_first.checkpoint, Checkpoint::sequence("0005"));

    // Idempotent re-advance: counter moves, nothing else does.
    handle
        .advance_checkpoint("s-0", Checkpoint::sequence("0005"))
        .await
        .unwrap();
    let after_second = store.leases()[0].clone();
    assert_eq!(after_second.checkpoint, Checkpoint::sequence("0005"));
    assert_eq!(after_second.counter, after_first.counter + 1);

    // Checkpoints never regress.
    let err = handle
        .advance_checkpoint("s-0", Checkpoint::sequence("0004"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Fatal(_)), "{err}");

    // Another worker taking the lease surfaces as LeaseLost and fires the
    // lease-lost signal.
    let mut stolen = store.leases()[0].clone();
    stolen.owner = Some("w-9".to_string());
    stolen.counter += 1;
    store.seed(stolen);

    let err = handle
        .advance_checkpoint("s-0", Checkpoint::sequence("0006"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LeaseLost), "{err}");
    assert!(assignment.lease_lost.is_cancelled());
    assert_eq!(handle.checkpoint("s-0").await, None);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn a_takeover_is_noticed_at_renewal() {
    let transport = MemoryTransport::new("stream-1");
    transport.add_shard(shard("s-0", &[]), true);
    let store = Arc::new(MemoryLeaseStore::new());

    let (coordinator, mut assignments) =
        Coordinator::new(config("w-1"), transport.clone(), store.clone());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(coordinator.run(cancel.clone()));

    tokio::time::sleep(Duration::from_secs(2)).await;
    let assignment = assignments.try_recv().unwrap();

    let mut stolen = store.leases()[0].clone();
    stolen.owner = Some("w-9".to_string());
    stolen.counter += 1;
    store.seed(stolen);

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(assignment.lease_lost.is_cancelled());

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn a_store_outage_beyond_steal_after_abandons_the_shard() {
    let transport = MemoryTransport::new("stream-1");
    transport.add_shard(shard("s-0", &[]), true);
    let store = Arc::new(MemoryLeaseStore::new());

    let (coordinator, mut assignments) =
        Coordinator::new(config("w-1"), transport.clone(), store.clone());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(coordinator.run(cancel.clone()));

    tokio::time::sleep(Duration::from_secs(2)).await;
    let assignment = assignments.try_recv().unwrap();

    store.fail_next(100_000);
    tokio::time::sleep(Duration::from_secs(45)).await;
    assert!(assignment.lease_lost.is_cancelled());

    cancel.cancel();
    task.await.unwrap();
}
