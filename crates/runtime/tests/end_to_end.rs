use config::{ConfigDocument, Settings};
use runtime::Scheduler;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use streams::{Checkpoint, Error, HashRange, Shard};
use test_support::{records, MemoryLeaseStore, MemoryTransport, RecordingMapper};
use tokio_util::sync::CancellationToken;

fn settings() -> Settings {
    Settings::from_config(&ConfigDocument::from_env(Default::default())).unwrap()
}

fn shard(shard_id: &str) -> Shard {
    Shard {
        shard_id: shard_id.to_string(),
        parent_shard_ids: Vec::new(),
        hash_range: HashRange {
            start: i64::MIN,
            end: i64::MAX,
        },
    }
}

fn start(
    transport: &Arc<MemoryTransport>,
    store: &Arc<MemoryLeaseStore>,
    mapper: &Arc<RecordingMapper>,
) -> (CancellationToken, tokio::task::JoinHandle<streams::Result<()>>) {
    let scheduler = Scheduler::new(
        transport.clone(),
        store.clone(),
        mapper.clone(),
        settings(),
        "stream-1".to_string(),
        "w-1".to_string(),
    );
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(scheduler.run(shutdown.clone()));
    (shutdown, task)
}

#[tokio::test(start_paused = true)]
async fn drains_a_closed_shard_and_writes_the_final_checkpoint() {
    let transport = MemoryTransport::new("stream-1");
    transport.add_shard(shard("s-0"), false);
    transport.push_records(
        "s-0",
        vec![
            records::insert("01", 0, &[("id", "text", json!("a")), ("n", "int", json!(7))]),
            records::update(
                "02",
                0,
                &[("id", "text", json!("a")), ("n", "int", json!(8))],
                &[("id", "text", json!("a")), ("n", "int", json!(7))],
            ),
            records::ttl_expiry("03", 0, &[("id", "text", json!("b"))]),
        ],
    );
    let store = Arc::new(MemoryLeaseStore::new());
    let mapper = Arc::new(RecordingMapper::new());

    let (shutdown, task) = start(&transport, &store, &mapper);
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(mapper.delivered_sequences(), vec!["01", "02", "03"]);
    assert!(mapper.initializations() >= 1);

    shutdown.cancel();
    task.await.unwrap().unwrap();

    let lease = &store.leases()[0];
    assert_eq!(lease.checkpoint, Checkpoint::ShardEnd);
    assert_eq!(lease.owner, None);
}

#[tokio::test(start_paused = true)]
async fn failed_batches_are_redelivered_without_advancing_the_checkpoint() {
    let transport = MemoryTransport::new("stream-1");
    transport.add_shard(shard("s-0"), false);
    transport.push_records(
        "s-0",
        vec![
            records::insert("01", 0, &[("id", "text", json!("a"))]),
            records::insert("02", 0, &[("id", "text", json!("b"))]),
        ],
    );
    let store = Arc::new(MemoryLeaseStore::new());
    let mapper = Arc::new(RecordingMapper::new());
    mapper.fail_next(vec![Error::TotalFailure {
        total: 2,
        messages: vec!["transport said no".to_string()],
    }]);

    let (shutdown, task) = start(&transport, &store, &mapper);
    tokio::time::sleep(Duration::from_secs(15)).await;

    // The failed delivery was re-fetched from the unadvanced checkpoint and
    // the whole batch re-delivered.
    assert_eq!(mapper.delivered_sequences(), vec!["01", "02"]);
    assert_eq!(store.leases()[0].checkpoint, Checkpoint::ShardEnd);

    shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn unknown_operations_are_skipped_but_checkpointed_past() {
    let transport = MemoryTransport::new("stream-1");
    transport.add_shard(shard("s-0"), true);
    transport.push_records(
        "s-0",
        vec![
            records::insert("01", 0, &[("id", "text", json!("a"))]),
            records::imageless("02"),
        ],
    );
    let store = Arc::new(MemoryLeaseStore::new());
    let mapper = Arc::new(RecordingMapper::new());

    let (shutdown, task) = start(&transport, &store, &mapper);
    tokio::time::sleep(Duration::from_secs(10)).await;

    // Only the decodable record reaches the mapper, but the checkpoint
    // covers the rejected one: it is never re-delivered.
    assert_eq!(mapper.delivered_sequences(), vec!["01"]);
    assert_eq!(store.leases()[0].checkpoint, Checkpoint::sequence("02"));

    shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn filtered_records_do_not_reach_the_mapper_but_are_checkpointed() {
    let transport = MemoryTransport::new("stream-1");
    transport.add_shard(shard("s-0"), true);
    transport.push_records(
        "s-0",
        vec![
            records::insert("01", 0, &[("id", "text", json!("a")), ("n", "int", json!(10))]),
            records::insert("02", 0, &[("id", "text", json!("b")), ("n", "int", json!(3))]),
            records::delete("03", 0, &[("id", "text", json!("a")), ("n", "int", json!(10))]),
        ],
    );
    let store = Arc::new(MemoryLeaseStore::new());
    let mapper = Arc::new(RecordingMapper::with_filter(
        "metadata.operation == 'INSERT' && newImage.n > 5",
    ));

    let (shutdown, task) = start(&transport, &store, &mapper);
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(mapper.delivered_sequences(), vec!["01"]);
    assert_eq!(store.leases()[0].checkpoint, Checkpoint::sequence("03"));

    shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_quiesces_processors_and_releases_leases() {
    let transport = MemoryTransport::new("stream-1");
    transport.add_shard(shard("s-0"), true);
    transport.push_records(
        "s-0",
        vec![records::insert("01", 0, &[("id", "text", json!("a"))])],
    );
    let store = Arc::new(MemoryLeaseStore::new());
    let mapper = Arc::new(RecordingMapper::new());

    let (shutdown, task) = start(&transport, &store, &mapper);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(mapper.delivered_sequences(), vec!["01"]);

    shutdown.cancel();
    task.await.unwrap().unwrap();

    let lease = &store.leases()[0];
    assert_eq!(lease.owner, None);
    assert_eq!(lease.checkpoint, Checkpoint::sequence("01"));
}
