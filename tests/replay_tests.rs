mod test_helpers;

use std::collections::HashMap;
use std::sync::Arc;

use timeshard::store::MemoryStore;

use test_helpers::{create_raw_shard, fast_writer_cfg, reopen_raw_shard};

#[tokio::test]
async fn a_crashed_shard_rebuilds_its_jobs_from_the_log() {
    let store = Arc::new(MemoryStore::new());
    let (shard, _index) = create_raw_shard(&store, "s1", fast_writer_cfg()).await;

    shard
        .persist_add_job(
            "J1",
            "send-report",
            1_000,
            Some("grain-3".to_string()),
            Some(HashMap::from([("env".to_string(), "prod".to_string())])),
        )
        .await
        .unwrap();
    shard
        .persist_add_job("J2", "cleanup", 2_000, None, None)
        .await
        .unwrap();
    shard.stop().await;

    // A new process sees only the durable log.
    let (recovered, index) = reopen_raw_shard(&store, "s1").await;
    recovered.initialize().await.expect("replay");

    let jobs = index.jobs();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].id, "J1");
    assert_eq!(jobs[0].name, "send-report");
    assert_eq!(jobs[0].due_time_ms, 1_000);
    assert_eq!(jobs[0].target_id.as_deref(), Some("grain-3"));
    assert_eq!(jobs[0].metadata.get("env").map(String::as_str), Some("prod"));
    assert_eq!(jobs[0].shard_id, "s1");
    assert_eq!(jobs[0].retry_count, 0);
    assert_eq!(jobs[1].id, "J2");

    recovered.stop().await;
}

#[tokio::test]
async fn a_removed_job_does_not_survive_replay() {
    let store = Arc::new(MemoryStore::new());
    let (shard, _index) = create_raw_shard(&store, "s1", fast_writer_cfg()).await;

    shard
        .persist_add_job("A", "demo", 1_000, None, None)
        .await
        .unwrap();
    shard.persist_retry_job("A", 2_000).await.unwrap();
    shard.persist_remove_job("A").await.unwrap();
    shard.stop().await;

    let (recovered, index) = reopen_raw_shard(&store, "s1").await;
    recovered.initialize().await.unwrap();
    assert!(index.jobs().is_empty());
    recovered.stop().await;
}

#[tokio::test]
async fn re_adding_a_removed_job_revives_it_with_the_new_due_time() {
    let store = Arc::new(MemoryStore::new());
    let (shard, _index) = create_raw_shard(&store, "s1", fast_writer_cfg()).await;

    shard
        .persist_add_job("A", "demo", 1_000, None, None)
        .await
        .unwrap();
    shard.persist_remove_job("A").await.unwrap();
    shard
        .persist_add_job("A", "demo", 3_000, None, None)
        .await
        .unwrap();
    shard.stop().await;

    let (recovered, index) = reopen_raw_shard(&store, "s1").await;
    recovered.initialize().await.unwrap();
    let jobs = index.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, "A");
    assert_eq!(jobs[0].due_time_ms, 3_000);
    recovered.stop().await;
}

#[tokio::test]
async fn retries_accumulate_count_and_latest_due_time() {
    let store = Arc::new(MemoryStore::new());
    let (shard, _index) = create_raw_shard(&store, "s1", fast_writer_cfg()).await;

    shard
        .persist_add_job("J2", "demo", 1_000, None, None)
        .await
        .unwrap();
    shard.persist_retry_job("J2", 5_000).await.unwrap();
    shard.persist_retry_job("J2", 9_000).await.unwrap();
    shard.stop().await;

    let (recovered, index) = reopen_raw_shard(&store, "s1").await;
    recovered.initialize().await.unwrap();
    let jobs = index.jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].retry_count, 2);
    assert_eq!(jobs[0].due_time_ms, 9_000);
    recovered.stop().await;
}

#[tokio::test]
async fn replay_is_deterministic_regardless_of_original_batching() {
    // The same logical sequence written with different batching granularity:
    // one at a time vs. coalesced under a slow append.
    let sequential = Arc::new(MemoryStore::new());
    let (shard, _index) = create_raw_shard(&sequential, "s1", fast_writer_cfg()).await;
    for i in 0..5 {
        shard
            .persist_add_job(&format!("J{}", i), "demo", i * 100, None, None)
            .await
            .unwrap();
    }
    shard.persist_remove_job("J2").await.unwrap();
    shard.persist_retry_job("J4", 9_000).await.unwrap();
    shard.stop().await;

    let coalesced = Arc::new(MemoryStore::new());
    let (shard, _index) = create_raw_shard(&coalesced, "s1", fast_writer_cfg()).await;
    coalesced.set_append_delay(std::time::Duration::from_millis(20));
    let all = async {
        tokio::join!(
            shard.persist_add_job("J0", "demo", 0, None, None),
            shard.persist_add_job("J1", "demo", 100, None, None),
            shard.persist_add_job("J2", "demo", 200, None, None),
            shard.persist_add_job("J3", "demo", 300, None, None),
            shard.persist_add_job("J4", "demo", 400, None, None),
            shard.persist_remove_job("J2"),
            shard.persist_retry_job("J4", 9_000),
        )
    };
    let (a, b, c, d, e, f, g) = all.await;
    for result in [a, b, c, d, e, f, g] {
        result.unwrap();
    }
    shard.stop().await;

    let (first, first_index) = reopen_raw_shard(&sequential, "s1").await;
    first.initialize().await.unwrap();
    let (second, second_index) = reopen_raw_shard(&coalesced, "s1").await;
    second.initialize().await.unwrap();

    assert_eq!(first_index.jobs(), second_index.jobs());
    assert_eq!(first_index.jobs().len(), 4);

    // Replaying the same log a second time yields the identical job set.
    let (again, again_index) = reopen_raw_shard(&sequential, "s1").await;
    again.initialize().await.unwrap();
    assert_eq!(first_index.jobs(), again_index.jobs());

    first.stop().await;
    second.stop().await;
    again.stop().await;
}
