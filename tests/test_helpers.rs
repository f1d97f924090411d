#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use timeshard::codec::JsonEventCodec;
use timeshard::job::ShardMetadata;
use timeshard::job_index::{InMemoryIndexProvider, InMemoryJobIndex, JobIndex, JobIndexProvider};
use timeshard::job_shard::JobShard;
use timeshard::keys::{shard_meta_key, shard_set_key};
use timeshard::manager::ShardManager;
use timeshard::membership::{ClusterMembership, StaticMembership};
use timeshard::settings::{ManagerConfig, ShardWriterConfig};
use timeshard::store::{MemoryStore, StoreOps};

pub const NODE_A: &str = "10.0.0.1:11811";
pub const NODE_B: &str = "10.0.0.2:11811";

// Helper: enforce a tight timeout for async tests likely to hang
#[macro_export]
macro_rules! with_timeout {
    ($ms:expr, $body:block) => {{
        tokio::time::timeout(std::time::Duration::from_millis($ms), async move { $body })
            .await
            .expect("test timed out")
    }};
}

/// Writer tuning that flushes every operation promptly.
pub fn fast_writer_cfg() -> ShardWriterConfig {
    ShardWriterConfig {
        max_batch_size: 32,
        min_batch_size: 1,
        flush_interval_ms: 5,
        stop_timeout_ms: 1_000,
    }
}

/// Writer tuning that lingers for more operations before flushing.
pub fn batching_writer_cfg(min_batch_size: usize, flush_interval_ms: u64) -> ShardWriterConfig {
    ShardWriterConfig {
        max_batch_size: 32,
        min_batch_size,
        flush_interval_ms,
        stop_timeout_ms: 1_000,
    }
}

pub fn manager_on(
    node: &str,
    store: &Arc<MemoryStore>,
    membership: &Arc<StaticMembership>,
    indexes: &Arc<InMemoryIndexProvider>,
) -> ShardManager {
    ShardManager::new(
        node,
        Arc::clone(store) as Arc<dyn StoreOps>,
        Arc::clone(membership) as Arc<dyn ClusterMembership>,
        Arc::clone(indexes) as Arc<dyn JobIndexProvider>,
        Arc::new(JsonEventCodec),
        fast_writer_cfg(),
        ManagerConfig::default(),
    )
}

pub fn test_metadata(owner: &str, version: u64) -> ShardMetadata {
    ShardMetadata {
        owner: if owner.is_empty() {
            None
        } else {
            Some(owner.to_string())
        },
        membership_version: 1,
        min_due_time_ms: 0,
        max_due_time_ms: i64::MAX,
        version,
        custom: HashMap::new(),
    }
}

/// Register a shard's metadata in the store and open a live `JobShard` over
/// it, bypassing the manager. For writer- and replay-level tests.
pub async fn create_raw_shard(
    store: &Arc<MemoryStore>,
    shard_id: &str,
    cfg: ShardWriterConfig,
) -> (Arc<JobShard>, Arc<InMemoryJobIndex>) {
    let meta = test_metadata(NODE_A, 1);
    let created = store
        .create_shard(
            &shard_meta_key(shard_id),
            &shard_set_key(),
            shard_id,
            &meta.to_fields(),
        )
        .await
        .expect("create shard metadata");
    assert!(created, "shard id {} already registered", shard_id);
    open_raw_shard(store, shard_id, meta, cfg)
}

/// Re-open a shard over existing store state, as a fresh process would after
/// a crash. Does not replay; call `initialize` on the result.
pub async fn reopen_raw_shard(
    store: &Arc<MemoryStore>,
    shard_id: &str,
) -> (Arc<JobShard>, Arc<InMemoryJobIndex>) {
    let fields = store
        .get_all_fields(&shard_meta_key(shard_id))
        .await
        .expect("read metadata");
    let meta = ShardMetadata::from_fields(&fields).expect("parse metadata");
    open_raw_shard(store, shard_id, meta, fast_writer_cfg())
}

fn open_raw_shard(
    store: &Arc<MemoryStore>,
    shard_id: &str,
    meta: ShardMetadata,
    cfg: ShardWriterConfig,
) -> (Arc<JobShard>, Arc<InMemoryJobIndex>) {
    let index = Arc::new(InMemoryJobIndex::new());
    let shard = JobShard::open(
        shard_id.to_string(),
        meta,
        Arc::clone(store) as Arc<dyn StoreOps>,
        Arc::new(JsonEventCodec),
        Arc::clone(&index) as Arc<dyn JobIndex>,
        &cfg,
    );
    (shard, index)
}
