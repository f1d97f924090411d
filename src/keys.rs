//! Key construction for the shared log+KV store.
//!
//! Every component addresses the store through these helpers so the key
//! layout lives in exactly one place.

/// The registry set holding every known shard id.
pub fn shard_set_key() -> String {
    "shards/registry".to_string()
}

/// The metadata hash for a shard (ownership, time range, version counter).
pub fn shard_meta_key(shard_id: &str) -> String {
    format!("shards/{}/meta", shard_id)
}

/// The append-only job-operation log for a shard.
pub fn shard_log_key(shard_id: &str) -> String {
    format!("shards/{}/log", shard_id)
}

/// The ownership lease key for a shard.
pub fn shard_lease_key(shard_id: &str) -> String {
    format!("shards/{}/lease", shard_id)
}
