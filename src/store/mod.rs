//! Atomic primitives over the shared log+KV store.
//!
//! Every mutation that affects correctness — ownership, metadata, and job
//! events — goes through a conditional or atomically-batched primitive, so
//! two racing owners or a crash mid-write can never leave the metadata or a
//! log half-applied. Available backends:
//!
//! - `memory`: single-process store for local development and tests
//! - `etcd`: distributed store over etcd transactions

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::settings::{StoreBackend, StoreConfig};

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;

#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;
pub use memory::MemoryStore;

/// Error type for store operations.
///
/// CAS mismatches are *not* errors: the conditional primitives report them
/// as `false` so callers can treat races as expected outcomes.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    ConnectionFailed(String),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("append sequence contention on {0}, exceeded max retries")]
    AppendContention(String),
}

/// One entry of a shard's append-only log: the backend-assigned entry id and
/// the single `payload` field carrying the serialized job operation.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: String,
    pub payload: Bytes,
}

/// The minimal atomic operations the rest of the system is built on.
///
/// Each call is indivisible from the caller's perspective; backends implement
/// them as single transactions against the shared store.
#[async_trait]
pub trait StoreOps: Send + Sync {
    /// Create a shard's metadata hash and add its id to the registry set in
    /// one atomic step. Returns `false` (not an error) if `meta_key` already
    /// exists.
    async fn create_shard(
        &self,
        meta_key: &str,
        set_key: &str,
        shard_id: &str,
        fields: &[(String, String)],
    ) -> Result<bool, StoreError>;

    /// CAS on the stored version field: on match, set the owner and
    /// membership version and bump the version; on mismatch, no-op and
    /// return `false`.
    async fn try_take_ownership(
        &self,
        meta_key: &str,
        expected_version: u64,
        new_owner: &str,
        membership_version: i64,
    ) -> Result<bool, StoreError>;

    /// Same CAS discipline as ownership taking; clears the owner and bumps
    /// the version.
    async fn release_ownership(
        &self,
        meta_key: &str,
        expected_version: u64,
    ) -> Result<bool, StoreError>;

    /// CAS-guarded merge of arbitrary metadata fields, setting the version
    /// counter to `new_version` on success.
    async fn update_metadata(
        &self,
        meta_key: &str,
        expected_version: u64,
        new_version: u64,
        fields: &[(String, String)],
    ) -> Result<bool, StoreError>;

    /// Append every payload to the log in order, all-or-nothing, returning
    /// the assigned entry ids. A partial failure surfaces as an error, never
    /// as a partial success.
    async fn append_batch(
        &self,
        log_key: &str,
        payloads: Vec<Bytes>,
    ) -> Result<Vec<String>, StoreError>;

    /// Full-range ordered replay of a log. A missing log is an empty result,
    /// never an error.
    async fn scan_all(&self, log_key: &str) -> Result<Vec<LogEntry>, StoreError>;

    async fn get_all_fields(&self, meta_key: &str) -> Result<HashMap<String, String>, StoreError>;

    async fn set_members(&self, set_key: &str) -> Result<Vec<String>, StoreError>;

    async fn remove_set_member(&self, set_key: &str, member: &str) -> Result<(), StoreError>;

    async fn delete_keys(&self, keys: &[String]) -> Result<(), StoreError>;
}

/// Build a store from configuration.
pub async fn create_store(cfg: &StoreConfig) -> Result<Arc<dyn StoreOps>, StoreError> {
    match cfg.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "etcd")]
        StoreBackend::Etcd => {
            let store = EtcdStore::connect(&cfg.endpoints, &cfg.cluster_prefix).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "etcd"))]
        StoreBackend::Etcd => Err(StoreError::Backend(
            "etcd backend not compiled in (enable the `etcd` feature)".to_string(),
        )),
    }
}
