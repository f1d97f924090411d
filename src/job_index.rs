//! The in-memory scheduling collaborator consumed by a shard.
//!
//! A shard owns one job index: replay reinstates surviving jobs into it, and
//! the manager reads its count to decide between releasing and deleting a
//! shard at unregister time. The concrete due-time queue lives outside this
//! crate; `InMemoryJobIndex` is the reference implementation used for
//! single-node operation and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use crate::job::DurableJob;

#[derive(Debug, Clone, Error)]
pub enum JobIndexError {
    #[error("job index error: {0}")]
    Scheduler(String),
}

/// The surface a shard requires from its scheduling index.
#[async_trait]
pub trait JobIndex: Send + Sync {
    /// Install a replayed or newly persisted job with its accumulated retry
    /// count.
    fn enqueue_job(&self, job: DurableJob, retry_count: u32);

    /// Number of pending jobs currently held.
    async fn job_count(&self) -> usize;

    /// Mark the shard as closed for new job placements. A freshly reclaimed
    /// shard only finishes serving what it already holds.
    async fn mark_complete(&self) -> Result<(), JobIndexError>;
}

/// Supplies one index per shard, so the manager can construct shards it
/// discovers at assignment time.
pub trait JobIndexProvider: Send + Sync {
    fn index_for(&self, shard_id: &str) -> Arc<dyn JobIndex>;
}

/// Due-time ordered in-memory index.
pub struct InMemoryJobIndex {
    jobs: Mutex<BTreeMap<(i64, String), DurableJob>>,
    complete: AtomicBool,
}

impl InMemoryJobIndex {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(BTreeMap::new()),
            complete: AtomicBool::new(false),
        }
    }

    /// Pending jobs in due-time order.
    pub fn jobs(&self) -> Vec<DurableJob> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryJobIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobIndex for InMemoryJobIndex {
    fn enqueue_job(&self, job: DurableJob, retry_count: u32) {
        let mut jobs = self.jobs.lock().unwrap();
        let mut job = job;
        job.retry_count = retry_count;
        jobs.insert((job.due_time_ms, job.id.clone()), job);
    }

    async fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    async fn mark_complete(&self) -> Result<(), JobIndexError> {
        self.complete.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Provider that retains every index it hands out, keyed by shard id, so
/// embedding code can inspect a shard's jobs after assignment.
pub struct InMemoryIndexProvider {
    created: Mutex<HashMap<String, Arc<InMemoryJobIndex>>>,
}

impl InMemoryIndexProvider {
    pub fn new() -> Self {
        Self {
            created: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, shard_id: &str) -> Option<Arc<InMemoryJobIndex>> {
        self.created.lock().unwrap().get(shard_id).cloned()
    }
}

impl Default for InMemoryIndexProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl JobIndexProvider for InMemoryIndexProvider {
    fn index_for(&self, shard_id: &str) -> Arc<dyn JobIndex> {
        let mut created = self.created.lock().unwrap();
        let index = created
            .entry(shard_id.to_string())
            .or_insert_with(|| Arc::new(InMemoryJobIndex::new()));
        Arc::clone(index) as Arc<dyn JobIndex>
    }
}
