//! Log replay: reconstructing a shard's pending jobs from its durable log.
//!
//! Recovery is a pure function of the log - no checkpoint exists. Each
//! shard covers a bounded time range, so its lifetime log is bounded and a
//! full-range scan is acceptable.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, info};

use crate::job::{DurableJob, JobOperation, JobOperationKind};
use crate::job_shard::{JobShard, JobShardError};

impl JobShard {
    /// Scan the shard log from the beginning and fold every operation, in
    /// log order, into the in-memory job index.
    pub async fn initialize(&self) -> Result<(), JobShardError> {
        info!(shard = %self.id(), "replaying shard log");
        let started = Instant::now();

        let entries = self.store.scan_all(&self.log_key).await?;
        let mut acc = ReplayAccumulator::default();
        for entry in &entries {
            let op = self.codec.decode(&entry.payload)?;
            acc.apply(op);
        }

        let jobs = acc.into_jobs(self.id());
        let job_count = jobs.len();
        for (job, retry_count) in jobs {
            self.index.enqueue_job(job, retry_count);
        }

        info!(
            shard = %self.id(),
            entries = entries.len(),
            jobs = job_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "replay complete"
        );
        Ok(())
    }
}

#[derive(Default)]
struct RetryState {
    count: u32,
    due_time_ms: Option<i64>,
}

/// Folds an ordered operation sequence into the surviving job set.
///
/// - `Add` installs or overwrites the job, including re-creating an id that
///   was removed earlier in the log
/// - `Remove` purges the id and suppresses any stale `Retry` that follows
///   without an intervening `Add`
/// - `Retry` accumulates onto an outstanding `Add`, keeping the latest due
///   time
#[derive(Default)]
pub(crate) struct ReplayAccumulator {
    added: HashMap<String, JobOperation>,
    deleted: HashSet<String>,
    retries: HashMap<String, RetryState>,
}

impl ReplayAccumulator {
    pub(crate) fn apply(&mut self, op: JobOperation) {
        match op.kind {
            JobOperationKind::Add => {
                self.added.insert(op.id.clone(), op);
            }
            JobOperationKind::Remove => {
                self.added.remove(&op.id);
                self.retries.remove(&op.id);
                self.deleted.insert(op.id);
            }
            JobOperationKind::Retry => {
                if self.deleted.contains(&op.id) || !self.added.contains_key(&op.id) {
                    debug!(job = %op.id, "ignoring stale retry during replay");
                    return;
                }
                let state = self.retries.entry(op.id).or_default();
                state.count += 1;
                state.due_time_ms = op.due_time_ms;
            }
        }
    }

    /// Surviving jobs with their accumulated retry counts. The due time is
    /// the latest retry's, falling back to the original add's.
    pub(crate) fn into_jobs(mut self, shard_id: &str) -> Vec<(DurableJob, u32)> {
        let mut jobs = Vec::with_capacity(self.added.len());
        for (id, add) in self.added.drain() {
            let retry = self.retries.remove(&id).unwrap_or_default();
            let due_time_ms = retry
                .due_time_ms
                .or(add.due_time_ms)
                .unwrap_or_default();
            let job = DurableJob {
                id,
                name: add.name.unwrap_or_default(),
                due_time_ms,
                target_id: add.target_id,
                shard_id: shard_id.to_string(),
                metadata: add.metadata.unwrap_or_default(),
                retry_count: retry.count,
            };
            jobs.push((job, retry.count));
        }
        jobs
    }
}
