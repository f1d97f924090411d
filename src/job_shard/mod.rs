//! Job shard - one time-partitioned unit of durable job storage.
//!
//! A shard owns an append-only log of job operations plus an in-memory job
//! index rebuilt from that log. Concurrent callers persist operations
//! through a single write queue; one background writer per shard drains the
//! queue, batches consecutive job events into atomic log appends, and
//! commits metadata changes through CAS. Submodules:
//!
//! - `replay`: log replay and the fold that reconstructs pending jobs
//! - `writer`: the background batching committer

mod replay;
mod writer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::codec::{CodecError, EventCodec};
use crate::job::{JobOperation, ShardMetadata};
use crate::job_index::{JobIndex, JobIndexError};
use crate::keys::{shard_log_key, shard_meta_key};
use crate::settings::ShardWriterConfig;
use crate::store::{StoreError, StoreOps};
use writer::{StorageOperation, WriterContext};

/// Current epoch time in milliseconds.
pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, Clone, Error)]
pub enum JobShardError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Index(#[from] JobIndexError),
    #[error("metadata version conflict on shard {0}")]
    MetadataConflict(String),
    #[error("shard {0} is shutting down")]
    ShuttingDown(String),
    #[error("operation canceled during shard shutdown")]
    Canceled,
}

/// In-memory mirror of the shard's metadata hash, kept in step with every
/// successful CAS write.
pub(crate) struct MetaState {
    pub fields: HashMap<String, String>,
    pub version: u64,
}

/// A single time-partitioned job shard.
///
/// Constructed either fresh (after `create_shard`) or reclaimed (after a
/// successful ownership CAS); in both cases [`initialize`](Self::initialize)
/// must run before the shard serves callers.
pub struct JobShard {
    id: String,
    start_time_ms: i64,
    end_time_ms: i64,
    log_key: String,
    store: Arc<dyn StoreOps>,
    codec: Arc<dyn EventCodec>,
    index: Arc<dyn JobIndex>,
    meta: Arc<Mutex<MetaState>>,
    tx: mpsc::UnboundedSender<StorageOperation>,
    shutdown_tx: watch::Sender<bool>,
    writer: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    stop_timeout: Duration,
    closed: AtomicBool,
}

impl JobShard {
    /// Open a shard and start its background writer.
    pub fn open(
        id: String,
        metadata: ShardMetadata,
        store: Arc<dyn StoreOps>,
        codec: Arc<dyn EventCodec>,
        index: Arc<dyn JobIndex>,
        cfg: &ShardWriterConfig,
    ) -> Arc<Self> {
        let log_key = shard_log_key(&id);
        let meta_key = shard_meta_key(&id);
        let meta = Arc::new(Mutex::new(MetaState {
            fields: metadata.field_map(),
            version: metadata.version,
        }));

        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = WriterContext {
            shard_id: id.clone(),
            log_key: log_key.clone(),
            meta_key,
            store: Arc::clone(&store),
            codec: Arc::clone(&codec),
            meta: Arc::clone(&meta),
            cfg: cfg.clone(),
        };
        let handle = tokio::spawn(writer::run(ctx, rx, shutdown_rx));

        Arc::new(Self {
            id,
            start_time_ms: metadata.min_due_time_ms,
            end_time_ms: metadata.max_due_time_ms,
            log_key,
            store,
            codec,
            index,
            meta,
            tx,
            shutdown_tx,
            writer: tokio::sync::Mutex::new(Some(handle)),
            stop_timeout: cfg.stop_timeout(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start_time_ms(&self) -> i64 {
        self.start_time_ms
    }

    pub fn end_time_ms(&self) -> i64 {
        self.end_time_ms
    }

    pub fn index(&self) -> &Arc<dyn JobIndex> {
        &self.index
    }

    /// The version last observed on a successful metadata write; the
    /// expected version for the next CAS against this shard.
    pub fn metadata_version(&self) -> u64 {
        self.meta.lock().unwrap().version
    }

    pub fn metadata(&self) -> HashMap<String, String> {
        self.meta.lock().unwrap().fields.clone()
    }

    pub fn metadata_field(&self, field: &str) -> Option<String> {
        self.meta.lock().unwrap().fields.get(field).cloned()
    }

    /// Durably record a new job. Resolves once the operation is committed to
    /// the shard log.
    pub async fn persist_add_job(
        &self,
        job_id: &str,
        name: &str,
        due_time_ms: i64,
        target_id: Option<String>,
        metadata: Option<HashMap<String, String>>,
    ) -> Result<(), JobShardError> {
        self.submit_job_op(JobOperation::add(
            job_id, name, due_time_ms, target_id, metadata,
        ))
        .await
    }

    /// Durably record a job's removal.
    pub async fn persist_remove_job(&self, job_id: &str) -> Result<(), JobShardError> {
        self.submit_job_op(JobOperation::remove(job_id)).await
    }

    /// Durably record a retry: bumps the job's retry count and moves its due
    /// time.
    pub async fn persist_retry_job(
        &self,
        job_id: &str,
        due_time_ms: i64,
    ) -> Result<(), JobShardError> {
        self.submit_job_op(JobOperation::retry(job_id, due_time_ms))
            .await
    }

    /// CAS-update custom metadata fields. The expected version is captured
    /// here; a concurrent writer winning the race surfaces as
    /// [`JobShardError::MetadataConflict`], to be retried after re-reading
    /// [`metadata_version`](Self::metadata_version).
    pub async fn update_metadata(
        &self,
        fields: Vec<(String, String)>,
    ) -> Result<(), JobShardError> {
        let expected_version = self.metadata_version();
        let (done, rx) = oneshot::channel();
        self.submit(StorageOperation::UpdateMetadata {
            fields,
            expected_version,
            done,
        })?;
        rx.await.map_err(|_| JobShardError::Canceled)?
    }

    async fn submit_job_op(&self, op: JobOperation) -> Result<(), JobShardError> {
        debug!(shard = %self.id, job = %op.id, kind = ?op.kind, "persisting job operation");
        let (done, rx) = oneshot::channel();
        self.submit(StorageOperation::AppendJob { op, done })?;
        rx.await.map_err(|_| JobShardError::Canceled)?
    }

    fn submit(&self, op: StorageOperation) -> Result<(), JobShardError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(JobShardError::ShuttingDown(self.id.clone()));
        }
        self.tx
            .send(op)
            .map_err(|_| JobShardError::ShuttingDown(self.id.clone()))
    }

    /// Stop the background writer. Idempotent; queued operations that were
    /// not yet committed resolve as canceled, and new persist calls are
    /// rejected from this point on.
    pub async fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        let handle = self.writer.lock().await.take();
        if let Some(handle) = handle {
            debug!(shard = %self.id, "stopping shard writer");
            match tokio::time::timeout(self.stop_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(shard = %self.id, error = %e, "shard writer task panicked"),
                Err(_) => {
                    warn!(shard = %self.id, timeout_ms = self.stop_timeout.as_millis() as u64, "shard writer did not stop in time")
                }
            }
        }
    }
}
