//! The background batching committer.
//!
//! One writer task per shard is the sole consumer of the shard's write
//! queue. Job operations are coalesced into atomic multi-entry log appends;
//! metadata operations commit alone through CAS and never ride inside a job
//! batch. Collection of a job batch stops early when a metadata operation is
//! popped, so the two kinds stay in enqueue order relative to each other.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::codec::EventCodec;
use crate::job::JobOperation;
use crate::job_shard::{JobShardError, MetaState};
use crate::settings::ShardWriterConfig;
use crate::store::StoreOps;

type Completion = oneshot::Sender<Result<(), JobShardError>>;

/// One unit of the shard's write queue. Transient: created per persist call,
/// gone once its completion resolves.
pub(crate) enum StorageOperation {
    AppendJob {
        op: JobOperation,
        done: Completion,
    },
    UpdateMetadata {
        fields: Vec<(String, String)>,
        expected_version: u64,
        done: Completion,
    },
}

pub(crate) struct WriterContext {
    pub shard_id: String,
    pub log_key: String,
    pub meta_key: String,
    pub store: Arc<dyn StoreOps>,
    pub codec: Arc<dyn EventCodec>,
    pub meta: Arc<Mutex<MetaState>>,
    pub cfg: ShardWriterConfig,
}

pub(crate) async fn run(
    ctx: WriterContext,
    mut rx: mpsc::UnboundedReceiver<StorageOperation>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let op = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            maybe = rx.recv() => match maybe {
                Some(op) => op,
                None => break,
            },
        };

        match op {
            StorageOperation::UpdateMetadata {
                fields,
                expected_version,
                done,
            } => handle_metadata(&ctx, fields, expected_version, done).await,
            StorageOperation::AppendJob { op, done } => {
                let mut batch = vec![(op, done)];
                let mut pending_meta = None;
                collect_ready(&mut rx, &mut batch, &mut pending_meta, ctx.cfg.max_batch_size);

                // Below the minimum batch size, linger briefly to coalesce
                // more operations - unless a metadata op is already waiting
                // behind us or shutdown has begun.
                if batch.len() < ctx.cfg.min_batch_size
                    && pending_meta.is_none()
                    && !*shutdown.borrow()
                {
                    tokio::select! {
                        _ = tokio::time::sleep(ctx.cfg.flush_interval()) => {}
                        _ = shutdown.changed() => {}
                    }
                    collect_ready(&mut rx, &mut batch, &mut pending_meta, ctx.cfg.max_batch_size);
                }

                flush_batch(&ctx, batch).await;

                if let Some((fields, expected_version, done)) = pending_meta {
                    handle_metadata(&ctx, fields, expected_version, done).await;
                }
            }
        }
    }

    // Whatever is still queued was never committed; resolve it as canceled
    // rather than leaving callers hanging.
    rx.close();
    let mut canceled = 0usize;
    while let Ok(op) = rx.try_recv() {
        let done = match op {
            StorageOperation::AppendJob { done, .. } => done,
            StorageOperation::UpdateMetadata { done, .. } => done,
        };
        let _ = done.send(Err(JobShardError::Canceled));
        canceled += 1;
    }
    if canceled > 0 {
        debug!(shard = %ctx.shard_id, canceled, "canceled queued operations at shutdown");
    }
}

/// Pull already-queued job operations into the batch, stopping at the size
/// cap, an empty queue, or the first metadata operation (which must not
/// cross into the batch).
fn collect_ready(
    rx: &mut mpsc::UnboundedReceiver<StorageOperation>,
    batch: &mut Vec<(JobOperation, Completion)>,
    pending_meta: &mut Option<(Vec<(String, String)>, u64, Completion)>,
    max_batch_size: usize,
) {
    while batch.len() < max_batch_size {
        match rx.try_recv() {
            Ok(StorageOperation::AppendJob { op, done }) => batch.push((op, done)),
            Ok(StorageOperation::UpdateMetadata {
                fields,
                expected_version,
                done,
            }) => {
                *pending_meta = Some((fields, expected_version, done));
                break;
            }
            Err(_) => break,
        }
    }
}

/// Commit one batch with a single atomic append; every completion in the
/// batch resolves with the same outcome.
///
/// Operations whose caller already gave up (dropped completion) are skipped
/// before the append: a persist canceled while still queued is never
/// committed.
async fn flush_batch(ctx: &WriterContext, batch: Vec<(JobOperation, Completion)>) {
    let batch: Vec<(JobOperation, Completion)> = batch
        .into_iter()
        .filter(|(_, done)| !done.is_closed())
        .collect();
    if batch.is_empty() {
        return;
    }

    let mut payloads = Vec::with_capacity(batch.len());
    for (op, _) in &batch {
        match ctx.codec.encode(op) {
            Ok(bytes) => payloads.push(Bytes::from(bytes)),
            Err(e) => {
                warn!(shard = %ctx.shard_id, error = %e, "failed to encode job operation, rejecting batch");
                let err = JobShardError::Codec(e);
                for (_, done) in batch {
                    let _ = done.send(Err(err.clone()));
                }
                return;
            }
        }
    }

    debug!(shard = %ctx.shard_id, count = batch.len(), "flushing job batch");
    match ctx.store.append_batch(&ctx.log_key, payloads).await {
        Ok(_) => {
            for (_, done) in batch {
                let _ = done.send(Ok(()));
            }
        }
        Err(e) => {
            warn!(shard = %ctx.shard_id, count = batch.len(), error = %e, "batch append failed");
            let err = JobShardError::Store(e);
            for (_, done) in batch {
                let _ = done.send(Err(err.clone()));
            }
        }
    }
}

/// Commit a metadata change alone through CAS, updating the in-memory
/// mirror on success.
async fn handle_metadata(
    ctx: &WriterContext,
    fields: Vec<(String, String)>,
    expected_version: u64,
    done: Completion,
) {
    if done.is_closed() {
        return;
    }
    let new_version = expected_version + 1;
    let result = ctx
        .store
        .update_metadata(&ctx.meta_key, expected_version, new_version, &fields)
        .await;
    match result {
        Ok(true) => {
            let mut meta = ctx.meta.lock().unwrap();
            for (k, v) in &fields {
                meta.fields.insert(k.clone(), v.clone());
            }
            meta.version = new_version;
            drop(meta);
            let _ = done.send(Ok(()));
        }
        Ok(false) => {
            debug!(
                shard = %ctx.shard_id,
                expected = expected_version,
                "metadata update lost a version race"
            );
            let _ = done.send(Err(JobShardError::MetadataConflict(ctx.shard_id.clone())));
        }
        Err(e) => {
            warn!(shard = %ctx.shard_id, error = %e, "metadata update failed");
            let _ = done.send(Err(JobShardError::Store(e)));
        }
    }
}
