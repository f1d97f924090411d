//! Shard manager - the cluster-facing directory of job shards.
//!
//! Discovers shards through the store's registry set, claims unowned or
//! orphaned shards with conditional writes, creates fresh shards, and
//! retires shards by releasing ownership (jobs remain) or deleting them
//! outright (empty). There is no lock manager: exactly-one-owner falls out
//! of the metadata CAS protocol alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::codec::EventCodec;
use crate::job::ShardMetadata;
use crate::job_index::JobIndexProvider;
use crate::job_shard::{JobShard, JobShardError};
use crate::keys::{shard_lease_key, shard_log_key, shard_meta_key, shard_set_key};
use crate::membership::{ClusterMembership, MembershipError};
use crate::settings::{ManagerConfig, ShardWriterConfig};
use crate::store::{StoreError, StoreOps};

#[derive(Debug, Error)]
pub enum ShardManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Shard(#[from] JobShardError),
    #[error(transparent)]
    Membership(#[from] MembershipError),
    #[error("shard id collisions exhausted {0} create attempts")]
    CreateExhausted(u32),
}

pub struct ShardManager {
    node: String,
    store: Arc<dyn StoreOps>,
    membership: Arc<dyn ClusterMembership>,
    codec: Arc<dyn EventCodec>,
    indexes: Arc<dyn JobIndexProvider>,
    shards: Mutex<HashMap<String, Arc<JobShard>>>,
    shard_counter: AtomicU64,
    writer_cfg: ShardWriterConfig,
    cfg: ManagerConfig,
}

impl ShardManager {
    pub fn new(
        node: impl Into<String>,
        store: Arc<dyn StoreOps>,
        membership: Arc<dyn ClusterMembership>,
        indexes: Arc<dyn JobIndexProvider>,
        codec: Arc<dyn EventCodec>,
        writer_cfg: ShardWriterConfig,
        cfg: ManagerConfig,
    ) -> Self {
        Self {
            node: node.into(),
            store,
            membership,
            codec,
            indexes,
            shards: Mutex::new(HashMap::new()),
            shard_counter: AtomicU64::new(0),
            writer_cfg,
            cfg,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// A live shard from the local cache, if this node currently serves it.
    pub async fn cached_shard(&self, shard_id: &str) -> Option<Arc<JobShard>> {
        self.shards.lock().await.get(shard_id).cloned()
    }

    pub async fn cached_shard_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shards.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Discover and claim shards this node should own.
    ///
    /// Scans every registered shard id and claims the unowned or orphaned
    /// ones whose time range has reached `max_shard_start_time_ms`. Each
    /// newly claimed shard is replayed and marked complete before it is
    /// returned; shards this node already serves stay cached and are not
    /// re-returned. Any per-shard failure is logged and skipped so one bad
    /// shard cannot abort the whole pass.
    pub async fn assign_job_shards(
        &self,
        max_shard_start_time_ms: i64,
    ) -> Result<Vec<Arc<JobShard>>, ShardManagerError> {
        let shard_ids = self.store.set_members(&shard_set_key()).await?;
        debug!(node = %self.node, candidates = shard_ids.len(), "shard assignment pass started");

        let mut assigned = Vec::new();
        for shard_id in shard_ids {
            match self
                .try_assign_shard(&shard_id, max_shard_start_time_ms)
                .await
            {
                Ok(Some(shard)) => assigned.push(shard),
                Ok(None) => {}
                Err(e) => {
                    warn!(node = %self.node, shard = %shard_id, error = %e, "skipping shard after assignment failure")
                }
            }
        }

        info!(node = %self.node, assigned = assigned.len(), "shard assignment pass complete");
        Ok(assigned)
    }

    async fn try_assign_shard(
        &self,
        shard_id: &str,
        max_shard_start_time_ms: i64,
    ) -> Result<Option<Arc<JobShard>>, ShardManagerError> {
        let meta_key = shard_meta_key(shard_id);
        let fields = self.store.get_all_fields(&meta_key).await?;
        if fields.is_empty() {
            // Deleted under us; the registry entry is leftover garbage.
            debug!(node = %self.node, shard = %shard_id, "registry entry without metadata, removing");
            let _ = self
                .store
                .remove_set_member(&shard_set_key(), shard_id)
                .await;
            return Ok(None);
        }
        let meta = match ShardMetadata::from_fields(&fields) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(node = %self.node, shard = %shard_id, error = %e, "malformed shard metadata");
                return Ok(None);
            }
        };

        // The shard's owner was recorded against a membership view we may
        // not have seen yet; refresh before judging liveness.
        let mut snapshot = self.membership.current_snapshot();
        if meta.membership_version > snapshot.version {
            self.membership.refresh(meta.membership_version).await?;
            snapshot = self.membership.current_snapshot();
        }

        if meta.min_due_time_ms > max_shard_start_time_ms {
            return Ok(None);
        }

        if let Some(owner) = &meta.owner {
            if *owner == self.node {
                if self.shards.lock().await.contains_key(shard_id) {
                    // Already active and owned by us.
                    return Ok(None);
                }
                // Recorded as ours but not running here: a previous process
                // died without a clean unregister. Release so a later pass
                // (ours or another node's) can claim it cleanly.
                match self.store.release_ownership(&meta_key, meta.version).await {
                    Ok(true) => {
                        info!(node = %self.node, shard = %shard_id, "released stale self-owned shard")
                    }
                    Ok(false) => {
                        debug!(node = %self.node, shard = %shard_id, "stale self-ownership release lost a version race")
                    }
                    Err(e) => {
                        warn!(node = %self.node, shard = %shard_id, error = %e, "failed to release stale self-owned shard")
                    }
                }
                return Ok(None);
            }
            if snapshot.status_of(owner).is_live() {
                return Ok(None);
            }
        }

        // Orphaned: owner empty, dead, or gone from the membership view.
        let took = self
            .store
            .try_take_ownership(&meta_key, meta.version, &self.node, snapshot.version)
            .await?;
        if !took {
            debug!(node = %self.node, shard = %shard_id, "lost the ownership race");
            return Ok(None);
        }
        let claimed_version = meta.version + 1;
        info!(node = %self.node, shard = %shard_id, version = claimed_version, "claimed shard");

        let mut claimed = meta.clone();
        claimed.owner = Some(self.node.clone());
        claimed.membership_version = snapshot.version;
        claimed.version = claimed_version;
        let shard = self.open_shard(shard_id, claimed);

        let ready = match shard.initialize().await {
            Ok(()) => shard
                .index()
                .mark_complete()
                .await
                .map_err(JobShardError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = ready {
            warn!(node = %self.node, shard = %shard_id, error = %e, "replay failed after claim, releasing");
            shard.stop().await;
            match self
                .store
                .release_ownership(&meta_key, claimed_version)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(node = %self.node, shard = %shard_id, "post-failure release lost a version race")
                }
                Err(err) => {
                    warn!(node = %self.node, shard = %shard_id, error = %err, "post-failure release failed")
                }
            }
            return Ok(None);
        }

        self.shards
            .lock()
            .await
            .insert(shard_id.to_string(), Arc::clone(&shard));
        Ok(Some(shard))
    }

    /// Create a fresh, empty shard covering `[min_due_time_ms, max_due_time_ms)`.
    ///
    /// The id is derived from the time range, this node's address, and a
    /// per-manager monotonic counter; a collision with an existing id
    /// regenerates up to the configured bound.
    pub async fn create_shard(
        &self,
        min_due_time_ms: i64,
        max_due_time_ms: i64,
        custom_fields: HashMap<String, String>,
    ) -> Result<Arc<JobShard>, ShardManagerError> {
        let snapshot = self.membership.current_snapshot();

        for attempt in 0..self.cfg.max_create_attempts {
            let seq = self.shard_counter.fetch_add(1, Ordering::Relaxed) + 1;
            let shard_id = format!(
                "{}-{}-{}-{}",
                min_due_time_ms, max_due_time_ms, self.node, seq
            );
            let meta = ShardMetadata {
                owner: Some(self.node.clone()),
                membership_version: snapshot.version,
                min_due_time_ms,
                max_due_time_ms,
                version: 1,
                custom: custom_fields.clone(),
            };

            let created = self
                .store
                .create_shard(
                    &shard_meta_key(&shard_id),
                    &shard_set_key(),
                    &shard_id,
                    &meta.to_fields(),
                )
                .await?;
            if !created {
                warn!(node = %self.node, shard = %shard_id, attempt = attempt + 1, "shard id collision, regenerating");
                continue;
            }

            let shard = self.open_shard(&shard_id, meta);
            if let Err(e) = shard.initialize().await {
                shard.stop().await;
                return Err(e.into());
            }
            self.shards
                .lock()
                .await
                .insert(shard_id.clone(), Arc::clone(&shard));
            info!(node = %self.node, shard = %shard_id, "created shard");
            return Ok(shard);
        }

        Err(ShardManagerError::CreateExhausted(
            self.cfg.max_create_attempts,
        ))
    }

    /// Retire a shard this node serves.
    ///
    /// Always stops the writer first so no further mutation can land. A
    /// shard with pending jobs is released (metadata kept, owner cleared)
    /// for another node to claim later; an empty shard is deleted outright,
    /// registry entry included. Cleanup failures are logged, not
    /// propagated - an orphaned shard is reclaimed by a later assignment
    /// pass.
    pub async fn unregister_shard(
        &self,
        shard: &Arc<JobShard>,
    ) -> Result<(), ShardManagerError> {
        shard.stop().await;

        let remaining = shard.index().job_count().await;
        let meta_key = shard_meta_key(shard.id());
        if remaining > 0 {
            info!(node = %self.node, shard = %shard.id(), remaining, "releasing shard with pending jobs");
            match self
                .store
                .release_ownership(&meta_key, shard.metadata_version())
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(node = %self.node, shard = %shard.id(), "release lost a version race, leaving for reclaim")
                }
                Err(e) => {
                    warn!(node = %self.node, shard = %shard.id(), error = %e, "release failed, leaving for reclaim")
                }
            }
        } else {
            info!(node = %self.node, shard = %shard.id(), "deleting empty shard");
            let keys = [
                meta_key,
                shard_log_key(shard.id()),
                shard_lease_key(shard.id()),
            ];
            match self.store.delete_keys(&keys).await {
                Ok(()) => {
                    if let Err(e) = self
                        .store
                        .remove_set_member(&shard_set_key(), shard.id())
                        .await
                    {
                        warn!(node = %self.node, shard = %shard.id(), error = %e, "registry removal failed");
                    }
                }
                Err(e) => {
                    warn!(node = %self.node, shard = %shard.id(), error = %e, "shard deletion failed")
                }
            }
        }

        self.shards.lock().await.remove(shard.id());
        Ok(())
    }

    fn open_shard(&self, shard_id: &str, meta: ShardMetadata) -> Arc<JobShard> {
        JobShard::open(
            shard_id.to_string(),
            meta,
            Arc::clone(&self.store),
            Arc::clone(&self.codec),
            self.indexes.index_for(shard_id),
            &self.writer_cfg,
        )
    }
}
