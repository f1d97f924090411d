//! Cluster membership interface.
//!
//! The shard manager consults membership to decide whether a recorded shard
//! owner is still alive. Membership itself is an external collaborator; this
//! module defines the consumed surface plus a static implementation for
//! single-node deployments and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

/// Liveness status of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Joining,
    Active,
    ShuttingDown,
    Dead,
    /// The node is absent from the membership view.
    Unknown,
}

impl NodeStatus {
    /// A live node still counts as an owner; its shards are not reclaimable.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            NodeStatus::Joining | NodeStatus::Active | NodeStatus::ShuttingDown
        )
    }
}

/// A point-in-time view of cluster membership.
#[derive(Debug, Clone, Default)]
pub struct MembershipSnapshot {
    pub version: i64,
    statuses: HashMap<String, NodeStatus>,
}

impl MembershipSnapshot {
    pub fn new(version: i64, statuses: HashMap<String, NodeStatus>) -> Self {
        Self { version, statuses }
    }

    pub fn status_of(&self, node: &str) -> NodeStatus {
        self.statuses
            .get(node)
            .copied()
            .unwrap_or(NodeStatus::Unknown)
    }
}

#[derive(Debug, Clone, Error)]
pub enum MembershipError {
    #[error("membership refresh failed: {0}")]
    Refresh(String),
}

/// The membership surface consumed by the shard manager.
#[async_trait]
pub trait ClusterMembership: Send + Sync {
    /// The most recently observed membership view.
    fn current_snapshot(&self) -> MembershipSnapshot;

    /// Bring the local view up to at least `target_version`. Called before
    /// liveness checks when a shard's metadata references a newer membership
    /// version than the local one.
    async fn refresh(&self, target_version: i64) -> Result<(), MembershipError>;
}

/// A membership view driven by explicit updates rather than a live cluster.
///
/// `refresh` only advances the version number: there is no backing service
/// to fetch from, so statuses change when the embedding code (or a test)
/// sets them.
pub struct StaticMembership {
    snapshot: Mutex<MembershipSnapshot>,
}

impl StaticMembership {
    pub fn new(version: i64) -> Self {
        Self {
            snapshot: Mutex::new(MembershipSnapshot {
                version,
                statuses: HashMap::new(),
            }),
        }
    }

    /// A one-node cluster with the given node active at version 1.
    pub fn single_node(node: &str) -> Self {
        let membership = Self::new(1);
        membership.set_status(node, NodeStatus::Active);
        membership
    }

    pub fn set_status(&self, node: &str, status: NodeStatus) {
        let mut snapshot = self.snapshot.lock().unwrap();
        snapshot.statuses.insert(node.to_string(), status);
    }

    pub fn set_version(&self, version: i64) {
        let mut snapshot = self.snapshot.lock().unwrap();
        snapshot.version = version;
    }
}

#[async_trait]
impl ClusterMembership for StaticMembership {
    fn current_snapshot(&self) -> MembershipSnapshot {
        self.snapshot.lock().unwrap().clone()
    }

    async fn refresh(&self, target_version: i64) -> Result<(), MembershipError> {
        let mut snapshot = self.snapshot.lock().unwrap();
        if target_version > snapshot.version {
            snapshot.version = target_version;
        }
        Ok(())
    }
}
