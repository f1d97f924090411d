//! Core data model: job-log events, replayed jobs, and shard metadata.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Metadata hash field: the node address of the current owner, empty when
/// the shard is unowned.
pub const FIELD_OWNER: &str = "Owner";
/// Metadata hash field: the cluster membership version the owner observed
/// when it last took or refreshed ownership.
pub const FIELD_MEMBERSHIP_VERSION: &str = "MembershipVersion";
/// Metadata hash field: inclusive lower bound of the shard's due-time range.
pub const FIELD_MIN_DUE_TIME: &str = "MinDueTime";
/// Metadata hash field: exclusive upper bound of the shard's due-time range.
pub const FIELD_MAX_DUE_TIME: &str = "MaxDueTime";
/// Metadata hash field: the CAS counter. Strictly increases on every
/// successful conditional mutation.
pub const FIELD_VERSION: &str = "version";

/// The kind of a job-log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobOperationKind {
    Add,
    Remove,
    Retry,
}

/// A single immutable event in a shard's append-only log.
///
/// Never mutated once written; a shard's pending-job state is a pure
/// function of the ordered sequence of these events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOperation {
    pub id: String,
    pub kind: JobOperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_time_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl JobOperation {
    pub fn add(
        id: impl Into<String>,
        name: impl Into<String>,
        due_time_ms: i64,
        target_id: Option<String>,
        metadata: Option<HashMap<String, String>>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: JobOperationKind::Add,
            name: Some(name.into()),
            due_time_ms: Some(due_time_ms),
            target_id,
            metadata,
        }
    }

    pub fn remove(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: JobOperationKind::Remove,
            name: None,
            due_time_ms: None,
            target_id: None,
            metadata: None,
        }
    }

    pub fn retry(id: impl Into<String>, due_time_ms: i64) -> Self {
        Self {
            id: id.into(),
            kind: JobOperationKind::Retry,
            name: None,
            due_time_ms: Some(due_time_ms),
            target_id: None,
            metadata: None,
        }
    }
}

/// A pending job reconstructed by folding a shard's log in order.
#[derive(Debug, Clone, PartialEq)]
pub struct DurableJob {
    pub id: String,
    pub name: String,
    pub due_time_ms: i64,
    pub target_id: Option<String>,
    pub shard_id: String,
    pub metadata: HashMap<String, String>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Error)]
pub enum MetadataFieldError {
    #[error("missing metadata field: {0}")]
    Missing(&'static str),
    #[error("invalid value for metadata field {field}: {value}")]
    Invalid { field: &'static str, value: String },
}

/// Typed view over a shard's metadata field map.
///
/// The store keeps metadata as a flat string hash; this parses the standard
/// fields and carries everything else through in `custom`.
#[derive(Debug, Clone)]
pub struct ShardMetadata {
    pub owner: Option<String>,
    pub membership_version: i64,
    pub min_due_time_ms: i64,
    pub max_due_time_ms: i64,
    pub version: u64,
    pub custom: HashMap<String, String>,
}

impl ShardMetadata {
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, MetadataFieldError> {
        let owner = match fields.get(FIELD_OWNER).map(String::as_str) {
            None | Some("") => None,
            Some(addr) => Some(addr.to_string()),
        };
        let mut custom = fields.clone();
        custom.remove(FIELD_OWNER);
        custom.remove(FIELD_MEMBERSHIP_VERSION);
        custom.remove(FIELD_MIN_DUE_TIME);
        custom.remove(FIELD_MAX_DUE_TIME);
        custom.remove(FIELD_VERSION);
        Ok(Self {
            owner,
            membership_version: parse_field(fields, FIELD_MEMBERSHIP_VERSION)?,
            min_due_time_ms: parse_field(fields, FIELD_MIN_DUE_TIME)?,
            max_due_time_ms: parse_field(fields, FIELD_MAX_DUE_TIME)?,
            version: parse_field(fields, FIELD_VERSION)?,
            custom,
        })
    }

    /// The full field list as written to the store, version included.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            (
                FIELD_OWNER.to_string(),
                self.owner.clone().unwrap_or_default(),
            ),
            (
                FIELD_MEMBERSHIP_VERSION.to_string(),
                self.membership_version.to_string(),
            ),
            (
                FIELD_MIN_DUE_TIME.to_string(),
                self.min_due_time_ms.to_string(),
            ),
            (
                FIELD_MAX_DUE_TIME.to_string(),
                self.max_due_time_ms.to_string(),
            ),
            (FIELD_VERSION.to_string(), self.version.to_string()),
        ];
        for (k, v) in &self.custom {
            fields.push((k.clone(), v.clone()));
        }
        fields
    }

    /// The field map held in memory by a live shard. The version counter is
    /// tracked separately, so it is excluded here.
    pub fn field_map(&self) -> HashMap<String, String> {
        let mut map = self.custom.clone();
        map.insert(
            FIELD_OWNER.to_string(),
            self.owner.clone().unwrap_or_default(),
        );
        map.insert(
            FIELD_MEMBERSHIP_VERSION.to_string(),
            self.membership_version.to_string(),
        );
        map.insert(
            FIELD_MIN_DUE_TIME.to_string(),
            self.min_due_time_ms.to_string(),
        );
        map.insert(
            FIELD_MAX_DUE_TIME.to_string(),
            self.max_due_time_ms.to_string(),
        );
        map
    }
}

fn parse_field<T: std::str::FromStr>(
    fields: &HashMap<String, String>,
    field: &'static str,
) -> Result<T, MetadataFieldError> {
    let raw = fields
        .get(field)
        .ok_or(MetadataFieldError::Missing(field))?;
    raw.parse().map_err(|_| MetadataFieldError::Invalid {
        field,
        value: raw.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_round_trips_through_field_map() {
        let meta = ShardMetadata {
            owner: Some("10.0.0.1:11811".to_string()),
            membership_version: 7,
            min_due_time_ms: 1_000,
            max_due_time_ms: 2_000,
            version: 3,
            custom: HashMap::from([("tier".to_string(), "gold".to_string())]),
        };
        let fields: HashMap<String, String> = meta.to_fields().into_iter().collect();
        let parsed = ShardMetadata::from_fields(&fields).expect("parse");
        assert_eq!(parsed.owner.as_deref(), Some("10.0.0.1:11811"));
        assert_eq!(parsed.membership_version, 7);
        assert_eq!(parsed.version, 3);
        assert_eq!(parsed.custom.get("tier").map(String::as_str), Some("gold"));
    }

    #[test]
    fn empty_owner_field_parses_as_unowned() {
        let meta = ShardMetadata {
            owner: None,
            membership_version: 1,
            min_due_time_ms: 0,
            max_due_time_ms: 10,
            version: 1,
            custom: HashMap::new(),
        };
        let fields: HashMap<String, String> = meta.to_fields().into_iter().collect();
        assert_eq!(fields.get(FIELD_OWNER).map(String::as_str), Some(""));
        let parsed = ShardMetadata::from_fields(&fields).expect("parse");
        assert_eq!(parsed.owner, None);
    }
}
