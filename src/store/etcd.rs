//! etcd-based store backend.
//!
//! Maps the store primitives onto etcd transactions:
//!
//! - a metadata hash is one key holding a JSON field map, CAS-guarded by the
//!   `version` field inside it plus a mod-revision compare
//! - the registry set is a key prefix, one key per member
//! - a shard log is a family of sequence-numbered keys allocated under a
//!   txn-guarded counter key, so a multi-entry append lands atomically

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, GetOptions, SortOrder, SortTarget,
    Txn, TxnOp,
};
use tracing::debug;

use crate::job::{FIELD_MEMBERSHIP_VERSION, FIELD_OWNER, FIELD_VERSION};
use crate::store::{LogEntry, StoreError, StoreOps};

/// Suffix of the per-log key that carries the next entry sequence number.
const SEQ_SUFFIX: &str = ".seq";

/// Bounded retries for append transactions that lose the sequence-counter
/// race against a concurrent appender to the same log.
const MAX_TXN_ATTEMPTS: usize = 5;

pub struct EtcdStore {
    client: Client,
    prefix: String,
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String], prefix: &str) -> Result<Self, StoreError> {
        let endpoints = if endpoints.is_empty() {
            vec!["http://127.0.0.1:2379".to_string()]
        } else {
            endpoints.to_vec()
        };
        let client = Client::connect(endpoints, Some(ConnectOptions::default()))
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        Ok(Self {
            client,
            prefix: prefix.trim_end_matches('/').to_string(),
        })
    }

    fn abs(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }

    fn seq_key(&self, log_key: &str) -> String {
        format!("{}/{}", self.abs(log_key), SEQ_SUFFIX)
    }

    fn entry_key(&self, log_key: &str, seq: u64) -> String {
        format!("{}/{:016x}", self.abs(log_key), seq)
    }

    /// Read a metadata hash with the revision needed for a CAS write.
    async fn read_hash(
        &self,
        meta_key: &str,
    ) -> Result<Option<(HashMap<String, String>, i64)>, StoreError> {
        let mut kv = self.client.kv_client();
        let resp = kv
            .get(self.abs(meta_key), None)
            .await
            .map_err(backend_err)?;
        let Some(entry) = resp.kvs().first() else {
            return Ok(None);
        };
        let fields: HashMap<String, String> =
            serde_json::from_slice(entry.value()).map_err(|e| {
                StoreError::Backend(format!("malformed metadata hash at {}: {}", meta_key, e))
            })?;
        Ok(Some((fields, entry.mod_revision())))
    }

    /// Version-guarded hash mutation: succeeds only if the stored `version`
    /// field matches `expected_version` and nobody else wrote the key in
    /// between.
    async fn cas_hash<F>(
        &self,
        meta_key: &str,
        expected_version: u64,
        mutate: F,
    ) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut HashMap<String, String>),
    {
        let Some((mut fields, revision)) = self.read_hash(meta_key).await? else {
            return Ok(false);
        };
        let stored: Option<u64> = fields.get(FIELD_VERSION).and_then(|v| v.parse().ok());
        if stored != Some(expected_version) {
            return Ok(false);
        }
        mutate(&mut fields);
        let value = serde_json::to_vec(&fields).map_err(|e| StoreError::Backend(e.to_string()))?;
        let key = self.abs(meta_key);
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(
                key.clone(),
                CompareOp::Equal,
                revision,
            )])
            .and_then(vec![TxnOp::put(key, value, None)]);
        let resp = self.client.kv_client().txn(txn).await.map_err(backend_err)?;
        Ok(resp.succeeded())
    }
}

fn backend_err(e: etcd_client::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl StoreOps for EtcdStore {
    async fn create_shard(
        &self,
        meta_key: &str,
        set_key: &str,
        shard_id: &str,
        fields: &[(String, String)],
    ) -> Result<bool, StoreError> {
        let hash: HashMap<&str, &str> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let value = serde_json::to_vec(&hash).map_err(|e| StoreError::Backend(e.to_string()))?;
        let key = self.abs(meta_key);
        let member_key = format!("{}/{}", self.abs(set_key), shard_id);
        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                key.clone(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![
                TxnOp::put(key, value, None),
                TxnOp::put(member_key, shard_id.as_bytes().to_vec(), None),
            ]);
        let resp = self.client.kv_client().txn(txn).await.map_err(backend_err)?;
        Ok(resp.succeeded())
    }

    async fn try_take_ownership(
        &self,
        meta_key: &str,
        expected_version: u64,
        new_owner: &str,
        membership_version: i64,
    ) -> Result<bool, StoreError> {
        self.cas_hash(meta_key, expected_version, |fields| {
            fields.insert(FIELD_OWNER.to_string(), new_owner.to_string());
            fields.insert(
                FIELD_MEMBERSHIP_VERSION.to_string(),
                membership_version.to_string(),
            );
            fields.insert(
                FIELD_VERSION.to_string(),
                (expected_version + 1).to_string(),
            );
        })
        .await
    }

    async fn release_ownership(
        &self,
        meta_key: &str,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        self.cas_hash(meta_key, expected_version, |fields| {
            fields.insert(FIELD_OWNER.to_string(), String::new());
            fields.insert(
                FIELD_VERSION.to_string(),
                (expected_version + 1).to_string(),
            );
        })
        .await
    }

    async fn update_metadata(
        &self,
        meta_key: &str,
        expected_version: u64,
        new_version: u64,
        fields: &[(String, String)],
    ) -> Result<bool, StoreError> {
        self.cas_hash(meta_key, expected_version, |hash| {
            for (k, v) in fields {
                hash.insert(k.clone(), v.clone());
            }
            hash.insert(FIELD_VERSION.to_string(), new_version.to_string());
        })
        .await
    }

    async fn append_batch(
        &self,
        log_key: &str,
        payloads: Vec<Bytes>,
    ) -> Result<Vec<String>, StoreError> {
        let seq_key = self.seq_key(log_key);
        let mut kv = self.client.kv_client();

        for attempt in 0..MAX_TXN_ATTEMPTS {
            let resp = kv.get(seq_key.clone(), None).await.map_err(backend_err)?;
            let (next_seq, guard) = match resp.kvs().first() {
                Some(entry) => {
                    let current: u64 = std::str::from_utf8(entry.value())
                        .ok()
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| {
                            StoreError::Backend(format!("malformed sequence key {}", seq_key))
                        })?;
                    (
                        current,
                        Compare::mod_revision(seq_key.clone(), CompareOp::Equal, entry.mod_revision()),
                    )
                }
                None => (
                    0,
                    Compare::create_revision(seq_key.clone(), CompareOp::Equal, 0),
                ),
            };

            let mut ops = Vec::with_capacity(payloads.len() + 1);
            let mut ids = Vec::with_capacity(payloads.len());
            for (i, payload) in payloads.iter().enumerate() {
                let seq = next_seq + i as u64;
                ids.push(format!("{:016x}", seq));
                ops.push(TxnOp::put(
                    self.entry_key(log_key, seq),
                    payload.to_vec(),
                    None,
                ));
            }
            ops.push(TxnOp::put(
                seq_key.clone(),
                (next_seq + payloads.len() as u64).to_string(),
                None,
            ));

            let txn = Txn::new().when(vec![guard]).and_then(ops);
            let resp = kv.txn(txn).await.map_err(backend_err)?;
            if resp.succeeded() {
                return Ok(ids);
            }
            debug!(
                log = %log_key,
                attempt = attempt + 1,
                "append lost sequence race, retrying"
            );
        }
        Err(StoreError::AppendContention(log_key.to_string()))
    }

    async fn scan_all(&self, log_key: &str) -> Result<Vec<LogEntry>, StoreError> {
        let prefix = format!("{}/", self.abs(log_key));
        let opts = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend);
        let resp = self
            .client
            .kv_client()
            .get(prefix.clone(), Some(opts))
            .await
            .map_err(backend_err)?;
        let mut entries = Vec::with_capacity(resp.kvs().len());
        for entry in resp.kvs() {
            let key = String::from_utf8_lossy(entry.key());
            let Some(id) = key.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if id == SEQ_SUFFIX {
                continue;
            }
            entries.push(LogEntry {
                id: id.to_string(),
                payload: Bytes::copy_from_slice(entry.value()),
            });
        }
        Ok(entries)
    }

    async fn get_all_fields(&self, meta_key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self
            .read_hash(meta_key)
            .await?
            .map(|(fields, _)| fields)
            .unwrap_or_default())
    }

    async fn set_members(&self, set_key: &str) -> Result<Vec<String>, StoreError> {
        let prefix = format!("{}/", self.abs(set_key));
        let opts = GetOptions::new()
            .with_prefix()
            .with_keys_only()
            .with_sort(SortTarget::Key, SortOrder::Ascend);
        let resp = self
            .client
            .kv_client()
            .get(prefix.clone(), Some(opts))
            .await
            .map_err(backend_err)?;
        Ok(resp
            .kvs()
            .iter()
            .filter_map(|entry| {
                String::from_utf8_lossy(entry.key())
                    .strip_prefix(prefix.as_str())
                    .map(str::to_string)
            })
            .collect())
    }

    async fn remove_set_member(&self, set_key: &str, member: &str) -> Result<(), StoreError> {
        let key = format!("{}/{}", self.abs(set_key), member);
        self.client
            .kv_client()
            .delete(key, None)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut kv = self.client.kv_client();
        for key in keys {
            // Prefix delete covers both single keys (metadata, lease) and
            // key families (log entries plus their sequence counter).
            kv.delete(self.abs(key), Some(DeleteOptions::new().with_prefix()))
                .await
                .map_err(backend_err)?;
        }
        Ok(())
    }
}
