//! In-process store backend.
//!
//! A single interior lock makes every primitive indivisible, which is the
//! whole atomicity contract for a one-process deployment. Tests use the
//! failure-injection toggles to exercise error propagation through the
//! write pipeline.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::job::{FIELD_MEMBERSHIP_VERSION, FIELD_OWNER, FIELD_VERSION};
use crate::store::{LogEntry, StoreError, StoreOps};

#[derive(Default)]
struct MemoryState {
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, BTreeSet<String>>,
    logs: HashMap<String, Vec<LogEntry>>,
    next_entry_seq: u64,
}

pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_appends: AtomicBool,
    fail_metadata: AtomicBool,
    append_delay_ms: AtomicUsize,
    append_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            fail_appends: AtomicBool::new(false),
            fail_metadata: AtomicBool::new(false),
            append_delay_ms: AtomicUsize::new(0),
            append_calls: AtomicUsize::new(0),
        }
    }

    /// Make subsequent `append_batch` calls fail with a backend error.
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `update_metadata` calls fail with a backend error
    /// (distinct from a CAS mismatch, which is not an error).
    pub fn fail_metadata(&self, fail: bool) {
        self.fail_metadata.store(fail, Ordering::SeqCst);
    }

    /// Delay each `append_batch` call, simulating a slow store round-trip.
    pub fn set_append_delay(&self, delay: Duration) {
        self.append_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Number of `append_batch` calls made so far (including failed ones).
    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    fn cas_hash<F>(
        &self,
        meta_key: &str,
        expected_version: u64,
        mutate: F,
    ) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut HashMap<String, String>),
    {
        let mut state = self.state.lock().unwrap();
        let Some(hash) = state.hashes.get_mut(meta_key) else {
            return Ok(false);
        };
        if stored_version(hash) != Some(expected_version) {
            return Ok(false);
        }
        mutate(hash);
        Ok(true)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn stored_version(hash: &HashMap<String, String>) -> Option<u64> {
    hash.get(FIELD_VERSION).and_then(|v| v.parse().ok())
}

#[async_trait]
impl StoreOps for MemoryStore {
    async fn create_shard(
        &self,
        meta_key: &str,
        set_key: &str,
        shard_id: &str,
        fields: &[(String, String)],
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.hashes.contains_key(meta_key) {
            return Ok(false);
        }
        let hash = fields.iter().cloned().collect();
        state.hashes.insert(meta_key.to_string(), hash);
        state
            .sets
            .entry(set_key.to_string())
            .or_default()
            .insert(shard_id.to_string());
        Ok(true)
    }

    async fn try_take_ownership(
        &self,
        meta_key: &str,
        expected_version: u64,
        new_owner: &str,
        membership_version: i64,
    ) -> Result<bool, StoreError> {
        self.cas_hash(meta_key, expected_version, |hash| {
            hash.insert(FIELD_OWNER.to_string(), new_owner.to_string());
            hash.insert(
                FIELD_MEMBERSHIP_VERSION.to_string(),
                membership_version.to_string(),
            );
            hash.insert(FIELD_VERSION.to_string(), (expected_version + 1).to_string());
        })
    }

    async fn release_ownership(
        &self,
        meta_key: &str,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        self.cas_hash(meta_key, expected_version, |hash| {
            hash.insert(FIELD_OWNER.to_string(), String::new());
            hash.insert(FIELD_VERSION.to_string(), (expected_version + 1).to_string());
        })
    }

    async fn update_metadata(
        &self,
        meta_key: &str,
        expected_version: u64,
        new_version: u64,
        fields: &[(String, String)],
    ) -> Result<bool, StoreError> {
        if self.fail_metadata.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected metadata failure".into()));
        }
        self.cas_hash(meta_key, expected_version, |hash| {
            for (k, v) in fields {
                hash.insert(k.clone(), v.clone());
            }
            hash.insert(FIELD_VERSION.to_string(), new_version.to_string());
        })
    }

    async fn append_batch(
        &self,
        log_key: &str,
        payloads: Vec<Bytes>,
    ) -> Result<Vec<String>, StoreError> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        let delay_ms = self.append_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
        }
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected append failure".into()));
        }
        let mut state = self.state.lock().unwrap();
        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            state.next_entry_seq += 1;
            let id = format!("{:016}", state.next_entry_seq);
            state
                .logs
                .entry(log_key.to_string())
                .or_default()
                .push(LogEntry {
                    id: id.clone(),
                    payload,
                });
            ids.push(id);
        }
        Ok(ids)
    }

    async fn scan_all(&self, log_key: &str) -> Result<Vec<LogEntry>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.logs.get(log_key).cloned().unwrap_or_default())
    }

    async fn get_all_fields(&self, meta_key: &str) -> Result<HashMap<String, String>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.hashes.get(meta_key).cloned().unwrap_or_default())
    }

    async fn set_members(&self, set_key: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sets
            .get(set_key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_set_member(&self, set_key: &str, member: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(set) = state.sets.get_mut(set_key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        for key in keys {
            state.hashes.remove(key);
            state.logs.remove(key);
            state.sets.remove(key);
        }
        Ok(())
    }
}
