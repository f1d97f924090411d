mod test_helpers;

use std::sync::Arc;

use bytes::Bytes;
use timeshard::job::{FIELD_OWNER, FIELD_VERSION};
use timeshard::keys::{shard_log_key, shard_meta_key, shard_set_key};
use timeshard::store::{MemoryStore, StoreOps};

use test_helpers::{test_metadata, NODE_A, NODE_B};

#[tokio::test]
async fn create_shard_is_first_writer_wins() {
    let store = MemoryStore::new();
    let meta_key = shard_meta_key("s1");
    let fields = test_metadata("", 1).to_fields();

    let created = store
        .create_shard(&meta_key, &shard_set_key(), "s1", &fields)
        .await
        .unwrap();
    assert!(created);

    // Second creation of the same id fails softly, without an error.
    let created = store
        .create_shard(&meta_key, &shard_set_key(), "s1", &fields)
        .await
        .unwrap();
    assert!(!created);

    let members = store.set_members(&shard_set_key()).await.unwrap();
    assert_eq!(members, vec!["s1".to_string()]);
}

#[tokio::test]
async fn concurrent_ownership_claims_have_one_winner() {
    let store = Arc::new(MemoryStore::new());
    let meta_key = shard_meta_key("s1");
    store
        .create_shard(
            &meta_key,
            &shard_set_key(),
            "s1",
            &test_metadata("", 1).to_fields(),
        )
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        store.try_take_ownership(&meta_key, 1, NODE_A, 1),
        store.try_take_ownership(&meta_key, 1, NODE_B, 1),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a ^ b, "exactly one claim must win, got ({}, {})", a, b);

    // The loser retrying against the stale version still fails.
    let retry = store
        .try_take_ownership(&meta_key, 1, NODE_B, 1)
        .await
        .unwrap();
    assert!(!retry);

    // Only after a release (bumping the version again) can it be claimed.
    assert!(store.release_ownership(&meta_key, 2).await.unwrap());
    assert!(store
        .try_take_ownership(&meta_key, 3, NODE_B, 1)
        .await
        .unwrap());

    let fields = store.get_all_fields(&meta_key).await.unwrap();
    assert_eq!(fields.get(FIELD_OWNER).map(String::as_str), Some(NODE_B));
    assert_eq!(fields.get(FIELD_VERSION).map(String::as_str), Some("4"));
}

#[tokio::test]
async fn release_with_stale_version_is_rejected() {
    let store = MemoryStore::new();
    let meta_key = shard_meta_key("s1");
    store
        .create_shard(
            &meta_key,
            &shard_set_key(),
            "s1",
            &test_metadata(NODE_A, 5).to_fields(),
        )
        .await
        .unwrap();

    assert!(!store.release_ownership(&meta_key, 4).await.unwrap());
    let fields = store.get_all_fields(&meta_key).await.unwrap();
    assert_eq!(fields.get(FIELD_OWNER).map(String::as_str), Some(NODE_A));
}

#[tokio::test]
async fn update_metadata_merges_fields_under_version_guard() {
    let store = MemoryStore::new();
    let meta_key = shard_meta_key("s1");
    store
        .create_shard(
            &meta_key,
            &shard_set_key(),
            "s1",
            &test_metadata(NODE_A, 1).to_fields(),
        )
        .await
        .unwrap();

    let applied = store
        .update_metadata(
            &meta_key,
            1,
            2,
            &[("tier".to_string(), "gold".to_string())],
        )
        .await
        .unwrap();
    assert!(applied);

    // Stale guard: no-op.
    let applied = store
        .update_metadata(
            &meta_key,
            1,
            2,
            &[("tier".to_string(), "silver".to_string())],
        )
        .await
        .unwrap();
    assert!(!applied);

    let fields = store.get_all_fields(&meta_key).await.unwrap();
    assert_eq!(fields.get("tier").map(String::as_str), Some("gold"));
    assert_eq!(fields.get(FIELD_VERSION).map(String::as_str), Some("2"));
}

#[tokio::test]
async fn append_preserves_order_and_scan_replays_it() {
    let store = MemoryStore::new();
    let log_key = shard_log_key("s1");

    let first = store
        .append_batch(&log_key, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")])
        .await
        .unwrap();
    let second = store
        .append_batch(&log_key, vec![Bytes::from_static(b"c")])
        .await
        .unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 1);
    assert!(first[0] < first[1] && first[1] < second[0]);

    let entries = store.scan_all(&log_key).await.unwrap();
    let payloads: Vec<&[u8]> = entries.iter().map(|e| e.payload.as_ref()).collect();
    assert_eq!(payloads, vec![b"a".as_ref(), b"b".as_ref(), b"c".as_ref()]);
}

#[tokio::test]
async fn scanning_a_missing_log_yields_empty() {
    let store = MemoryStore::new();
    let entries = store.scan_all(&shard_log_key("nope")).await.unwrap();
    assert!(entries.is_empty());
}

#[tokio::test]
async fn delete_keys_and_registry_removal() {
    let store = MemoryStore::new();
    let meta_key = shard_meta_key("s1");
    let log_key = shard_log_key("s1");
    store
        .create_shard(
            &meta_key,
            &shard_set_key(),
            "s1",
            &test_metadata(NODE_A, 1).to_fields(),
        )
        .await
        .unwrap();
    store
        .append_batch(&log_key, vec![Bytes::from_static(b"x")])
        .await
        .unwrap();

    store
        .delete_keys(&[meta_key.clone(), log_key.clone()])
        .await
        .unwrap();
    store
        .remove_set_member(&shard_set_key(), "s1")
        .await
        .unwrap();

    assert!(store.get_all_fields(&meta_key).await.unwrap().is_empty());
    assert!(store.scan_all(&log_key).await.unwrap().is_empty());
    assert!(store.set_members(&shard_set_key()).await.unwrap().is_empty());
}
