//! Resource store integration tests: versioning, conditional writes, history
//! and deletion.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use helios_docstore::ResourceStore;
use helios_docstore::backends::InMemoryDocumentClient;
use helios_docstore::error::{ConcurrencyError, ResourceError, StorageError};
use helios_docstore::types::{SaveOutcomeType, WeakETag};

use common::{patient, resource_store, with_collection};

// ============================================================================
// Conditional writes
// ============================================================================

#[tokio::test]
async fn test_matching_tag_updates() {
    let (_, store) = resource_store().await;
    let v1 = store.upsert(patient("p1", "A"), None, true, true).await.unwrap();

    let v2 = store
        .upsert(patient("p1", "B"), Some(&v1.etag()), true, true)
        .await
        .unwrap();
    assert_eq!(v2.outcome, SaveOutcomeType::Updated);
    assert_eq!(v2.etag(), WeakETag::from_version_id("2"));

    let current = store.get("Patient", "p1", None).await.unwrap();
    assert_eq!(current.version(), "2");
    assert!(current.raw_resource().data.contains("\"B\""));
}

#[tokio::test]
async fn test_concurrent_tagged_writers_one_wins() {
    let (client, link) = with_collection(
        InMemoryDocumentClient::new().with_latency(Duration::from_millis(1)),
    )
    .await;
    let store = ResourceStore::new(Arc::new(client), link);
    let v1 = store.upsert(patient("p1", "A"), None, true, true).await.unwrap();
    let tag = v1.etag();

    let (a, b) = tokio::join!(
        store.upsert(patient("p1", "B"), Some(&tag), true, true),
        store.upsert(patient("p1", "C"), Some(&tag), true, true),
    );

    let results = [a, b];
    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1);
    let loser = results.into_iter().find_map(Result::err).unwrap();
    assert!(matches!(
        loser,
        StorageError::Concurrency(ConcurrencyError::VersionConflict { .. })
    ));
    assert_eq!(store.get("Patient", "p1", None).await.unwrap().version(), "2");
}

#[tokio::test]
async fn test_concurrent_untagged_writers_all_land() {
    let (client, link) = with_collection(
        InMemoryDocumentClient::new().with_latency(Duration::from_millis(1)),
    )
    .await;
    let store = ResourceStore::new(Arc::new(client), link).with_max_write_attempts(10);

    let (a, b, c, d) = tokio::join!(
        store.upsert(patient("p1", "A"), None, true, true),
        store.upsert(patient("p1", "B"), None, true, true),
        store.upsert(patient("p1", "C"), None, true, true),
        store.upsert(patient("p1", "D"), None, true, true),
    );

    let versions: BTreeSet<String> = [a, b, c, d]
        .into_iter()
        .map(|r| r.unwrap().wrapper.version().to_string())
        .collect();
    let expected: BTreeSet<String> = ["1", "2", "3", "4"].iter().map(|v| v.to_string()).collect();
    assert_eq!(versions, expected);

    for version in ["1", "2", "3"] {
        assert!(store.get("Patient", "p1", Some(version)).await.is_ok());
    }
}

#[tokio::test]
async fn test_without_history_old_versions_are_gone() {
    let (_, store) = resource_store().await;
    store.upsert(patient("p1", "A"), None, true, false).await.unwrap();
    store.upsert(patient("p1", "B"), None, true, false).await.unwrap();

    let err = store.get("Patient", "p1", Some("1")).await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::Resource(ResourceError::VersionNotFound { ref version_id, .. }) if version_id == "1"
    ));
}

// ============================================================================
// Reads and deletion
// ============================================================================

#[tokio::test]
async fn test_read_missing_resource() {
    let (_, store) = resource_store().await;
    let err = store.get("Patient", "nobody", None).await.unwrap_err();
    assert!(matches!(err, StorageError::Resource(ResourceError::NotFound { .. })));
}

#[tokio::test]
async fn test_soft_delete_then_recreate() {
    let (_, store) = resource_store().await;
    store.upsert(patient("p1", "A"), None, true, true).await.unwrap();
    store.delete("Patient", "p1", true).await.unwrap();

    assert!(matches!(
        store.get("Patient", "p1", None).await.unwrap_err(),
        StorageError::Resource(ResourceError::Gone { .. })
    ));

    let revived = store.upsert(patient("p1", "Z"), None, true, true).await.unwrap();
    assert_eq!(revived.outcome, SaveOutcomeType::Updated);
    assert_eq!(revived.wrapper.version(), "3");
    assert!(store.get("Patient", "p1", None).await.is_ok());
}

#[tokio::test]
async fn test_hard_delete_removes_every_version() {
    let (client, store) = resource_store().await;
    store.upsert(patient("keep", "K"), None, true, true).await.unwrap();
    let baseline = client.document_count(store.collection());

    for family in ["A", "B", "C"] {
        store.upsert(patient("p1", family), None, true, true).await.unwrap();
    }
    assert_eq!(client.document_count(store.collection()), baseline + 3);

    store.hard_delete("Patient", "p1").await.unwrap();
    assert_eq!(client.document_count(store.collection()), baseline);

    for version in [None, Some("1"), Some("3")] {
        let err = store.get("Patient", "p1", version).await.unwrap_err();
        assert!(matches!(err, StorageError::Resource(ResourceError::NotFound { .. })));
    }
    assert!(store.get("Patient", "keep", None).await.is_ok());

    // Nothing left to remove.
    store.hard_delete("Patient", "p1").await.unwrap();
}

#[tokio::test]
async fn test_scan_pages_through_type() {
    let (_, store) = resource_store().await;
    for i in 0..5 {
        store
            .upsert(patient(&format!("p{i}"), "X"), None, true, true)
            .await
            .unwrap();
    }
    // History documents must not show up in a scan.
    store.upsert(patient("p0", "Y"), None, true, true).await.unwrap();

    let mut seen = Vec::new();
    let mut continuation: Option<String> = None;
    loop {
        let page = store
            .scan_resources("Patient", continuation.as_deref(), 2)
            .await
            .unwrap();
        assert!(page.resources.len() <= 2);
        seen.extend(page.resources.iter().map(|r| r.id().to_string()));
        continuation = page.continuation;
        if continuation.is_none() {
            break;
        }
    }
    assert_eq!(seen, vec!["p0", "p1", "p2", "p3", "p4"]);
}
