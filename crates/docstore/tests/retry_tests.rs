//! Store gateway retry behavior, end to end through the retrying client.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use helios_docstore::ResourceStore;
use helios_docstore::backends::{InMemoryDocumentClient, OperationKind};
use helios_docstore::client::{
    ClientError, Document, DocumentClient, DocumentQuery, RetryPolicy, RetryingClient,
};
use helios_docstore::config::RetryConfig;
use helios_docstore::types::{SaveOutcomeType, WeakETag};
use serde_json::json;

use common::{memory_collection, patient};

fn retrying(memory: &InMemoryDocumentClient) -> RetryingClient {
    RetryingClient::new(
        Arc::new(memory.clone()),
        RetryPolicy::new(RetryConfig {
            max_number_of_retries: 5,
            max_wait_time: Duration::from_secs(10),
            transient_max_retries: 2,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }),
    )
}

#[tokio::test(start_paused = true)]
async fn test_throttle_then_transient_then_success() {
    let (memory, link) = memory_collection().await;
    memory
        .create_document(&link, Document::new("d1", "pk", json!({"n": 1})))
        .await
        .unwrap();
    let client = retrying(&memory);

    memory.inject_fault(
        OperationKind::ReadDocument,
        ClientError::Throttled {
            retry_after: Some(Duration::from_millis(150)),
        },
    );
    memory.inject_fault(
        OperationKind::ReadDocument,
        ClientError::Transient("connection reset".to_string()),
    );

    let started = Instant::now();
    let read = client.read_document(&link, "pk", "d1").await.unwrap();
    assert!(read.is_some());
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(memory.request_count(OperationKind::ReadDocument), 3);
}

#[tokio::test(start_paused = true)]
async fn test_throttle_budget_exhausted_surfaces_error() {
    let (memory, link) = memory_collection().await;
    let client = retrying(&memory);
    memory.inject_faults(
        OperationKind::QueryDocuments,
        ClientError::Throttled { retry_after: None },
        10,
    );

    let err = client
        .query_documents(&link, &DocumentQuery::new(), None, 10)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Throttled { .. }));
    // The first attempt plus five retries.
    assert_eq!(memory.request_count(OperationKind::QueryDocuments), 6);
}

#[tokio::test(start_paused = true)]
async fn test_unconditional_upsert_is_not_replayed() {
    let (memory, link) = memory_collection().await;
    let client = retrying(&memory);
    memory.inject_fault(
        OperationKind::UpsertDocument,
        ClientError::Transient("timeout".to_string()),
    );

    let err = client
        .upsert_document(&link, Document::new("d1", "pk", json!({})), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Transient(_)));
    assert_eq!(memory.request_count(OperationKind::UpsertDocument), 1);
}

#[tokio::test(start_paused = true)]
async fn test_domain_outcomes_return_immediately() {
    let (memory, link) = memory_collection().await;
    let client = retrying(&memory);
    client
        .create_document(&link, Document::new("d1", "pk", json!({})))
        .await
        .unwrap();

    let started = Instant::now();
    let err = client
        .create_document(&link, Document::new("d1", "pk", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Conflict));
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_throttled_update_waits_then_saves_new_version() {
    let (memory, link) = memory_collection().await;
    let store = ResourceStore::new(Arc::new(retrying(&memory)), link);
    let created = store
        .upsert(patient("p1", "Chalmers"), None, true, true)
        .await
        .unwrap();
    assert_eq!(created.wrapper.version(), "1");

    memory.inject_fault(
        OperationKind::ReplaceDocument,
        ClientError::Throttled {
            retry_after: Some(Duration::from_millis(200)),
        },
    );

    let started = Instant::now();
    let updated = store
        .upsert(
            patient("p1", "Windsor"),
            Some(&WeakETag::from_version_id("1")),
            true,
            true,
        )
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(updated.outcome, SaveOutcomeType::Updated);
    assert_eq!(updated.wrapper.version(), "2");
    assert_eq!(memory.request_count(OperationKind::ReplaceDocument), 2);

    let current = store.get("Patient", "p1", None).await.unwrap();
    assert_eq!(current.version(), "2");
}
