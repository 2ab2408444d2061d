//! Shared setup for the document-store integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use helios_docstore::ResourceStore;
use helios_docstore::backends::InMemoryDocumentClient;
use helios_docstore::client::{
    CollectionLink, CollectionSettings, DocumentClient, RetryPolicy, RetryingClient,
};
use helios_docstore::config::{LockConfig, RetryConfig};
use helios_docstore::layout::PARTITION_KEY_PATH;
use helios_docstore::types::{RawResource, ResourceMethod, ResourceWrapper};

pub const DATABASE: &str = "health";
pub const COLLECTION: &str = "fhir";

/// Lock settings short enough for tests that wait on a busy lock.
pub fn fast_lock_config() -> LockConfig {
    LockConfig {
        acquire_timeout: Duration::from_secs(2),
        retry_interval: Duration::from_millis(5),
        max_retry_interval: Duration::from_millis(20),
        lease: Duration::from_secs(30),
    }
}

/// The retry layer production code runs behind, with short delays.
pub fn retrying(client: &InMemoryDocumentClient) -> Arc<dyn DocumentClient> {
    Arc::new(RetryingClient::new(
        Arc::new(client.clone()),
        RetryPolicy::new(RetryConfig {
            max_number_of_retries: 5,
            max_wait_time: Duration::from_secs(5),
            transient_max_retries: 3,
            initial_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
        }),
    ))
}

/// An in-memory store with the database and resource collection created.
pub async fn memory_collection() -> (InMemoryDocumentClient, CollectionLink) {
    with_collection(InMemoryDocumentClient::new()).await
}

pub async fn with_collection(
    client: InMemoryDocumentClient,
) -> (InMemoryDocumentClient, CollectionLink) {
    let link = CollectionLink::new(DATABASE, COLLECTION);
    client
        .create_database_if_not_exists(DATABASE, None)
        .await
        .expect("create database");
    client
        .create_collection_if_not_exists(&link, &CollectionSettings::new(PARTITION_KEY_PATH))
        .await
        .expect("create collection");
    (client, link)
}

/// A resource store talking to the in-memory client directly, without a
/// retry layer, so injected faults reach the caller.
pub async fn resource_store() -> (InMemoryDocumentClient, Arc<ResourceStore>) {
    let (client, link) = memory_collection().await;
    let store = ResourceStore::new(Arc::new(client.clone()), link);
    (client, Arc::new(store))
}

pub fn wrap(resource_type: &str, id: &str, body: Value) -> ResourceWrapper {
    ResourceWrapper::new(
        resource_type,
        id,
        RawResource::from_value(&body),
        ResourceMethod::Put,
    )
}

pub fn patient(id: &str, family: &str) -> ResourceWrapper {
    wrap(
        "Patient",
        id,
        json!({
            "resourceType": "Patient",
            "id": id,
            "name": [{"family": family}]
        }),
    )
}

pub fn observation(id: &str, patient_id: &str) -> ResourceWrapper {
    wrap(
        "Observation",
        id,
        json!({
            "resourceType": "Observation",
            "id": id,
            "status": "final",
            "subject": {"reference": format!("Patient/{patient_id}")}
        }),
    )
}
