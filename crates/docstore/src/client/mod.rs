//! Store client gateway.
//!
//! [`DocumentClient`] is the seam between this crate and the document-store
//! SDK. Every request either succeeds, reports a domain outcome
//! ([`ClientError::NotFound`], [`ClientError::Conflict`],
//! [`ClientError::PreconditionFailed`]) or fails with a throttling,
//! transient or fatal error. [`RetryingClient`] wraps any client and absorbs
//! throttling and transient failures according to [`RetryPolicy`].

mod retry;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use retry::{RetryAdvice, RetryPolicy, RetryingClient};

/// Identifies a collection inside a database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionLink {
    pub database_id: String,
    pub collection_id: String,
}

impl CollectionLink {
    pub fn new(database_id: impl Into<String>, collection_id: impl Into<String>) -> Self {
        Self {
            database_id: database_id.into(),
            collection_id: collection_id.into(),
        }
    }
}

impl fmt::Display for CollectionLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dbs/{}/colls/{}", self.database_id, self.collection_id)
    }
}

/// Indexing policy of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexingPolicy {
    pub automatic: bool,
    pub included_paths: Vec<String>,
    pub excluded_paths: Vec<String>,
}

impl Default for IndexingPolicy {
    fn default() -> Self {
        Self {
            automatic: true,
            included_paths: vec!["/*".to_string()],
            excluded_paths: Vec::new(),
        }
    }
}

/// Mutable settings of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSettings {
    pub partition_key_path: String,
    /// `None` disables expiry; `Some(-1)` enables per-document expiry with no default.
    pub default_ttl: Option<i32>,
    pub indexing_policy: IndexingPolicy,
    pub throughput: Option<u32>,
}

impl CollectionSettings {
    pub fn new(partition_key_path: impl Into<String>) -> Self {
        Self {
            partition_key_path: partition_key_path.into(),
            default_ttl: None,
            indexing_policy: IndexingPolicy::default(),
            throughput: None,
        }
    }

    pub fn with_throughput(mut self, throughput: Option<u32>) -> Self {
        self.throughput = throughput;
        self
    }
}

/// A server-side procedure registered on a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredProcedure {
    pub id: String,
    pub body: String,
}

/// A document to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub partition_key: String,
    pub body: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, partition_key: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            partition_key: partition_key.into(),
            body,
        }
    }

    /// Serializes `value` as the document body.
    pub fn from_serializable<T: Serialize>(
        id: impl Into<String>,
        partition_key: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(id, partition_key, serde_json::to_value(value)?))
    }
}

/// A document as read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub partition_key: String,
    pub body: Value,
    /// Store-assigned entity tag, changes on every write.
    pub etag: String,
    /// Store clock at the last write.
    pub timestamp: DateTime<Utc>,
}

impl StoredDocument {
    pub fn deserialize<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }
}

/// An equality filter on a top-level body field.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFilter {
    pub field: String,
    pub value: Value,
}

/// A query over one collection, optionally scoped to a partition.
///
/// Results are ordered by partition key, then id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentQuery {
    pub partition_key: Option<String>,
    pub filters: Vec<QueryFilter>,
}

impl DocumentQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(QueryFilter {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Returns `true` if `body` (in partition `partition_key`) matches the query.
    pub fn matches(&self, partition_key: &str, body: &Value) -> bool {
        if let Some(pk) = &self.partition_key {
            if pk != partition_key {
                return false;
            }
        }
        self.filters
            .iter()
            .all(|f| body.get(&f.field) == Some(&f.value))
    }
}

/// One page of query results.
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub documents: Vec<StoredDocument>,
    pub continuation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("not found")]
    NotFound,
    #[error("conflict: document already exists")]
    Conflict,
    #[error("precondition failed")]
    PreconditionFailed,
    #[error("request rate too large")]
    Throttled { retry_after: Option<Duration> },
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("collection does not exist: {0}")]
    CollectionMissing(String),
    /// The store failed in a way the client does not recognize.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store rejected the request itself.
    #[error("request failed: {0}")]
    Fatal(String),
}

impl ClientError {
    /// Domain outcomes are answers, not failures, and are never retried.
    pub fn is_domain_outcome(&self) -> bool {
        matches!(
            self,
            ClientError::NotFound | ClientError::Conflict | ClientError::PreconditionFailed
        )
    }
}

#[async_trait]
pub trait DocumentClient: Send + Sync {
    async fn database_exists(&self, database_id: &str) -> Result<bool, ClientError>;

    /// Returns `true` if the database was created by this call.
    async fn create_database_if_not_exists(
        &self,
        database_id: &str,
        throughput: Option<u32>,
    ) -> Result<bool, ClientError>;

    /// Returns `true` if the collection was created by this call.
    async fn create_collection_if_not_exists(
        &self,
        collection: &CollectionLink,
        settings: &CollectionSettings,
    ) -> Result<bool, ClientError>;

    async fn read_collection(
        &self,
        collection: &CollectionLink,
    ) -> Result<Option<CollectionSettings>, ClientError>;

    async fn replace_collection(
        &self,
        collection: &CollectionLink,
        settings: &CollectionSettings,
    ) -> Result<(), ClientError>;

    async fn read_stored_procedure(
        &self,
        collection: &CollectionLink,
        id: &str,
    ) -> Result<Option<StoredProcedure>, ClientError>;

    async fn upsert_stored_procedure(
        &self,
        collection: &CollectionLink,
        procedure: &StoredProcedure,
    ) -> Result<(), ClientError>;

    async fn read_document(
        &self,
        collection: &CollectionLink,
        partition_key: &str,
        id: &str,
    ) -> Result<Option<StoredDocument>, ClientError>;

    /// Fails with [`ClientError::Conflict`] if the document exists.
    async fn create_document(
        &self,
        collection: &CollectionLink,
        document: Document,
    ) -> Result<StoredDocument, ClientError>;

    /// Fails with [`ClientError::NotFound`] if the document is absent and with
    /// [`ClientError::PreconditionFailed`] if `if_match` differs from its ETag.
    async fn replace_document(
        &self,
        collection: &CollectionLink,
        document: Document,
        if_match: Option<&str>,
    ) -> Result<StoredDocument, ClientError>;

    /// Creates or replaces. With `if_match`, behaves as a conditional replace.
    async fn upsert_document(
        &self,
        collection: &CollectionLink,
        document: Document,
        if_match: Option<&str>,
    ) -> Result<StoredDocument, ClientError>;

    async fn delete_document(
        &self,
        collection: &CollectionLink,
        partition_key: &str,
        id: &str,
        if_match: Option<&str>,
    ) -> Result<(), ClientError>;

    async fn query_documents(
        &self,
        collection: &CollectionLink,
        query: &DocumentQuery,
        continuation: Option<&str>,
        max_items: usize,
    ) -> Result<QueryPage, ClientError>;

    /// Current time according to the store. Leases and heartbeats are
    /// measured against this clock, never the local one.
    async fn server_time(&self) -> Result<DateTime<Utc>, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collection_link_display() {
        let link = CollectionLink::new("health", "fhir");
        assert_eq!(link.to_string(), "dbs/health/colls/fhir");
    }

    #[test]
    fn test_query_matches() {
        let query = DocumentQuery::new()
            .partition("Patient_1")
            .where_eq("kind", "resource")
            .where_eq("isHistory", false);

        let body = json!({"kind": "resource", "isHistory": false});
        assert!(query.matches("Patient_1", &body));
        assert!(!query.matches("Patient_2", &body));

        let history = json!({"kind": "resource", "isHistory": true});
        assert!(!query.matches("Patient_1", &history));
    }

    #[test]
    fn test_domain_outcomes() {
        assert!(ClientError::NotFound.is_domain_outcome());
        assert!(ClientError::PreconditionFailed.is_domain_outcome());
        assert!(!ClientError::Transient("reset".into()).is_domain_outcome());
        assert!(!ClientError::Throttled { retry_after: None }.is_domain_outcome());
    }
}
