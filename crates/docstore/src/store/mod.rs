//! Resource store with optimistic concurrency.
//!
//! Every resource lives in its own partition `"{type}_{id}"`: the current
//! version under the logical id, history versions under `"{id}_{version}"`.
//! Writes are conditional on the store ETag of the current document, so
//! concurrent writers are detected rather than silently overwritten.
//!
//! # Write semantics
//!
//! | Current state | Caller tag | Result |
//! |---------------|------------|--------|
//! | absent | none, `allow_create` | version `1`, [`SaveOutcomeType::Created`] |
//! | absent | any tag, or `!allow_create` | [`ResourceError::NotFound`] |
//! | present | matching or none | next version, [`SaveOutcomeType::Updated`] |
//! | present | mismatching | [`ConcurrencyError::VersionConflict`], nothing written |
//! | deleted | delete request | [`SaveOutcomeType::Unchanged`] |

mod documents;
mod jobs;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{ClientError, CollectionLink, DocumentClient, DocumentQuery};
use crate::error::{ConcurrencyError, ResourceError, StorageError, StorageResult, StoreError};
use crate::layout::{DocumentKind, history_document_id};
use crate::types::{ResourceWrapper, SaveOutcome, SaveOutcomeType, WeakETag, partition_key};

use documents::{
    FIELD_IS_DELETED, FIELD_IS_HISTORY, FIELD_KIND, FIELD_RESOURCE_TYPE, ResourceDocument,
};

const DEFAULT_MAX_WRITE_ATTEMPTS: u32 = 5;
const DEFAULT_PAGE_SIZE: usize = 100;

/// One page of current resources of a single type.
#[derive(Debug, Clone, Default)]
pub struct ResourcePage {
    pub resources: Vec<ResourceWrapper>,
    pub continuation: Option<String>,
}

/// Stores clinical resources in the resource collection.
pub struct ResourceStore {
    client: Arc<dyn DocumentClient>,
    collection: CollectionLink,
    max_write_attempts: u32,
    page_size: usize,
}

impl ResourceStore {
    pub fn new(client: Arc<dyn DocumentClient>, collection: CollectionLink) -> Self {
        Self {
            client,
            collection,
            max_write_attempts: DEFAULT_MAX_WRITE_ATTEMPTS,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Bounds the re-read/retry loop of untagged writes that lose a race.
    pub fn with_max_write_attempts(mut self, attempts: u32) -> Self {
        self.max_write_attempts = attempts.max(1);
        self
    }

    /// Page size used by internal scans.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn collection(&self) -> &CollectionLink {
        &self.collection
    }

    pub(crate) fn shared_client(&self) -> Arc<dyn DocumentClient> {
        self.client.clone()
    }

    /// Current time on the store clock.
    pub async fn server_time(&self) -> StorageResult<DateTime<Utc>> {
        Ok(self.client.server_time().await?)
    }

    async fn read_document(
        &self,
        partition_key: &str,
        id: &str,
    ) -> StorageResult<Option<(ResourceDocument, String)>> {
        match self
            .client
            .read_document(&self.collection, partition_key, id)
            .await?
        {
            Some(stored) => Ok(Some((ResourceDocument::from_stored(&stored)?, stored.etag))),
            None => Ok(None),
        }
    }

    /// Writes a new version of `resource`.
    ///
    /// With `expected_tag`, the write only succeeds if the current version
    /// matches it. Without a tag, a write that loses a race re-reads and
    /// tries again, up to the configured attempts, and the last writer wins.
    /// With `keep_history`, the replaced version is kept as a history
    /// document.
    ///
    /// A write is tagged with a generated write id. If a retried write finds
    /// its own write id on the current document, it reports the write as
    /// applied instead of writing again.
    ///
    /// # Errors
    ///
    /// * [`ResourceError::NotFound`] if the resource does not exist and either
    ///   a tag was supplied, creation is not allowed, or `resource` is a
    ///   deletion marker.
    /// * [`ConcurrencyError::VersionConflict`] if the tag does not match the
    ///   current version, or the retry budget ran out.
    pub async fn upsert(
        &self,
        resource: ResourceWrapper,
        expected_tag: Option<&WeakETag>,
        allow_create: bool,
        keep_history: bool,
    ) -> StorageResult<SaveOutcome> {
        let partition_key = resource.partition_key();
        let write_id = Uuid::new_v4().to_string();
        let mut last_seen_version = String::new();

        for attempt in 1..=self.max_write_attempts {
            let current = self.read_document(&partition_key, &resource.id).await?;

            let Some((current, etag)) = current else {
                if resource.is_deleted || expected_tag.is_some() || !allow_create {
                    return Err(not_found(&resource));
                }

                let now = self.client.server_time().await?;
                let document = ResourceDocument::current(&resource, "1".to_string(), now, &write_id);
                match self
                    .client
                    .create_document(&self.collection, document.to_document()?)
                    .await
                {
                    Ok(stored) => {
                        info!(resource = %resource.url(), version = "1", "Resource created");
                        return Ok(SaveOutcome::new(
                            document.into_wrapper(stored.etag),
                            SaveOutcomeType::Created,
                        ));
                    }
                    Err(ClientError::Conflict) => {
                        debug!(resource = %resource.url(), attempt, "Concurrent create, re-reading");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            if current.write_id == write_id {
                debug!(resource = %resource.url(), version = %current.version, "Retried write already applied");
                let outcome = if current.version == "1" {
                    SaveOutcomeType::Created
                } else {
                    SaveOutcomeType::Updated
                };
                return Ok(SaveOutcome::new(current.into_wrapper(etag), outcome));
            }

            if let Some(tag) = expected_tag {
                if tag.version_id() != current.version {
                    return Err(version_conflict(&resource, tag.version_id(), &current.version));
                }
            }

            if resource.is_deleted && current.is_deleted {
                return Ok(SaveOutcome::new(
                    current.into_wrapper(etag),
                    SaveOutcomeType::Unchanged,
                ));
            }

            let version = next_version(&current.version)?;
            if keep_history {
                self.write_history(&current).await?;
            }

            let now = self.client.server_time().await?;
            let document = ResourceDocument::current(&resource, version.clone(), now, &write_id);
            match self
                .client
                .replace_document(&self.collection, document.to_document()?, Some(&etag))
                .await
            {
                Ok(stored) => {
                    info!(resource = %resource.url(), %version, deleted = resource.is_deleted, "Resource updated");
                    return Ok(SaveOutcome::new(
                        document.into_wrapper(stored.etag),
                        SaveOutcomeType::Updated,
                    ));
                }
                Err(ClientError::PreconditionFailed | ClientError::NotFound) => {
                    debug!(resource = %resource.url(), attempt, "Lost write race, re-reading");
                    last_seen_version = current.version;
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(
            resource = %resource.url(),
            attempts = self.max_write_attempts,
            "Write retry budget exhausted"
        );
        Err(version_conflict(
            &resource,
            expected_tag.map(WeakETag::version_id).unwrap_or_default(),
            &last_seen_version,
        ))
    }

    async fn write_history(&self, current: &ResourceDocument) -> StorageResult<()> {
        let history = current.to_history();
        match self
            .client
            .create_document(&self.collection, history.to_document()?)
            .await
        {
            Ok(_) | Err(ClientError::Conflict) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Soft-deletes a resource by writing a deletion marker as its next version.
    ///
    /// Returns `None` if the resource does not exist.
    pub async fn delete(
        &self,
        resource_type: &str,
        id: &str,
        keep_history: bool,
    ) -> StorageResult<Option<SaveOutcome>> {
        let marker = ResourceWrapper::deletion_marker(resource_type, id);
        match self.upsert(marker, None, false, keep_history).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(StorageError::Resource(ResourceError::NotFound { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Reads the current version, or `version` when given.
    ///
    /// # Errors
    ///
    /// * [`ResourceError::NotFound`] if the resource does not exist.
    /// * [`ResourceError::Gone`] if the requested version is a deletion marker.
    /// * [`ResourceError::VersionNotFound`] if the version does not exist.
    pub async fn get(
        &self,
        resource_type: &str,
        id: &str,
        version: Option<&str>,
    ) -> StorageResult<ResourceWrapper> {
        let partition_key = partition_key(resource_type, id);
        let Some((current, etag)) = self.read_document(&partition_key, id).await? else {
            return Err(ResourceError::NotFound {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            }
            .into());
        };

        let (document, etag) = match version {
            None => (current, etag),
            Some(v) if v == current.version => (current, etag),
            Some(v) => self
                .read_document(&partition_key, &history_document_id(id, v))
                .await?
                .ok_or_else(|| ResourceError::VersionNotFound {
                    resource_type: resource_type.to_string(),
                    id: id.to_string(),
                    version_id: v.to_string(),
                })?,
        };

        if document.is_deleted {
            return Err(ResourceError::Gone {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
                version_id: document.version,
            }
            .into());
        }
        Ok(document.into_wrapper(etag))
    }

    /// Permanently removes a resource and all of its history.
    pub async fn hard_delete(&self, resource_type: &str, id: &str) -> StorageResult<()> {
        let partition_key = partition_key(resource_type, id);
        let query = DocumentQuery::new()
            .partition(partition_key.clone())
            .where_eq(FIELD_KIND, DocumentKind::Resource.as_str());

        let mut history = Vec::new();
        let mut current = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .query_documents(&self.collection, &query, continuation.as_deref(), self.page_size)
                .await?;
            for stored in page.documents {
                if stored.id == id {
                    current.push(stored.id);
                } else {
                    history.push(stored.id);
                }
            }
            continuation = page.continuation;
            if continuation.is_none() {
                break;
            }
        }

        let removed = history.len() + current.len();
        // History first: a crash part-way leaves the resource readable.
        for document_id in history.into_iter().chain(current) {
            match self
                .client
                .delete_document(&self.collection, &partition_key, &document_id, None)
                .await
            {
                Ok(()) | Err(ClientError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(resource_type, id, removed, "Resource hard-deleted");
        Ok(())
    }

    /// Rewrites the current document of `resource` with its compartment
    /// indices and search-parameter hash, keeping its version.
    ///
    /// # Errors
    ///
    /// Returns [`ConcurrencyError::DocumentChanged`] if the document was
    /// written since `resource` was read.
    pub async fn update_search_index(
        &self,
        resource: &ResourceWrapper,
    ) -> StorageResult<ResourceWrapper> {
        let Some(etag) = resource.store_etag.as_deref() else {
            return Err(StoreError::Internal {
                message: format!("{} was not read from the store", resource.url()),
            }
            .into());
        };

        let document = ResourceDocument::current(
            resource,
            resource.version.clone(),
            resource.last_modified,
            &Uuid::new_v4().to_string(),
        );
        match self
            .client
            .replace_document(&self.collection, document.to_document()?, Some(etag))
            .await
        {
            Ok(stored) => Ok(document.into_wrapper(stored.etag)),
            Err(ClientError::PreconditionFailed | ClientError::NotFound) => {
                Err(ConcurrencyError::DocumentChanged {
                    resource_type: resource.resource_type.clone(),
                    id: resource.id.clone(),
                }
                .into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reads one page of current, non-deleted resources of `resource_type`.
    pub async fn scan_resources(
        &self,
        resource_type: &str,
        continuation: Option<&str>,
        max_items: usize,
    ) -> StorageResult<ResourcePage> {
        let query = current_resources().where_eq(FIELD_RESOURCE_TYPE, resource_type);
        let page = self
            .client
            .query_documents(&self.collection, &query, continuation, max_items.max(1))
            .await?;

        let resources = page
            .documents
            .into_iter()
            .map(|stored| {
                ResourceDocument::from_stored(&stored).map(|doc| doc.into_wrapper(stored.etag))
            })
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(ResourcePage {
            resources,
            continuation: page.continuation,
        })
    }

    /// Resource types with at least one current, non-deleted resource, sorted.
    pub async fn list_resource_types(&self) -> StorageResult<Vec<String>> {
        let query = current_resources();
        let mut types = BTreeSet::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .query_documents(&self.collection, &query, continuation.as_deref(), self.page_size)
                .await?;
            for stored in &page.documents {
                if let Some(name) = stored.body.get(FIELD_RESOURCE_TYPE).and_then(|v| v.as_str()) {
                    types.insert(name.to_string());
                }
            }
            continuation = page.continuation;
            if continuation.is_none() {
                break;
            }
        }
        Ok(types.into_iter().collect())
    }
}

fn current_resources() -> DocumentQuery {
    DocumentQuery::new()
        .where_eq(FIELD_KIND, DocumentKind::Resource.as_str())
        .where_eq(FIELD_IS_HISTORY, false)
        .where_eq(FIELD_IS_DELETED, false)
}

fn next_version(version: &str) -> StorageResult<String> {
    version
        .parse::<u64>()
        .map(|v| (v + 1).to_string())
        .map_err(|_| {
            StoreError::Internal {
                message: format!("stored version '{version}' is not numeric"),
            }
            .into()
        })
}

fn not_found(resource: &ResourceWrapper) -> StorageError {
    ResourceError::NotFound {
        resource_type: resource.resource_type.clone(),
        id: resource.id.clone(),
    }
    .into()
}

fn version_conflict(
    resource: &ResourceWrapper,
    expected: &str,
    actual: &str,
) -> StorageError {
    ConcurrencyError::VersionConflict {
        resource_type: resource.resource_type.clone(),
        id: resource.id.clone(),
        expected_version: expected.to_string(),
        actual_version: actual.to_string(),
    }
    .into()
}
