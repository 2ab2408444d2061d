//! Persisted shape of resource documents.
//!
//! The current version of a resource lives under its logical id; history
//! versions live beside it in the same partition under `"{id}_{version}"`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::{Document, StoredDocument};
use crate::error::StorageResult;
use crate::layout::{DocumentKind, history_document_id};
use crate::types::{CompartmentIndices, RawResource, ResourceMethod, ResourceWrapper};

pub(crate) const FIELD_KIND: &str = "kind";
pub(crate) const FIELD_RESOURCE_TYPE: &str = "resourceTypeName";
pub(crate) const FIELD_IS_HISTORY: &str = "isHistory";
pub(crate) const FIELD_IS_DELETED: &str = "isDeleted";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RequestMetadata {
    pub method: ResourceMethod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ResourceDocument {
    pub id: String,
    pub partition_key: String,
    pub kind: DocumentKind,
    pub resource_type_name: String,
    pub resource_id: String,
    pub version: String,
    pub last_modified: DateTime<Utc>,
    pub raw_resource: RawResource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestMetadata>,
    pub is_deleted: bool,
    pub is_history: bool,
    #[serde(default)]
    pub compartment_indices: CompartmentIndices,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_parameter_hash: Option<String>,
    /// Client-generated id of the write that produced this document.
    pub write_id: String,
}

impl ResourceDocument {
    /// Builds the current document for `resource` at `version`.
    pub fn current(
        resource: &ResourceWrapper,
        version: String,
        last_modified: DateTime<Utc>,
        write_id: &str,
    ) -> Self {
        Self {
            id: resource.id.clone(),
            partition_key: resource.partition_key(),
            kind: DocumentKind::Resource,
            resource_type_name: resource.resource_type.clone(),
            resource_id: resource.id.clone(),
            version,
            last_modified,
            raw_resource: resource.raw_resource.clone(),
            request: resource.method.map(|method| RequestMetadata { method }),
            is_deleted: resource.is_deleted,
            is_history: false,
            compartment_indices: resource.compartment_indices.clone(),
            search_parameter_hash: resource.search_parameter_hash.clone(),
            write_id: write_id.to_string(),
        }
    }

    /// Copy of this document stored as a history version.
    pub fn to_history(&self) -> Self {
        Self {
            id: history_document_id(&self.resource_id, &self.version),
            is_history: true,
            ..self.clone()
        }
    }

    pub fn from_stored(stored: &StoredDocument) -> StorageResult<Self> {
        Ok(stored.deserialize()?)
    }

    pub fn to_document(&self) -> StorageResult<Document> {
        Ok(Document::from_serializable(
            self.id.clone(),
            self.partition_key.clone(),
            self,
        )?)
    }

    pub fn into_wrapper(self, store_etag: String) -> ResourceWrapper {
        ResourceWrapper {
            resource_type: self.resource_type_name,
            id: self.resource_id,
            version: self.version,
            last_modified: self.last_modified,
            raw_resource: self.raw_resource,
            method: self.request.map(|r| r.method),
            is_deleted: self.is_deleted,
            is_history: self.is_history,
            compartment_indices: self.compartment_indices,
            search_parameter_hash: self.search_parameter_hash,
            store_etag: Some(store_etag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::CompartmentType;
    use serde_json::json;

    fn observation() -> ResourceWrapper {
        let mut indices = CompartmentIndices::new();
        indices
            .entry(CompartmentType::Patient)
            .or_default()
            .insert("p1".to_string());
        ResourceWrapper::new(
            "Observation",
            "o1",
            RawResource::json(r#"{"resourceType":"Observation","id":"o1"}"#),
            ResourceMethod::Put,
        )
        .with_compartment_indices(indices, "hash")
    }

    #[test]
    fn test_persisted_field_names() {
        let doc = ResourceDocument::current(&observation(), "1".to_string(), Utc::now(), "w1");
        let body = serde_json::to_value(&doc).unwrap();

        assert_eq!(body["id"], json!("o1"));
        assert_eq!(body["partitionKey"], json!("Observation_o1"));
        assert_eq!(body[FIELD_KIND], json!("resource"));
        assert_eq!(body[FIELD_RESOURCE_TYPE], json!("Observation"));
        assert_eq!(body[FIELD_IS_HISTORY], json!(false));
        assert_eq!(body[FIELD_IS_DELETED], json!(false));
        assert_eq!(body["request"]["method"], json!("PUT"));
        assert_eq!(body["compartmentIndices"]["Patient"], json!(["p1"]));
    }

    #[test]
    fn test_history_copy() {
        let doc = ResourceDocument::current(&observation(), "3".to_string(), Utc::now(), "w1");
        let history = doc.to_history();
        assert_eq!(history.id, "o1_3");
        assert_eq!(history.partition_key, doc.partition_key);
        assert!(history.is_history);

        let wrapper = history.into_wrapper("\"etag\"".to_string());
        assert_eq!(wrapper.id(), "o1");
        assert_eq!(wrapper.version(), "3");
        assert!(wrapper.is_history());
    }
}
