//! Resource wrapper types.
//!
//! This module defines [`ResourceWrapper`], which carries a serialized
//! clinical resource together with the metadata the document store keeps
//! beside it: version, timestamps, deletion and history markers, and the
//! compartment indices computed for it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::WeakETag;
use crate::definition::CompartmentType;

/// Owner ids per compartment, e.g. `Patient -> {"p1"}`.
pub type CompartmentIndices = BTreeMap<CompartmentType, BTreeSet<String>>;

/// Serialization format of a raw resource body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceFormat {
    #[default]
    Json,
}

/// A resource body as received from the client, stored verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawResource {
    pub data: String,
    pub format: ResourceFormat,
}

impl RawResource {
    pub fn json(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            format: ResourceFormat::Json,
        }
    }

    /// Serializes a JSON value as the raw body.
    pub fn from_value(value: &Value) -> Self {
        Self::json(value.to_string())
    }

    /// Parses the raw body.
    pub fn parse(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

/// HTTP method that produced a resource version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceMethod {
    /// Resource was created via POST.
    Post,
    /// Resource was created/updated via PUT.
    Put,
    /// Resource was updated via PATCH.
    Patch,
    /// Resource was deleted via DELETE.
    Delete,
}

/// A resource version with persistence metadata.
///
/// # Examples
///
/// ```
/// use helios_docstore::types::{RawResource, ResourceMethod, ResourceWrapper};
///
/// let resource = ResourceWrapper::new(
///     "Patient",
///     "123",
///     RawResource::json(r#"{"resourceType":"Patient","id":"123"}"#),
///     ResourceMethod::Put,
/// );
///
/// assert_eq!(resource.partition_key(), "Patient_123");
/// assert_eq!(resource.url(), "Patient/123");
/// assert!(!resource.is_deleted());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceWrapper {
    pub(crate) resource_type: String,
    pub(crate) id: String,
    /// Empty until the resource has been saved.
    pub(crate) version: String,
    pub(crate) last_modified: DateTime<Utc>,
    pub(crate) raw_resource: RawResource,
    pub(crate) method: Option<ResourceMethod>,
    pub(crate) is_deleted: bool,
    pub(crate) is_history: bool,
    pub(crate) compartment_indices: CompartmentIndices,
    pub(crate) search_parameter_hash: Option<String>,
    /// Store ETag of the document this wrapper was read from.
    pub(crate) store_etag: Option<String>,
}

impl ResourceWrapper {
    /// Creates an unsaved resource.
    pub fn new(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        raw_resource: RawResource,
        method: ResourceMethod,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version: String::new(),
            last_modified: Utc::now(),
            raw_resource,
            method: Some(method),
            is_deleted: false,
            is_history: false,
            compartment_indices: CompartmentIndices::new(),
            search_parameter_hash: None,
            store_etag: None,
        }
    }

    /// Creates an unsaved soft-delete marker.
    pub fn deletion_marker(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        let resource_type = resource_type.into();
        let id = id.into();
        let body = serde_json::json!({ "resourceType": resource_type, "id": id });
        Self {
            is_deleted: true,
            ..Self::new(
                resource_type,
                id,
                RawResource::from_value(&body),
                ResourceMethod::Delete,
            )
        }
    }

    /// Attaches compartment indices and the hash of the definitions they were computed with.
    pub fn with_compartment_indices(
        mut self,
        indices: CompartmentIndices,
        search_parameter_hash: impl Into<String>,
    ) -> Self {
        self.set_compartment_indices(indices, search_parameter_hash);
        self
    }

    pub fn set_compartment_indices(
        &mut self,
        indices: CompartmentIndices,
        search_parameter_hash: impl Into<String>,
    ) {
        self.compartment_indices = indices;
        self.search_parameter_hash = Some(search_parameter_hash.into());
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Version id; empty if the resource has not been saved.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    pub fn raw_resource(&self) -> &RawResource {
        &self.raw_resource
    }

    pub fn method(&self) -> Option<ResourceMethod> {
        self.method
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    pub fn is_history(&self) -> bool {
        self.is_history
    }

    pub fn compartment_indices(&self) -> &CompartmentIndices {
        &self.compartment_indices
    }

    pub fn search_parameter_hash(&self) -> Option<&str> {
        self.search_parameter_hash.as_deref()
    }

    /// Partition holding every version of this resource.
    pub fn partition_key(&self) -> String {
        partition_key(&self.resource_type, &self.id)
    }

    /// Version tag for HTTP responses.
    pub fn weak_etag(&self) -> WeakETag {
        WeakETag::from_version_id(&self.version)
    }

    /// Returns the URL path for this resource (e.g., "Patient/123").
    pub fn url(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }

    /// Returns the versioned URL path (e.g., "Patient/123/_history/1").
    pub fn versioned_url(&self) -> String {
        format!("{}/{}/_history/{}", self.resource_type, self.id, self.version)
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.resource_type, &self.id).with_version(&self.version)
    }
}

/// Partition key of a resource: `"{type}_{id}"`.
pub(crate) fn partition_key(resource_type: &str, id: &str) -> String {
    format!("{resource_type}_{id}")
}

/// Identifies a resource and, optionally, one of its versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: String,
    pub id: String,
    pub version_id: Option<String>,
}

impl ResourceKey {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            version_id: None,
        }
    }

    pub fn with_version(mut self, version_id: impl Into<String>) -> Self {
        let version_id = version_id.into();
        self.version_id = (!version_id.is_empty()).then_some(version_id);
        self
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version_id {
            Some(v) => write!(f, "{}/{}/_history/{}", self.resource_type, self.id, v),
            None => write!(f, "{}/{}", self.resource_type, self.id),
        }
    }
}

/// What a write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcomeType {
    Created,
    Updated,
    /// The write would not have changed anything (e.g. deleting a deleted resource).
    Unchanged,
}

/// The stored resource and what the write did.
#[derive(Debug, Clone)]
pub struct SaveOutcome {
    pub wrapper: ResourceWrapper,
    pub outcome: SaveOutcomeType,
}

impl SaveOutcome {
    pub fn new(wrapper: ResourceWrapper, outcome: SaveOutcomeType) -> Self {
        Self { wrapper, outcome }
    }

    pub fn etag(&self) -> WeakETag {
        self.wrapper.weak_etag()
    }
}
