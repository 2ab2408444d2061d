//! Compartment definitions.
//!
//! The catalog is built once from the bundled compartment-definition bundle
//! and is read-only afterwards. Components receive it as
//! `Arc<dyn CompartmentDefinitions>` rather than reaching for global state.
//!
//! # Examples
//!
//! ```
//! use helios_docstore::definition::{
//!     CompartmentDefinitionManager, CompartmentDefinitions, CompartmentType,
//! };
//!
//! let manager = CompartmentDefinitionManager::load_bundled().unwrap();
//! let params = manager.get_compartment_search_params("Observation").unwrap();
//! assert!(params[&CompartmentType::Patient].contains(&"subject".to_string()));
//!
//! assert!(manager.try_get_compartment_search_params("Basic").is_none());
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{DefinitionError, StorageResult};

const BUNDLED_DEFINITIONS: &str = include_str!("compartment.json");

/// The compartments a resource can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CompartmentType {
    Patient,
    Encounter,
    RelatedPerson,
    Practitioner,
    Device,
}

impl CompartmentType {
    /// All compartment types.
    pub const ALL: [CompartmentType; 5] = [
        CompartmentType::Patient,
        CompartmentType::Encounter,
        CompartmentType::RelatedPerson,
        CompartmentType::Practitioner,
        CompartmentType::Device,
    ];

    /// The resource type that owns this compartment.
    pub fn resource_type(&self) -> &'static str {
        match self {
            CompartmentType::Patient => "Patient",
            CompartmentType::Encounter => "Encounter",
            CompartmentType::RelatedPerson => "RelatedPerson",
            CompartmentType::Practitioner => "Practitioner",
            CompartmentType::Device => "Device",
        }
    }
}

impl fmt::Display for CompartmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.resource_type())
    }
}

impl FromStr for CompartmentType {
    type Err = DefinitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        resource_type_to_compartment_type()
            .get(s)
            .copied()
            .ok_or_else(|| DefinitionError::ResourceNotSupported {
                resource_type: s.to_string(),
            })
    }
}

static RESOURCE_TO_COMPARTMENT: LazyLock<HashMap<&'static str, CompartmentType>> =
    LazyLock::new(|| {
        CompartmentType::ALL
            .iter()
            .map(|c| (c.resource_type(), *c))
            .collect()
    });

static COMPARTMENT_TO_RESOURCE: LazyLock<HashMap<CompartmentType, &'static str>> =
    LazyLock::new(|| {
        CompartmentType::ALL
            .iter()
            .map(|c| (*c, c.resource_type()))
            .collect()
    });

/// Maps a compartment-owning resource type to its compartment.
pub fn resource_type_to_compartment_type() -> &'static HashMap<&'static str, CompartmentType> {
    &RESOURCE_TO_COMPARTMENT
}

/// Maps a compartment to the resource type that owns it.
pub fn compartment_type_to_resource_type() -> &'static HashMap<CompartmentType, &'static str> {
    &COMPARTMENT_TO_RESOURCE
}

/// Search parameters linking one resource type to each compartment it belongs to.
pub type CompartmentSearchParams = BTreeMap<CompartmentType, BTreeSet<String>>;

/// Read-only access to compartment definitions.
pub trait CompartmentDefinitions: Send + Sync {
    /// Returns the compartment search parameters for `resource_type`.
    ///
    /// # Errors
    ///
    /// Returns [`DefinitionError::ResourceNotSupported`] if the resource type
    /// does not belong to any compartment.
    fn get_compartment_search_params(
        &self,
        resource_type: &str,
    ) -> StorageResult<&CompartmentSearchParams>;

    /// Like [`get_compartment_search_params`](Self::get_compartment_search_params),
    /// returning `None` for unsupported resource types.
    fn try_get_compartment_search_params(
        &self,
        resource_type: &str,
    ) -> Option<&CompartmentSearchParams>;

    /// Hash identifying this set of definitions.
    fn definitions_hash(&self) -> &str;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DefinitionBundle {
    resource_type: String,
    #[serde(default)]
    entry: Vec<BundleEntry>,
}

#[derive(Debug, Deserialize)]
struct BundleEntry {
    resource: CompartmentDefinitionResource,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompartmentDefinitionResource {
    resource_type: String,
    code: String,
    #[serde(default)]
    resource: Vec<CompartmentResource>,
}

#[derive(Debug, Deserialize)]
struct CompartmentResource {
    code: String,
    #[serde(default)]
    param: Vec<String>,
}

/// Compartment catalog built from a compartment-definition bundle.
#[derive(Debug, Clone)]
pub struct CompartmentDefinitionManager {
    search_params: HashMap<String, CompartmentSearchParams>,
    hash: String,
}

impl CompartmentDefinitionManager {
    /// Loads the definitions embedded in this crate.
    pub fn load_bundled() -> StorageResult<Self> {
        Self::from_bundle_json(BUNDLED_DEFINITIONS)
    }

    /// Builds the catalog from a `Bundle` of `CompartmentDefinition` resources.
    pub fn from_bundle_json(json: &str) -> StorageResult<Self> {
        let invalid = |message: String| DefinitionError::InvalidDefinition { message };

        let bundle: DefinitionBundle =
            serde_json::from_str(json).map_err(|e| invalid(e.to_string()))?;
        if bundle.resource_type != "Bundle" {
            return Err(invalid(format!("expected a Bundle, found {}", bundle.resource_type)).into());
        }

        let mut seen = Vec::new();
        let mut search_params: HashMap<String, CompartmentSearchParams> = HashMap::new();

        for entry in bundle.entry {
            let definition = entry.resource;
            if definition.resource_type != "CompartmentDefinition" {
                return Err(invalid(format!(
                    "unexpected {} entry in compartment bundle",
                    definition.resource_type
                ))
                .into());
            }

            let compartment: CompartmentType = definition.code.parse().map_err(|_| {
                invalid(format!("unknown compartment code '{}'", definition.code))
            })?;
            if seen.contains(&compartment) {
                return Err(invalid(format!("compartment {compartment} defined twice")).into());
            }
            seen.push(compartment);

            for resource in definition.resource {
                if resource.param.is_empty() {
                    continue;
                }
                search_params
                    .entry(resource.code)
                    .or_default()
                    .insert(compartment, resource.param.into_iter().collect());
            }
        }

        Ok(Self {
            search_params,
            hash: hex::encode(Sha256::digest(json.as_bytes())),
        })
    }

    /// Resource types that belong to at least one compartment.
    pub fn resource_types(&self) -> impl Iterator<Item = &str> {
        self.search_params.keys().map(String::as_str)
    }
}

impl CompartmentDefinitions for CompartmentDefinitionManager {
    fn get_compartment_search_params(
        &self,
        resource_type: &str,
    ) -> StorageResult<&CompartmentSearchParams> {
        self.try_get_compartment_search_params(resource_type)
            .ok_or_else(|| {
                DefinitionError::ResourceNotSupported {
                    resource_type: resource_type.to_string(),
                }
                .into()
            })
    }

    fn try_get_compartment_search_params(
        &self,
        resource_type: &str,
    ) -> Option<&CompartmentSearchParams> {
        self.search_params.get(resource_type)
    }

    fn definitions_hash(&self) -> &str {
        &self.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    #[test]
    fn test_static_maps_are_inverse() {
        for compartment in CompartmentType::ALL {
            let resource_type = compartment_type_to_resource_type()[&compartment];
            assert_eq!(resource_type_to_compartment_type()[resource_type], compartment);
        }
        assert_eq!(
            resource_type_to_compartment_type()["RelatedPerson"],
            CompartmentType::RelatedPerson
        );
    }

    #[test]
    fn test_bundled_definitions_load() {
        let manager = CompartmentDefinitionManager::load_bundled().unwrap();

        let observation = manager.get_compartment_search_params("Observation").unwrap();
        assert_eq!(
            observation[&CompartmentType::Encounter],
            BTreeSet::from(["encounter".to_string()])
        );
        assert!(observation.contains_key(&CompartmentType::Device));

        let encounter = manager.get_compartment_search_params("Encounter").unwrap();
        assert!(encounter.contains_key(&CompartmentType::Practitioner));
        assert!(encounter.contains_key(&CompartmentType::RelatedPerson));
    }

    #[test]
    fn test_unsupported_resource_type() {
        let manager = CompartmentDefinitionManager::load_bundled().unwrap();
        let err = manager.get_compartment_search_params("Basic").unwrap_err();
        assert!(matches!(
            err,
            StorageError::Definition(DefinitionError::ResourceNotSupported { .. })
        ));
        assert!(manager.try_get_compartment_search_params("Basic").is_none());
    }

    #[test]
    fn test_hash_is_stable() {
        let a = CompartmentDefinitionManager::load_bundled().unwrap();
        let b = CompartmentDefinitionManager::load_bundled().unwrap();
        assert_eq!(a.definitions_hash(), b.definitions_hash());
        assert_eq!(a.definitions_hash().len(), 64);
    }

    #[test]
    fn test_duplicate_compartment_rejected() {
        let json = r#"{
            "resourceType": "Bundle",
            "entry": [
                {"resource": {"resourceType": "CompartmentDefinition", "code": "Device", "resource": []}},
                {"resource": {"resourceType": "CompartmentDefinition", "code": "Device", "resource": []}}
            ]
        }"#;
        assert!(CompartmentDefinitionManager::from_bundle_json(json).is_err());
    }

    #[test]
    fn test_repeated_params_collapse() {
        let json = r#"{
            "resourceType": "Bundle",
            "entry": [
                {"resource": {"resourceType": "CompartmentDefinition", "code": "Patient", "resource": [
                    {"code": "Observation", "param": ["subject", "performer", "subject"]}
                ]}}
            ]
        }"#;
        let manager = CompartmentDefinitionManager::from_bundle_json(json).unwrap();
        let params = manager.get_compartment_search_params("Observation").unwrap();
        assert_eq!(
            params[&CompartmentType::Patient],
            BTreeSet::from(["performer".to_string(), "subject".to_string()])
        );
    }

    #[test]
    fn test_unknown_compartment_rejected() {
        let json = r#"{
            "resourceType": "Bundle",
            "entry": [
                {"resource": {"resourceType": "CompartmentDefinition", "code": "Organization"}}
            ]
        }"#;
        assert!(CompartmentDefinitionManager::from_bundle_json(json).is_err());
    }
}
