//! Computing search indices for stored resources.

use std::sync::Arc;

use serde_json::Value;

use crate::definition::{CompartmentDefinitions, CompartmentType};
use crate::error::StorageResult;
use crate::types::{CompartmentIndices, ResourceWrapper};

/// Computes the indices the reindex engine writes back to each resource.
pub trait SearchIndexer: Send + Sync {
    /// Identifies the parameter set; a resource indexed with the same hash
    /// is skipped.
    fn search_parameter_hash(&self) -> &str;

    fn extract(&self, resource: &ResourceWrapper) -> StorageResult<CompartmentIndices>;
}

// Search parameters whose element name differs from the parameter name.
const PARAM_ELEMENT_ALIASES: &[(&str, &str)] = &[("patient", "subject")];

/// Derives compartment membership from the references a resource holds.
///
/// For each compartment parameter of the resource type, every `reference`
/// found under the matching element that points at the compartment's owner
/// type (`"Patient/p1"`) adds the owner id to that compartment.
pub struct CompartmentIndexer {
    definitions: Arc<dyn CompartmentDefinitions>,
}

impl CompartmentIndexer {
    pub fn new(definitions: Arc<dyn CompartmentDefinitions>) -> Self {
        Self { definitions }
    }
}

impl SearchIndexer for CompartmentIndexer {
    fn search_parameter_hash(&self) -> &str {
        self.definitions.definitions_hash()
    }

    fn extract(&self, resource: &ResourceWrapper) -> StorageResult<CompartmentIndices> {
        let mut indices = CompartmentIndices::new();
        let Some(params) = self
            .definitions
            .try_get_compartment_search_params(resource.resource_type())
        else {
            return Ok(indices);
        };

        let body = resource.raw_resource().parse()?;
        for (compartment, names) in params {
            for name in names {
                let Some(element) = body.get(element_name(name)) else {
                    continue;
                };
                let mut references = Vec::new();
                collect_references(element, &mut references);
                for reference in references {
                    if let Some(id) = owner_id(reference, *compartment) {
                        indices
                            .entry(*compartment)
                            .or_default()
                            .insert(id.to_string());
                    }
                }
            }
        }
        Ok(indices)
    }
}

fn element_name(param: &str) -> String {
    if let Some((_, element)) = PARAM_ELEMENT_ALIASES.iter().find(|(p, _)| *p == param) {
        return element.to_string();
    }
    let mut name = String::with_capacity(param.len());
    let mut upper = false;
    for c in param.chars() {
        if c == '-' {
            upper = true;
        } else if upper {
            name.extend(c.to_uppercase());
            upper = false;
        } else {
            name.push(c);
        }
    }
    name
}

fn collect_references<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(reference)) = map.get("reference") {
                out.push(reference);
            }
            for (key, nested) in map {
                if key != "reference" {
                    collect_references(nested, out);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, out);
            }
        }
        _ => {}
    }
}

fn owner_id(reference: &str, compartment: CompartmentType) -> Option<&str> {
    let (resource_type, id) = reference.rsplit_once('/')?;
    let resource_type = resource_type.rsplit('/').next()?;
    (resource_type == compartment.resource_type() && !id.is_empty()).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::CompartmentDefinitionManager;
    use crate::types::{RawResource, ResourceMethod};
    use serde_json::json;

    fn indexer() -> CompartmentIndexer {
        CompartmentIndexer::new(Arc::new(CompartmentDefinitionManager::load_bundled().unwrap()))
    }

    fn wrap(resource_type: &str, body: Value) -> ResourceWrapper {
        ResourceWrapper::new(resource_type, "x", RawResource::from_value(&body), ResourceMethod::Put)
    }

    #[test]
    fn test_element_name() {
        assert_eq!(element_name("subject"), "subject");
        assert_eq!(element_name("general-practitioner"), "generalPractitioner");
        assert_eq!(element_name("patient"), "subject");
    }

    #[test]
    fn test_owner_id() {
        assert_eq!(owner_id("Patient/p1", CompartmentType::Patient), Some("p1"));
        assert_eq!(
            owner_id("http://example.org/fhir/Patient/p1", CompartmentType::Patient),
            Some("p1")
        );
        assert_eq!(owner_id("Device/d1", CompartmentType::Patient), None);
        assert_eq!(owner_id("p1", CompartmentType::Patient), None);
    }

    #[test]
    fn test_observation_compartments() {
        let observation = wrap(
            "Observation",
            json!({
                "resourceType": "Observation",
                "subject": {"reference": "Patient/p1"},
                "encounter": {"reference": "Encounter/e1"},
                "performer": [
                    {"reference": "Practitioner/dr1"},
                    {"reference": "Patient/p2"}
                ]
            }),
        );

        let indices = indexer().extract(&observation).unwrap();
        let patients: Vec<_> = indices[&CompartmentType::Patient].iter().cloned().collect();
        assert_eq!(patients, vec!["p1", "p2"]);
        assert!(indices[&CompartmentType::Encounter].contains("e1"));
        assert!(indices[&CompartmentType::Practitioner].contains("dr1"));
        assert!(!indices.contains_key(&CompartmentType::Device));
    }

    #[test]
    fn test_nested_participant_references() {
        let encounter = wrap(
            "Encounter",
            json!({
                "resourceType": "Encounter",
                "participant": [{"individual": {"reference": "RelatedPerson/rp1"}}]
            }),
        );
        let indices = indexer().extract(&encounter).unwrap();
        assert!(indices[&CompartmentType::RelatedPerson].contains("rp1"));
    }

    #[test]
    fn test_unsupported_type_has_no_indices() {
        let basic = wrap("Basic", json!({"resourceType": "Basic"}));
        assert!(indexer().extract(&basic).unwrap().is_empty());
    }
}
