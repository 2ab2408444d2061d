//! Persisted layout shared by every process talking to the same collection.
//!
//! Each document carries a `kind` discriminator and a `partitionKey`. System
//! documents live in fixed partitions under well-known ids.

use serde::{Deserialize, Serialize};

/// Partition key path of every collection created by this crate.
pub const PARTITION_KEY_PATH: &str = "/partitionKey";

/// Partition of the collection version marker.
pub const COLLECTION_VERSION_PARTITION: &str = "_collectionVersion";

/// Id of the collection version marker.
pub const COLLECTION_VERSION_ID: &str = "collectionversion";

/// Partition of lock documents.
pub const LOCK_PARTITION: &str = "_locks";

/// Partition of reindex job records.
pub const REINDEX_JOB_PARTITION: &str = "_reindexJobs";

/// Partition of identity provider entries in the control-plane collection.
pub const IDENTITY_PROVIDER_PARTITION: &str = "_identityProviders";

/// Partition of role entries in the control-plane collection.
pub const ROLE_PARTITION: &str = "_roles";

/// Discriminator stored in every document's `kind` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Resource,
    System,
    Lock,
    ReindexJob,
    IdentityProvider,
    Role,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Resource => "resource",
            DocumentKind::System => "system",
            DocumentKind::Lock => "lock",
            DocumentKind::ReindexJob => "reindex_job",
            DocumentKind::IdentityProvider => "identity_provider",
            DocumentKind::Role => "role",
        }
    }
}

/// Id of the lock document for `name`.
pub fn lock_document_id(name: &str) -> String {
    format!("lock_{name}")
}

/// Id of the history document holding `version` of resource `id`.
pub fn history_document_id(id: &str, version: &str) -> String {
    format!("{id}_{version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_as_str() {
        for kind in [
            DocumentKind::Resource,
            DocumentKind::System,
            DocumentKind::Lock,
            DocumentKind::ReindexJob,
            DocumentKind::IdentityProvider,
            DocumentKind::Role,
        ] {
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                serde_json::Value::String(kind.as_str().to_string())
            );
        }
    }

    #[test]
    fn test_well_known_ids() {
        assert_eq!(lock_document_id("upgrade-db-fhir"), "lock_upgrade-db-fhir");
        assert_eq!(history_document_id("p1", "3"), "p1_3");
    }
}
