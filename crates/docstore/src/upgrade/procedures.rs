use async_trait::async_trait;
use tracing::{debug, info};

use super::CollectionUpdater;
use crate::client::{CollectionLink, DocumentClient, StoredProcedure};
use crate::error::StorageResult;

/// A server-side procedure shipped with this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcedureDefinition {
    pub id: &'static str,
    pub body: &'static str,
}

/// Procedures installed on the resource collection.
pub const BUNDLED_PROCEDURES: &[ProcedureDefinition] = &[
    ProcedureDefinition {
        id: "hardDelete",
        body: include_str!("procedures/hard_delete.js"),
    },
    ProcedureDefinition {
        id: "replaceSingleResource",
        body: include_str!("procedures/replace_single_resource.js"),
    },
];

/// Collection version 2: installs server-side procedures.
///
/// A procedure is written when it is missing or its body differs from the
/// bundled one.
pub struct StoredProcedureInstaller {
    procedures: Vec<ProcedureDefinition>,
}

impl StoredProcedureInstaller {
    pub fn new() -> Self {
        Self::with_procedures(BUNDLED_PROCEDURES.to_vec())
    }

    pub fn with_procedures(procedures: Vec<ProcedureDefinition>) -> Self {
        Self { procedures }
    }
}

impl Default for StoredProcedureInstaller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CollectionUpdater for StoredProcedureInstaller {
    fn version(&self) -> u32 {
        2
    }

    fn name(&self) -> &str {
        "stored-procedures"
    }

    async fn execute(
        &self,
        client: &dyn DocumentClient,
        collection: &CollectionLink,
    ) -> StorageResult<()> {
        for procedure in &self.procedures {
            let existing = client.read_stored_procedure(collection, procedure.id).await?;
            if existing.as_ref().is_some_and(|p| p.body == procedure.body) {
                debug!(%collection, procedure = procedure.id, "Stored procedure already installed");
                continue;
            }

            client
                .upsert_stored_procedure(
                    collection,
                    &StoredProcedure {
                        id: procedure.id.to_string(),
                        body: procedure.body.to_string(),
                    },
                )
                .await?;
            info!(%collection, procedure = procedure.id, "Stored procedure installed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::{InMemoryDocumentClient, OperationKind};
    use crate::client::CollectionSettings;
    use crate::layout::PARTITION_KEY_PATH;

    #[tokio::test]
    async fn test_installs_missing_and_changed_procedures() {
        let client = InMemoryDocumentClient::new();
        let link = CollectionLink::new("db", "fhir");
        client.create_database_if_not_exists("db", None).await.unwrap();
        client
            .create_collection_if_not_exists(&link, &CollectionSettings::new(PARTITION_KEY_PATH))
            .await
            .unwrap();
        client
            .upsert_stored_procedure(
                &link,
                &StoredProcedure {
                    id: "hardDelete".to_string(),
                    body: "function hardDelete() {}".to_string(),
                },
            )
            .await
            .unwrap();

        let installer = StoredProcedureInstaller::new();
        installer.execute(&client, &link).await.unwrap();
        assert_eq!(client.request_count(OperationKind::UpsertStoredProcedure), 3);

        installer.execute(&client, &link).await.unwrap();
        assert_eq!(client.request_count(OperationKind::UpsertStoredProcedure), 3);

        for procedure in BUNDLED_PROCEDURES {
            let installed = client
                .read_stored_procedure(&link, procedure.id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(installed.body, procedure.body);
        }
    }
}
