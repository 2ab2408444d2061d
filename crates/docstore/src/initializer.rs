//! Store startup.
//!
//! Brings the database and both collections into shape and hands out the
//! components that use them. Nothing is ready until every step succeeded.

use std::sync::Arc;

use tracing::info;

use crate::client::{CollectionLink, CollectionSettings, DocumentClient, RetryPolicy, RetryingClient};
use crate::config::DataStoreConfig;
use crate::control_plane::DocumentRbacService;
use crate::error::{StorageResult, StoreError};
use crate::layout::{COLLECTION_VERSION_ID, COLLECTION_VERSION_PARTITION, PARTITION_KEY_PATH};
use crate::store::ResourceStore;
use crate::upgrade::{
    CollectionSettingsUpdater, CollectionUpdater, CollectionUpgradeManager,
    StoredProcedureInstaller, UpgradeReport,
};

/// Components ready for traffic.
pub struct InitializedStore {
    /// Client with the retry policy applied.
    pub client: Arc<dyn DocumentClient>,
    pub resource_store: Arc<ResourceStore>,
    pub rbac: Arc<DocumentRbacService>,
    /// Upgrade result of the resource collection.
    pub fhir_upgrade: UpgradeReport,
    /// Upgrade result of the control-plane collection.
    pub control_plane_upgrade: UpgradeReport,
}

/// Creates and upgrades the database and collections named by a
/// [`DataStoreConfig`].
pub struct StoreInitializer {
    client: Arc<dyn DocumentClient>,
    config: DataStoreConfig,
}

impl StoreInitializer {
    /// `client` is the raw store client; the configured retry policy is
    /// applied on top of it.
    pub fn new(client: Arc<dyn DocumentClient>, config: DataStoreConfig) -> Self {
        Self { client, config }
    }

    pub fn fhir_collection(&self) -> CollectionLink {
        CollectionLink::new(&self.config.database_id, &self.config.fhir_collection_id)
    }

    pub fn control_plane_collection(&self) -> CollectionLink {
        CollectionLink::new(
            &self.config.database_id,
            &self.config.control_plane_collection_id,
        )
    }

    /// Runs startup.
    ///
    /// 1. Creates the database if it is missing and creation is allowed.
    /// 2. Creates the resource collection and applies its upgrades.
    /// 3. Creates the control-plane collection and applies its upgrades.
    /// 4. Reads the collection version marker back as a connectivity probe.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, a missing database when creation is
    /// disabled, an upgrade failure, or an exhausted retry budget.
    pub async fn initialize(&self) -> StorageResult<InitializedStore> {
        self.config.validate()?;
        let config = &self.config;
        let client: Arc<dyn DocumentClient> = Arc::new(RetryingClient::new(
            self.client.clone(),
            RetryPolicy::new(config.retry.clone()),
        ));

        info!(host = %config.host, database = %config.database_id, "Initializing document store");
        if config.allow_database_creation {
            let created = client
                .create_database_if_not_exists(&config.database_id, config.initial_database_throughput)
                .await?;
            if created {
                info!(database = %config.database_id, "Database created");
            }
        } else if !client.database_exists(&config.database_id).await? {
            return Err(StoreError::DatabaseMissing {
                database_id: config.database_id.clone(),
            }
            .into());
        }

        let fhir = self.fhir_collection();
        self.ensure_collection(
            client.as_ref(),
            &fhir,
            config.initial_fhir_collection_throughput,
        )
        .await?;
        let fhir_upgrade = CollectionUpgradeManager::new(
            client.clone(),
            vec![
                Arc::new(CollectionSettingsUpdater::new(
                    config.initial_fhir_collection_throughput,
                )) as Arc<dyn CollectionUpdater>,
                Arc::new(StoredProcedureInstaller::new()),
            ],
            config.lock.clone(),
            config.upgrade_lock_attempts,
        )?
        .setup_collection(&fhir)
        .await?;

        let control_plane = self.control_plane_collection();
        self.ensure_collection(
            client.as_ref(),
            &control_plane,
            config.initial_control_plane_collection_throughput,
        )
        .await?;
        let control_plane_upgrade = CollectionUpgradeManager::new(
            client.clone(),
            vec![Arc::new(CollectionSettingsUpdater::new(
                config.initial_control_plane_collection_throughput,
            )) as Arc<dyn CollectionUpdater>],
            config.lock.clone(),
            config.upgrade_lock_attempts,
        )?
        .setup_collection(&control_plane)
        .await?;

        self.probe(client.as_ref(), &fhir).await?;

        info!(
            fhir_version = fhir_upgrade.version,
            control_plane_version = control_plane_upgrade.version,
            "Document store initialized"
        );

        let resource_store = ResourceStore::new(client.clone(), fhir)
            .with_max_write_attempts(config.max_write_attempts)
            .with_page_size(config.data_migration_batch_size);
        let rbac = DocumentRbacService::new(client.clone(), control_plane);

        Ok(InitializedStore {
            client,
            resource_store: Arc::new(resource_store),
            rbac: Arc::new(rbac),
            fhir_upgrade,
            control_plane_upgrade,
        })
    }

    async fn ensure_collection(
        &self,
        client: &dyn DocumentClient,
        collection: &CollectionLink,
        throughput: Option<u32>,
    ) -> StorageResult<()> {
        let settings = CollectionSettings::new(PARTITION_KEY_PATH).with_throughput(throughput);
        if client
            .create_collection_if_not_exists(collection, &settings)
            .await?
        {
            info!(%collection, "Collection created");
        }
        Ok(())
    }

    // An upgraded collection always has a marker; reading it exercises the
    // same path as resource traffic.
    async fn probe(&self, client: &dyn DocumentClient, collection: &CollectionLink) -> StorageResult<()> {
        let marker = client
            .read_document(collection, COLLECTION_VERSION_PARTITION, COLLECTION_VERSION_ID)
            .await?;
        if marker.is_none() {
            return Err(StoreError::Internal {
                message: format!("collection version marker missing in {collection}"),
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::InMemoryDocumentClient;
    use crate::error::StorageError;

    #[tokio::test]
    async fn test_initialize_creates_everything() {
        let memory = InMemoryDocumentClient::new();
        let initializer = StoreInitializer::new(Arc::new(memory.clone()), DataStoreConfig::default());

        let store = initializer.initialize().await.unwrap();
        assert_eq!(store.fhir_upgrade.applied, vec![1, 2]);
        assert_eq!(store.control_plane_upgrade.applied, vec![1]);
        assert!(memory.database_exists("health").await.unwrap());

        let settings = memory
            .read_collection(&initializer.fhir_collection())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settings.partition_key_path, PARTITION_KEY_PATH);
        assert!(
            memory
                .read_stored_procedure(&initializer.fhir_collection(), "hardDelete")
                .await
                .unwrap()
                .is_some()
        );

        // A second start finds everything current.
        let again = initializer.initialize().await.unwrap();
        assert!(again.fhir_upgrade.applied.is_empty());
        assert_eq!(again.fhir_upgrade.version, 2);
    }

    #[tokio::test]
    async fn test_missing_database_without_creation() {
        let config = DataStoreConfig {
            allow_database_creation: false,
            ..Default::default()
        };
        let initializer = StoreInitializer::new(Arc::new(InMemoryDocumentClient::new()), config);
        let err = initializer.initialize().await.err().unwrap();
        assert!(matches!(
            err,
            StorageError::Store(StoreError::DatabaseMissing { .. })
        ));
    }
}
