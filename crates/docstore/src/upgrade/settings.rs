use async_trait::async_trait;
use tracing::{debug, info};

use super::CollectionUpdater;
use crate::client::{CollectionLink, DocumentClient};
use crate::error::{StorageResult, StoreError};

/// Path of the raw resource body, which is never queried.
pub const RAW_RESOURCE_PATH: &str = "/rawResource/*";

/// Collection version 1: expiry and indexing settings, provisioned throughput.
///
/// Disables the default time-to-live, keeps the raw resource body out of the
/// index, and raises throughput to the configured initial value when the
/// collection has less.
pub struct CollectionSettingsUpdater {
    initial_throughput: Option<u32>,
}

impl CollectionSettingsUpdater {
    pub fn new(initial_throughput: Option<u32>) -> Self {
        Self { initial_throughput }
    }
}

#[async_trait]
impl CollectionUpdater for CollectionSettingsUpdater {
    fn version(&self) -> u32 {
        1
    }

    fn name(&self) -> &str {
        "collection-settings"
    }

    async fn execute(
        &self,
        client: &dyn DocumentClient,
        collection: &CollectionLink,
    ) -> StorageResult<()> {
        let current = client
            .read_collection(collection)
            .await?
            .ok_or_else(|| StoreError::CollectionMissing {
                collection: collection.to_string(),
            })?;

        let mut desired = current.clone();
        desired.default_ttl = None;
        if !desired
            .indexing_policy
            .excluded_paths
            .iter()
            .any(|p| p == RAW_RESOURCE_PATH)
        {
            desired
                .indexing_policy
                .excluded_paths
                .push(RAW_RESOURCE_PATH.to_string());
        }
        if let Some(initial) = self.initial_throughput {
            if desired.throughput.is_none_or(|t| t < initial) {
                desired.throughput = Some(initial);
            }
        }

        if desired == current {
            debug!(%collection, "Collection settings already current");
            return Ok(());
        }

        client.replace_collection(collection, &desired).await?;
        info!(%collection, throughput = ?desired.throughput, "Collection settings updated");
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
    async fn test_settings_applied_once() {
        let client = InMemoryDocumentClient::new();
        let link = CollectionLink::new("db", "fhir");
        client.create_database_if_not_exists("db", None).await.unwrap();
        let mut settings = CollectionSettings::new(PARTITION_KEY_PATH).with_throughput(Some(400));
        settings.default_ttl = Some(3600);
        client
            .create_collection_if_not_exists(&link, &settings)
            .await
            .unwrap();

        let updater = CollectionSettingsUpdater::new(Some(1000));
        updater.execute(&client, &link).await.unwrap();
        updater.execute(&client, &link).await.unwrap();

        let updated = client.read_collection(&link).await.unwrap().unwrap();
        assert_eq!(updated.default_ttl, None);
        assert_eq!(updated.throughput, Some(1000));
        assert!(updated
            .indexing_policy
            .excluded_paths
            .contains(&RAW_RESOURCE_PATH.to_string()));
        assert_eq!(client.request_count(OperationKind::ReplaceCollection), 1);
    }

    #[tokio::test]
    async fn test_throughput_never_lowered() {
        let client = InMemoryDocumentClient::new();
        let link = CollectionLink::new("db", "fhir");
        client.create_database_if_not_exists("db", None).await.unwrap();
        client
            .create_collection_if_not_exists(
                &link,
                &CollectionSettings::new(PARTITION_KEY_PATH).with_throughput(Some(5000)),
            )
            .await
            .unwrap();

        CollectionSettingsUpdater::new(Some(1000))
            .execute(&client, &link)
            .await
            .unwrap();

        let updated = client.read_collection(&link).await.unwrap().unwrap();
        assert_eq!(updated.throughput, Some(5000));
    }
}
