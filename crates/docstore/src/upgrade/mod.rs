//! Collection upgrades.
//!
//! A collection carries a version marker. Each [`CollectionUpdater`]
//! declares the version it brings the collection to; the
//! [`CollectionUpgradeManager`] applies the pending ones in ascending order,
//! one process at a time, under a distributed lock. The marker is written
//! after each step, so an interrupted pass resumes at the first step that
//! did not complete.

mod procedures;
mod settings;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client::{ClientError, CollectionLink, Document, DocumentClient, StoredDocument};
use crate::config::LockConfig;
use crate::error::{ConcurrencyError, StorageError, StorageResult, UpgradeError};
use crate::layout::{COLLECTION_VERSION_ID, COLLECTION_VERSION_PARTITION, DocumentKind};
use crate::lock::{DistributedLock, LockToken};

pub use procedures::{BUNDLED_PROCEDURES, ProcedureDefinition, StoredProcedureInstaller};
pub use settings::CollectionSettingsUpdater;

/// One idempotent step of a collection upgrade.
#[async_trait]
pub trait CollectionUpdater: Send + Sync {
    /// The collection version this step brings the collection to.
    fn version(&self) -> u32;

    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Applies the step. Must be safe to run again after a partial run.
    async fn execute(
        &self,
        client: &dyn DocumentClient,
        collection: &CollectionLink,
    ) -> StorageResult<()>;
}

/// The singleton document recording the highest applied upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionVersionMarker {
    pub version: u32,
    /// Fencing token of the lock holder that wrote the marker.
    pub fencing_token: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkerDocument {
    id: String,
    partition_key: String,
    kind: DocumentKind,
    #[serde(flatten)]
    marker: CollectionVersionMarker,
}

/// What an upgrade pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeReport {
    /// Versions applied by this pass, in order.
    pub applied: Vec<u32>,
    /// Marker version after the pass.
    pub version: u32,
}

/// Applies pending [`CollectionUpdater`]s to a collection under a distributed lock.
pub struct CollectionUpgradeManager {
    client: Arc<dyn DocumentClient>,
    updaters: Vec<Arc<dyn CollectionUpdater>>,
    lock_config: LockConfig,
    lock_attempts: u32,
}

impl CollectionUpgradeManager {
    /// Creates a manager for `updaters`, which may be given in any order.
    ///
    /// # Errors
    ///
    /// Returns [`UpgradeError::DuplicateVersion`] if two updaters share a version.
    pub fn new(
        client: Arc<dyn DocumentClient>,
        mut updaters: Vec<Arc<dyn CollectionUpdater>>,
        lock_config: LockConfig,
        lock_attempts: u32,
    ) -> StorageResult<Self> {
        updaters.sort_by_key(|u| u.version());
        if let Some(pair) = updaters.windows(2).find(|w| w[0].version() == w[1].version()) {
            return Err(UpgradeError::DuplicateVersion {
                version: pair[0].version(),
            }
            .into());
        }

        Ok(Self {
            client,
            updaters,
            lock_config,
            lock_attempts: lock_attempts.max(1),
        })
    }

    /// Highest version declared by the updaters.
    pub fn latest_version(&self) -> u32 {
        self.updaters.last().map(|u| u.version()).unwrap_or(0)
    }

    /// Reads the collection version marker.
    pub async fn read_marker(
        &self,
        collection: &CollectionLink,
    ) -> StorageResult<Option<(CollectionVersionMarker, String)>> {
        let stored = self
            .client
            .read_document(collection, COLLECTION_VERSION_PARTITION, COLLECTION_VERSION_ID)
            .await?;
        match stored {
            Some(stored) => {
                let document: MarkerDocument = stored.deserialize()?;
                Ok(Some((document.marker, stored.etag)))
            }
            None => Ok(None),
        }
    }

    async fn current_version(&self, collection: &CollectionLink) -> StorageResult<u32> {
        Ok(self
            .read_marker(collection)
            .await?
            .map(|(marker, _)| marker.version)
            .unwrap_or(0))
    }

    /// Brings `collection` up to [`latest_version`](Self::latest_version).
    ///
    /// Returns without taking the lock if the marker is already current.
    /// If the lock cannot be taken, re-reads the marker in case another
    /// process finished the work, and otherwise tries again up to the
    /// configured number of attempts.
    ///
    /// # Errors
    ///
    /// Returns an [`UpgradeError`] if a step fails, the lock is lost, or the
    /// lock cannot be acquired. The marker is never advanced past a failed step.
    pub async fn setup_collection(&self, collection: &CollectionLink) -> StorageResult<UpgradeReport> {
        let latest = self.latest_version();
        let current = self.current_version(collection).await?;
        if current >= latest {
            debug!(%collection, version = current, "Collection is up to date");
            return Ok(UpgradeReport {
                applied: Vec::new(),
                version: current,
            });
        }

        let lock = DistributedLock::new(
            self.client.clone(),
            collection.clone(),
            self.lock_config.clone(),
        );
        let lock_name = format!(
            "upgrade-{}-{}",
            collection.database_id, collection.collection_id
        );

        for attempt in 1..=self.lock_attempts {
            match lock.acquire(&lock_name, self.lock_config.lease).await {
                Ok(token) => return self.run_locked(&lock, token, collection).await,
                Err(StorageError::Concurrency(ConcurrencyError::LockTimeout { .. })) => {
                    let current = self.current_version(collection).await?;
                    if current >= latest {
                        info!(%collection, version = current, "Collection upgraded by another process");
                        return Ok(UpgradeReport {
                            applied: Vec::new(),
                            version: current,
                        });
                    }
                    warn!(
                        %collection,
                        attempt,
                        max_attempts = self.lock_attempts,
                        "Upgrade lock busy, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(UpgradeError::LockTimeout {
            collection: collection.to_string(),
            attempts: self.lock_attempts,
        }
        .into())
    }

    async fn run_locked(
        &self,
        lock: &DistributedLock,
        mut token: LockToken,
        collection: &CollectionLink,
    ) -> StorageResult<UpgradeReport> {
        let result = self.apply_pending(lock, &mut token, collection).await;
        lock.release(token).await;
        result
    }

    async fn apply_pending(
        &self,
        lock: &DistributedLock,
        token: &mut LockToken,
        collection: &CollectionLink,
    ) -> StorageResult<UpgradeReport> {
        // Re-read under the lock: a previous holder may have advanced it.
        let mut marker = self.read_marker(collection).await?;
        let mut report = UpgradeReport {
            applied: Vec::new(),
            version: marker.as_ref().map(|(m, _)| m.version).unwrap_or(0),
        };

        for updater in &self.updaters {
            if updater.version() <= report.version {
                continue;
            }

            lock.renew(token).await.map_err(|e| match e {
                StorageError::Concurrency(ConcurrencyError::LockLost { .. }) => {
                    StorageError::from(UpgradeError::LockLost {
                        collection: collection.to_string(),
                    })
                }
                other => other,
            })?;

            info!(%collection, version = updater.version(), step = updater.name(), "Applying collection upgrade");
            updater
                .execute(self.client.as_ref(), collection)
                .await
                .map_err(|e| UpgradeError::StepFailed {
                    version: updater.version(),
                    name: updater.name().to_string(),
                    message: e.to_string(),
                })?;

            let etag = marker.as_ref().map(|(m, etag)| (m.fencing_token, etag.as_str()));
            let written = self
                .write_marker(collection, updater.version(), token, etag)
                .await?;
            marker = Some(written);
            report.applied.push(updater.version());
            report.version = updater.version();
        }

        info!(%collection, version = report.version, applied = ?report.applied, "Collection upgrade complete");
        Ok(report)
    }

    async fn write_marker(
        &self,
        collection: &CollectionLink,
        version: u32,
        token: &LockToken,
        previous: Option<(u64, &str)>,
    ) -> StorageResult<(CollectionVersionMarker, String)> {
        if let Some((marker_token, _)) = previous {
            if marker_token > token.fencing_token() {
                return Err(UpgradeError::Fenced {
                    marker_token,
                    our_token: token.fencing_token(),
                }
                .into());
            }
        }

        let marker = CollectionVersionMarker {
            version,
            fencing_token: token.fencing_token(),
            updated_at: self.client.server_time().await?,
        };
        let document = Document::from_serializable(
            COLLECTION_VERSION_ID,
            COLLECTION_VERSION_PARTITION,
            &MarkerDocument {
                id: COLLECTION_VERSION_ID.to_string(),
                partition_key: COLLECTION_VERSION_PARTITION.to_string(),
                kind: DocumentKind::System,
                marker: marker.clone(),
            },
        )?;

        let written: Result<StoredDocument, ClientError> = match previous {
            None => self.client.create_document(collection, document).await,
            Some((_, etag)) => {
                self.client
                    .replace_document(collection, document, Some(etag))
                    .await
            }
        };

        match written {
            Ok(stored) => Ok((marker, stored.etag)),
            Err(ClientError::Conflict | ClientError::PreconditionFailed | ClientError::NotFound) => {
                // A replayed write may have landed on its first attempt.
                match self.read_marker(collection).await? {
                    Some((stored, etag))
                        if stored.version == version
                            && stored.fencing_token == token.fencing_token() =>
                    {
                        debug!(%collection, version, "Replayed marker write was already applied");
                        Ok((stored, etag))
                    }
                    _ => Err(UpgradeError::LockLost {
                        collection: collection.to_string(),
                    }
                    .into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::InMemoryDocumentClient;
    use crate::client::CollectionSettings;
    use crate::layout::PARTITION_KEY_PATH;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingUpdater {
        version: u32,
        runs: AtomicU32,
    }

    #[async_trait]
    impl CollectionUpdater for CountingUpdater {
        fn version(&self) -> u32 {
            self.version
        }

        fn name(&self) -> &str {
            "counting"
        }

        async fn execute(&self, _: &dyn DocumentClient, _: &CollectionLink) -> StorageResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting(version: u32) -> Arc<CountingUpdater> {
        Arc::new(CountingUpdater {
            version,
            runs: AtomicU32::new(0),
        })
    }

    #[test]
    fn test_duplicate_versions_rejected() {
        let client: Arc<dyn DocumentClient> = Arc::new(InMemoryDocumentClient::new());
        let updaters: Vec<Arc<dyn CollectionUpdater>> = vec![counting(1), counting(1)];
        let result = CollectionUpgradeManager::new(
            client,
            updaters,
            LockConfig::default(),
            1,
        );
        assert!(matches!(
            result,
            Err(StorageError::Upgrade(UpgradeError::DuplicateVersion { version: 1 }))
        ));
    }

    #[tokio::test]
    async fn test_updaters_applied_in_version_order() {
        let memory = InMemoryDocumentClient::new();
        let link = CollectionLink::new("db", "fhir");
        memory.create_database_if_not_exists("db", None).await.unwrap();
        memory
            .create_collection_if_not_exists(&link, &CollectionSettings::new(PARTITION_KEY_PATH))
            .await
            .unwrap();

        let (two, one) = (counting(2), counting(1));
        let updaters: Vec<Arc<dyn CollectionUpdater>> = vec![two.clone(), one.clone()];
        let manager = CollectionUpgradeManager::new(
            Arc::new(memory),
            updaters,
            LockConfig::default(),
            1,
        )
        .unwrap();

        let report = manager.setup_collection(&link).await.unwrap();
        assert_eq!(report.applied, vec![1, 2]);
        assert_eq!(manager.latest_version(), 2);
        assert_eq!(one.runs.load(Ordering::SeqCst), 1);
        assert_eq!(two.runs.load(Ordering::SeqCst), 1);

        let (marker, _) = manager.read_marker(&link).await.unwrap().unwrap();
        assert_eq!(marker.version, 2);
        assert_eq!(marker.fencing_token, 1);
    }
}
