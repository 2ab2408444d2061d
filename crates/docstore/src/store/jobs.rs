//! Reindex job records in the resource collection.
//!
//! Job documents live in the `_reindexJobs` partition under the job id.
//! Every state change is a conditional replace on the document's ETag.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::ResourceStore;
use super::documents::FIELD_KIND;
use crate::client::{ClientError, Document, DocumentQuery, StoredDocument};
use crate::error::{JobError, StorageError, StorageResult};
use crate::layout::{DocumentKind, REINDEX_JOB_PARTITION};
use crate::reindex::{ReindexJobId, ReindexJobRecord, ReindexJobWrapper, ReindexStatus};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobDocument {
    partition_key: String,
    kind: DocumentKind,
    /// Identifies the write that produced this document.
    #[serde(default)]
    write_id: String,
    #[serde(flatten)]
    record: ReindexJobRecord,
}

impl JobDocument {
    fn encode(record: &ReindexJobRecord, write_id: &str) -> StorageResult<Document> {
        let document = JobDocument {
            partition_key: REINDEX_JOB_PARTITION.to_string(),
            kind: DocumentKind::ReindexJob,
            write_id: write_id.to_string(),
            record: record.clone(),
        };
        Ok(Document::from_serializable(
            record.id.as_str(),
            REINDEX_JOB_PARTITION,
            &document,
        )?)
    }

    fn decode(stored: StoredDocument) -> StorageResult<ReindexJobWrapper> {
        let document: JobDocument = stored.deserialize()?;
        Ok(ReindexJobWrapper::new(document.record, stored.etag))
    }
}

impl ResourceStore {
    /// Persists a new job record.
    pub async fn create_reindex_job(
        &self,
        record: ReindexJobRecord,
    ) -> StorageResult<ReindexJobWrapper> {
        let write_id = Uuid::new_v4().to_string();
        let etag = match self
            .client
            .create_document(&self.collection, JobDocument::encode(&record, &write_id)?)
            .await
        {
            Ok(stored) => stored.etag,
            Err(ClientError::Conflict) => match self.own_job_write(&record.id, &write_id).await? {
                Some(etag) => etag,
                None => {
                    return Err(JobError::Conflict {
                        job_id: record.id.to_string(),
                    }
                    .into());
                }
            },
            Err(e) => return Err(e.into()),
        };
        info!(job_id = %record.id, "Reindex job created");
        Ok(ReindexJobWrapper::new(record, etag))
    }

    /// Returns the job document's ETag if `write_id` produced it. A retried
    /// write whose first attempt reached the store conflicts with itself.
    async fn own_job_write(
        &self,
        job_id: &ReindexJobId,
        write_id: &str,
    ) -> StorageResult<Option<String>> {
        let stored = self
            .client
            .read_document(&self.collection, REINDEX_JOB_PARTITION, job_id.as_str())
            .await?;
        let Some(stored) = stored else {
            return Ok(None);
        };
        let document: JobDocument = stored.deserialize()?;
        Ok((document.write_id == write_id).then_some(stored.etag))
    }

    pub async fn get_reindex_job(&self, job_id: &ReindexJobId) -> StorageResult<ReindexJobWrapper> {
        match self
            .client
            .read_document(&self.collection, REINDEX_JOB_PARTITION, job_id.as_str())
            .await?
        {
            Some(stored) => JobDocument::decode(stored),
            None => Err(JobError::NotFound {
                job_id: job_id.to_string(),
            }
            .into()),
        }
    }

    /// Replaces a job record if its document still has `etag`.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Conflict`] if the record changed since it was
    /// read, and [`JobError::NotFound`] if it no longer exists.
    pub async fn update_reindex_job(
        &self,
        record: ReindexJobRecord,
        etag: &str,
    ) -> StorageResult<ReindexJobWrapper> {
        let write_id = Uuid::new_v4().to_string();
        match self
            .client
            .replace_document(&self.collection, JobDocument::encode(&record, &write_id)?, Some(etag))
            .await
        {
            Ok(stored) => Ok(ReindexJobWrapper::new(record, stored.etag)),
            Err(ClientError::PreconditionFailed) => {
                match self.own_job_write(&record.id, &write_id).await? {
                    Some(etag) => {
                        debug!(job_id = %record.id, "Replayed job update was already applied");
                        Ok(ReindexJobWrapper::new(record, etag))
                    }
                    None => Err(JobError::Conflict {
                        job_id: record.id.to_string(),
                    }
                    .into()),
                }
            }
            Err(ClientError::NotFound) => Err(JobError::NotFound {
                job_id: record.id.to_string(),
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    /// All job records, oldest first.
    pub async fn list_reindex_jobs(&self) -> StorageResult<Vec<ReindexJobWrapper>> {
        let query = DocumentQuery::new()
            .partition(REINDEX_JOB_PARTITION)
            .where_eq(FIELD_KIND, DocumentKind::ReindexJob.as_str());

        let mut jobs = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .query_documents(&self.collection, &query, continuation.as_deref(), self.page_size)
                .await?;
            for stored in page.documents {
                jobs.push(JobDocument::decode(stored)?);
            }
            continuation = page.continuation;
            if continuation.is_none() {
                break;
            }
        }

        jobs.sort_by(|a, b| {
            a.record
                .created_at
                .cmp(&b.record.created_at)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        Ok(jobs)
    }

    /// The oldest job in `Created` or `Running` state, if any.
    pub async fn active_reindex_job(&self) -> StorageResult<Option<ReindexJobWrapper>> {
        Ok(self
            .list_reindex_jobs()
            .await?
            .into_iter()
            .find(|job| job.record.status.is_active()))
    }

    /// Claims up to `max_running` jobs for `runner_id`.
    ///
    /// Running jobs with a heartbeat newer than `heartbeat_timeout` count
    /// against the cap. `Created` jobs and stale `Running` jobs are claimed
    /// oldest first by a conditional write that sets them `Running` with a
    /// fresh heartbeat. A job whose claim loses a race is skipped.
    pub async fn acquire_reindex_jobs(
        &self,
        max_running: u32,
        heartbeat_timeout: Duration,
        runner_id: &str,
    ) -> StorageResult<Vec<ReindexJobWrapper>> {
        let jobs = self.list_reindex_jobs().await?;
        let now = self.client.server_time().await?;

        let running = jobs
            .iter()
            .filter(|job| {
                job.record.status == ReindexStatus::Running
                    && !job.record.is_stale(now, heartbeat_timeout)
            })
            .count();
        let available = (max_running as usize).saturating_sub(running);
        if available == 0 {
            debug!(running, max_running, "No reindex job slot available");
            return Ok(Vec::new());
        }

        let mut claimed = Vec::new();
        for job in jobs {
            if claimed.len() >= available {
                break;
            }
            let stale = job.record.is_stale(now, heartbeat_timeout);
            if job.record.status != ReindexStatus::Created && !stale {
                continue;
            }

            let previous_runner = job.record.runner_id.clone();
            let mut record = job.record;
            record.status = ReindexStatus::Running;
            record.runner_id = Some(runner_id.to_string());
            record.heartbeat = Some(now);
            record.started_at.get_or_insert(now);

            match self.update_reindex_job(record, &job.etag).await {
                Ok(wrapper) => {
                    if stale {
                        info!(
                            job_id = %wrapper.record.id,
                            runner_id,
                            previous_runner = previous_runner.as_deref().unwrap_or_default(),
                            "Took over stale reindex job"
                        );
                    } else {
                        info!(job_id = %wrapper.record.id, runner_id, "Claimed reindex job");
                    }
                    claimed.push(wrapper);
                }
                Err(e) if e.is_conflict() => {
                    debug!(runner_id, "Lost race claiming reindex job");
                }
                Err(StorageError::Job(JobError::NotFound { .. })) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::InMemoryDocumentClient;
    use crate::client::{CollectionLink, CollectionSettings, DocumentClient};
    use crate::layout::PARTITION_KEY_PATH;
    use std::sync::Arc;

    async fn setup() -> (InMemoryDocumentClient, ResourceStore) {
        let memory = InMemoryDocumentClient::new();
        let link = CollectionLink::new("db", "fhir");
        memory.create_database_if_not_exists("db", None).await.unwrap();
        memory
            .create_collection_if_not_exists(&link, &CollectionSettings::new(PARTITION_KEY_PATH))
            .await
            .unwrap();
        (memory.clone(), ResourceStore::new(Arc::new(memory), link))
    }

    async fn new_job(store: &ResourceStore) -> ReindexJobWrapper {
        let now = store.server_time().await.unwrap();
        let record = ReindexJobRecord::new(vec!["Patient".to_string()], 10, 1, "hash", now);
        store.create_reindex_job(record).await.unwrap()
    }

    #[tokio::test]
    async fn test_update_with_stale_etag_conflicts() {
        let (_, store) = setup().await;
        let job = new_job(&store).await;

        let mut record = job.record.clone();
        record.cancel_requested = true;
        store.update_reindex_job(record.clone(), &job.etag).await.unwrap();

        let err = store.update_reindex_job(record, &job.etag).await.unwrap_err();
        assert!(matches!(err, StorageError::Job(JobError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_replayed_claim_is_kept() {
        let (memory, _) = setup().await;
        let link = CollectionLink::new("db", "fhir");
        let retrying = crate::client::RetryingClient::new(
            Arc::new(memory.clone()),
            crate::client::RetryPolicy::new(crate::config::RetryConfig {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..Default::default()
            }),
        );
        let store = ResourceStore::new(Arc::new(retrying), link);
        let job = new_job(&store).await;

        memory.lose_acknowledgement(
            crate::backends::OperationKind::ReplaceDocument,
            job.record.id.as_str(),
        );
        let claimed = store
            .acquire_reindex_jobs(1, Duration::from_secs(60), "runner-a")
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].etag, store.get_reindex_job(&job.record.id).await.unwrap().etag);
    }

    #[tokio::test]
    async fn test_get_missing_job() {
        let (_, store) = setup().await;
        let err = store
            .get_reindex_job(&ReindexJobId::from("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Job(JobError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_acquire_respects_cap_and_staleness() {
        let (memory, store) = setup().await;
        let job = new_job(&store).await;
        let timeout = Duration::from_secs(60);

        let claimed = store.acquire_reindex_jobs(1, timeout, "runner-a").await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].record.id, job.record.id);
        assert_eq!(claimed[0].record.status, ReindexStatus::Running);

        assert!(store
            .acquire_reindex_jobs(1, timeout, "runner-b")
            .await
            .unwrap()
            .is_empty());

        memory.advance_clock(Duration::from_secs(61));
        let taken = store.acquire_reindex_jobs(1, timeout, "runner-b").await.unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].record.runner_id.as_deref(), Some("runner-b"));
        assert_eq!(taken[0].record.started_at, claimed[0].record.started_at);
    }

    #[tokio::test]
    async fn test_active_job() {
        let (_, store) = setup().await;
        assert!(store.active_reindex_job().await.unwrap().is_none());

        let job = new_job(&store).await;
        let active = store.active_reindex_job().await.unwrap().unwrap();
        assert_eq!(active.record.id, job.record.id);

        let mut record = job.record;
        record.finish(ReindexStatus::Completed, store.server_time().await.unwrap());
        store.update_reindex_job(record, &job.etag).await.unwrap();
        assert!(store.active_reindex_job().await.unwrap().is_none());
        assert_eq!(store.list_reindex_jobs().await.unwrap().len(), 1);
    }
}
