//! Reindex job scheduling: submission, cancellation and the polling loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::indexer::SearchIndexer;
use super::models::{ReindexJobId, ReindexJobRecord, ReindexJobWrapper, ReindexRequest, ReindexStatus};
use super::task::ReindexJobTask;
use crate::config::{LockConfig, ReindexJobConfig};
use crate::error::{JobError, StorageError, StorageResult};
use crate::lock::DistributedLock;
use crate::store::ResourceStore;

const SUBMIT_LOCK: &str = "reindex-submit";
const SUBMIT_LEASE: Duration = Duration::from_secs(30);
const MAX_CANCEL_ATTEMPTS: u32 = 5;

/// Accepts reindex requests and runs claimed jobs.
///
/// Any number of workers may poll the same collection; job claims are
/// conditional writes, so each job has a single runner at a time.
pub struct ReindexJobWorker {
    store: Arc<ResourceStore>,
    indexer: Arc<dyn SearchIndexer>,
    lock: DistributedLock,
    config: ReindexJobConfig,
    runner_id: String,
}

impl ReindexJobWorker {
    pub fn new(
        store: Arc<ResourceStore>,
        indexer: Arc<dyn SearchIndexer>,
        config: ReindexJobConfig,
        lock_config: LockConfig,
    ) -> Self {
        let runner_id = Uuid::new_v4().to_string();
        let lock = DistributedLock::with_holder_id(
            store.shared_client(),
            store.collection().clone(),
            lock_config,
            runner_id.clone(),
        );
        Self {
            store,
            indexer,
            lock,
            config,
            runner_id,
        }
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    pub fn config(&self) -> &ReindexJobConfig {
        &self.config
    }

    /// Creates a job for `request`.
    ///
    /// Unset request values default to every stored resource type, the
    /// configured thread count and the configured batch size.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::ActiveJobExists`] if a job is `Created` or
    /// `Running`, and [`JobError::InvalidRequest`] for a malformed request.
    pub async fn submit(&self, request: ReindexRequest) -> StorageResult<ReindexJobWrapper> {
        validate_request(&request)?;

        let token = self.lock.acquire(SUBMIT_LOCK, SUBMIT_LEASE).await?;
        let result = self.create_job(request).await;
        self.lock.release(token).await;
        result
    }

    async fn create_job(&self, request: ReindexRequest) -> StorageResult<ReindexJobWrapper> {
        if let Some(active) = self.store.active_reindex_job().await? {
            return Err(JobError::ActiveJobExists {
                job_id: active.record.id.to_string(),
            }
            .into());
        }

        let resource_types = match request.resource_types {
            Some(types) => types,
            None => self.store.list_resource_types().await?,
        };
        let record = ReindexJobRecord::new(
            resource_types,
            request
                .batch_size
                .unwrap_or(self.config.max_resources_per_query),
            request
                .max_threads
                .unwrap_or(self.config.default_max_threads_per_job),
            self.indexer.search_parameter_hash(),
            self.store.server_time().await?,
        );
        info!(
            job_id = %record.id,
            resource_types = ?record.resource_types,
            batch_size = record.batch_size,
            max_threads = record.max_threads,
            "Reindex job submitted"
        );
        self.store.create_reindex_job(record).await
    }

    pub async fn get(&self, job_id: &ReindexJobId) -> StorageResult<ReindexJobWrapper> {
        self.store.get_reindex_job(job_id).await
    }

    /// Requests cancellation of a job.
    ///
    /// A `Created` job is canceled at once. A `Running` job is flagged and
    /// its runner stops at the next batch boundary. A job that already ended
    /// is returned unchanged.
    pub async fn cancel(&self, job_id: &ReindexJobId) -> StorageResult<ReindexJobWrapper> {
        for _ in 0..MAX_CANCEL_ATTEMPTS {
            let job = self.store.get_reindex_job(job_id).await?;
            let mut record = job.record.clone();
            match record.status {
                ReindexStatus::Created => {
                    let now = self.store.server_time().await?;
                    record.cancel_requested = true;
                    record.finish(ReindexStatus::Canceled, now);
                }
                ReindexStatus::Running if !record.cancel_requested => {
                    record.cancel_requested = true;
                }
                _ => return Ok(job),
            }

            match self.store.update_reindex_job(record, &job.etag).await {
                Ok(updated) => {
                    info!(job_id = %job_id, status = %updated.record.status, "Reindex job cancellation requested");
                    return Ok(updated);
                }
                Err(StorageError::Job(JobError::Conflict { .. })) => {
                    debug!(job_id = %job_id, "Job changed while canceling, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(JobError::Conflict {
            job_id: job_id.to_string(),
        }
        .into())
    }

    /// Claims available jobs and runs them to completion.
    ///
    /// Returns the number of jobs this call ran. Run errors are logged; a
    /// job abandoned on a store outage is left for a later takeover.
    pub async fn poll_once(&self) -> StorageResult<usize> {
        let jobs = self
            .store
            .acquire_reindex_jobs(
                self.config.max_concurrent_jobs(),
                self.config.job_heartbeat_timeout_threshold,
                &self.runner_id,
            )
            .await?;

        let count = jobs.len();
        for job in jobs {
            let task = ReindexJobTask::new(
                self.store.clone(),
                self.indexer.clone(),
                self.runner_id.clone(),
            );
            let job_id = job.record.id.clone();
            match task.execute(job).await {
                Ok(Some(done)) => {
                    info!(job_id = %job_id, status = %done.record.status, "Reindex job finished");
                }
                Ok(None) => {}
                Err(e) => warn!(job_id = %job_id, error = %e, "Reindex job run interrupted"),
            }
        }
        Ok(count)
    }

    /// Polls for jobs every `job_polling_frequency` until `shutdown` is set.
    ///
    /// A job interrupted by shutdown stays `Running` and is resumed from its
    /// cursor by whichever worker takes it over.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            runner_id = %self.runner_id,
            polling_frequency = ?self.config.job_polling_frequency,
            "Reindex worker started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                result = self.poll_once() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Reindex poll failed");
                    }
                }
                _ = shutdown.changed() => break,
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.job_polling_frequency) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!(runner_id = %self.runner_id, "Reindex worker stopped");
    }
}

fn validate_request(request: &ReindexRequest) -> StorageResult<()> {
    let invalid = |message: &str| {
        Err(StorageError::from(JobError::InvalidRequest {
            message: message.to_string(),
        }))
    };

    if request.batch_size == Some(0) {
        return invalid("batch size must be > 0");
    }
    if request.max_threads == Some(0) {
        return invalid("max threads must be > 0");
    }
    if let Some(types) = &request.resource_types {
        if types.is_empty() {
            return invalid("resource types must not be empty when given");
        }
        if types.iter().any(|t| t.trim().is_empty()) {
            return invalid("resource types must not be blank");
        }
    }
    Ok(())
}
