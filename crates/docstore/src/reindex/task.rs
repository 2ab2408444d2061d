//! Running one reindex job.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::indexer::SearchIndexer;
use super::models::{ReindexJobRecord, ReindexJobWrapper, ReindexProgress, ReindexStatus};
use crate::error::{ConcurrencyError, JobError, StorageError, StorageResult, StoreError};
use crate::store::ResourceStore;
use crate::types::ResourceWrapper;

// Attempts to persist a batch's progress when the record keeps changing underneath.
const MAX_PERSIST_ATTEMPTS: u32 = 3;

/// Result of one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// Progress persisted; more work remains.
    Continue(ReindexJobWrapper),
    /// The job reached a terminal state.
    Finished(ReindexJobWrapper),
    /// Another runner owns the job now, or it ended elsewhere.
    Lost,
}

/// Drives a claimed job batch by batch until it finishes.
pub struct ReindexJobTask {
    store: Arc<ResourceStore>,
    indexer: Arc<dyn SearchIndexer>,
    runner_id: String,
}

impl ReindexJobTask {
    pub fn new(
        store: Arc<ResourceStore>,
        indexer: Arc<dyn SearchIndexer>,
        runner_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            indexer,
            runner_id: runner_id.into(),
        }
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    /// Runs `job` to a terminal state.
    ///
    /// Returns `Ok(None)` if the job was taken over by another runner.
    ///
    /// # Errors
    ///
    /// A throttled or unavailable store abandons the run and returns the
    /// error; the job stays `Running` and is resumed from its cursor once its
    /// heartbeat goes stale. Any other batch error marks the job `Failed`.
    pub async fn execute(&self, mut job: ReindexJobWrapper) -> StorageResult<Option<ReindexJobWrapper>> {
        info!(
            job_id = %job.record.id,
            runner_id = %self.runner_id,
            type_index = job.record.cursor.type_index,
            "Running reindex job"
        );

        loop {
            match self.run_batch(&job).await {
                Ok(BatchOutcome::Continue(next)) => job = next,
                Ok(BatchOutcome::Finished(done)) => return Ok(Some(done)),
                Ok(BatchOutcome::Lost) => {
                    warn!(job_id = %job.record.id, runner_id = %self.runner_id, "Reindex job no longer owned by this runner");
                    return Ok(None);
                }
                Err(e) if e.is_transient() => {
                    warn!(job_id = %job.record.id, error = %e, "Abandoning reindex run; it will be resumed");
                    return Err(e);
                }
                Err(e) => return self.fail(job, &e).await,
            }
        }
    }

    async fn fail(
        &self,
        job: ReindexJobWrapper,
        cause: &StorageError,
    ) -> StorageResult<Option<ReindexJobWrapper>> {
        error!(job_id = %job.record.id, error = %cause, "Reindex job failed");
        let now = self.store.server_time().await?;
        let mut record = job.record;
        record.error = Some(cause.to_string());
        record.finish(ReindexStatus::Failed, now);
        match self.store.update_reindex_job(record, &job.etag).await {
            Ok(failed) => Ok(Some(failed)),
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Processes the batch at the job's cursor and persists the new cursor.
    pub async fn run_batch(&self, job: &ReindexJobWrapper) -> StorageResult<BatchOutcome> {
        if job.record.runner_id.as_deref() != Some(self.runner_id.as_str()) {
            return Ok(BatchOutcome::Lost);
        }

        let now = self.store.server_time().await?;
        let mut record = job.record.clone();

        if record.cancel_requested {
            record.finish(ReindexStatus::Canceled, now);
            info!(job_id = %record.id, "Reindex job canceled");
            return self.persist(record, &job.etag, true).await;
        }

        let Some(resource_type) = record.current_resource_type().map(str::to_string) else {
            record.finish(ReindexStatus::Completed, now);
            let total = record.total_progress();
            info!(
                job_id = %record.id,
                processed = total.processed,
                reindexed = total.reindexed,
                conflicts = total.conflicts,
                "Reindex job completed"
            );
            return self.persist(record, &job.etag, true).await;
        };

        let page = self
            .store
            .scan_resources(
                &resource_type,
                record.cursor.continuation.as_deref(),
                record.batch_size as usize,
            )
            .await?;
        let batch = self
            .index_resources(page.resources, record.max_threads)
            .await?;
        debug!(
            job_id = %record.id,
            resource_type = %resource_type,
            processed = batch.processed,
            reindexed = batch.reindexed,
            "Reindex batch done"
        );

        record.progress.entry(resource_type).or_default().add(&batch);
        match page.continuation {
            Some(continuation) => record.cursor.continuation = Some(continuation),
            None => {
                record.cursor.type_index += 1;
                record.cursor.continuation = None;
            }
        }
        record.heartbeat = Some(self.store.server_time().await?);
        self.persist(record, &job.etag, false).await
    }

    async fn index_resources(
        &self,
        resources: Vec<ResourceWrapper>,
        max_threads: u16,
    ) -> StorageResult<ReindexProgress> {
        let permits = Arc::new(Semaphore::new(usize::from(max_threads.max(1))));
        let mut tasks: JoinSet<StorageResult<ReindexProgress>> = JoinSet::new();

        for resource in resources {
            let permits = permits.clone();
            let store = self.store.clone();
            let indexer = self.indexer.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.map_err(|e| StoreError::Internal {
                    message: e.to_string(),
                })?;
                reindex_one(&store, indexer.as_ref(), resource).await
            });
        }

        let mut total = ReindexProgress::default();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| {
                StorageError::from(StoreError::Internal {
                    message: format!("reindex task panicked: {e}"),
                })
            });
            match result.and_then(|r| r) {
                Ok(progress) => total.add(&progress),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    /// Writes `record` over `etag`. If a cancellation request slipped in
    /// between, merges it and writes again.
    async fn persist(
        &self,
        mut record: ReindexJobRecord,
        etag: &str,
        terminal: bool,
    ) -> StorageResult<BatchOutcome> {
        let mut etag = etag.to_string();
        for _ in 0..MAX_PERSIST_ATTEMPTS {
            match self.store.update_reindex_job(record.clone(), &etag).await {
                Ok(written) if terminal => return Ok(BatchOutcome::Finished(written)),
                Ok(written) => return Ok(BatchOutcome::Continue(written)),
                Err(StorageError::Job(JobError::Conflict { .. })) => {
                    let fresh = self.store.get_reindex_job(&record.id).await?;
                    if fresh.record.status.is_terminal()
                        || fresh.record.runner_id.as_deref() != Some(self.runner_id.as_str())
                    {
                        return Ok(BatchOutcome::Lost);
                    }
                    debug!(job_id = %record.id, cancel_requested = fresh.record.cancel_requested, "Job record changed, merging");
                    record.cancel_requested |= fresh.record.cancel_requested;
                    etag = fresh.etag;
                }
                Err(StorageError::Job(JobError::NotFound { .. })) => return Ok(BatchOutcome::Lost),
                Err(e) => return Err(e),
            }
        }

        Err(JobError::Conflict {
            job_id: record.id.to_string(),
        }
        .into())
    }
}

async fn reindex_one(
    store: &ResourceStore,
    indexer: &dyn SearchIndexer,
    mut resource: ResourceWrapper,
) -> StorageResult<ReindexProgress> {
    let hash = indexer.search_parameter_hash();
    let mut progress = ReindexProgress {
        processed: 1,
        ..Default::default()
    };

    if resource.search_parameter_hash() == Some(hash) {
        progress.skipped = 1;
        return Ok(progress);
    }

    let indices = indexer.extract(&resource)?;
    resource.set_compartment_indices(indices, hash);
    match store.update_search_index(&resource).await {
        Ok(_) => progress.reindexed = 1,
        Err(StorageError::Concurrency(ConcurrencyError::DocumentChanged { .. })) => {
            progress.conflicts = 1;
        }
        Err(e) => return Err(e),
    }
    Ok(progress)
}
