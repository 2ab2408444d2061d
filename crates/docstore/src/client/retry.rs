use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{
    ClientError, CollectionLink, CollectionSettings, Document, DocumentClient, DocumentQuery,
    QueryPage, StoredDocument, StoredProcedure,
};
use crate::config::RetryConfig;

/// Whether a failed request should be retried, and after how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAdvice {
    pub should_retry: bool,
    pub delay: Duration,
}

impl RetryAdvice {
    fn give_up() -> Self {
        Self {
            should_retry: false,
            delay: Duration::ZERO,
        }
    }

    fn retry_after(delay: Duration) -> Self {
        Self {
            should_retry: true,
            delay,
        }
    }
}

/// Retries already spent on one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub throttle_retries: u32,
    pub transient_retries: u32,
    /// Time spent waiting on throttling so far.
    pub throttle_wait: Duration,
}

impl RetryState {
    fn record(&mut self, error: &ClientError, delay: Duration) {
        match error {
            ClientError::Throttled { .. } => {
                self.throttle_retries += 1;
                self.throttle_wait += delay;
            }
            _ => self.transient_retries += 1,
        }
    }
}

/// Classifies store failures into [`RetryAdvice`].
///
/// Throttling is retried after at least the store's `retry_after`, bounded by
/// a retry count and a cumulative wait. Transient failures are retried with
/// exponential backoff, and only when the request is idempotent or
/// conditional. Everything else is returned at once.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decides whether to retry after `error`, given the retries already spent.
    pub fn advise(&self, error: &ClientError, state: &RetryState, idempotent: bool) -> RetryAdvice {
        match error {
            ClientError::Throttled { retry_after } => {
                if state.throttle_retries >= self.config.max_number_of_retries {
                    return RetryAdvice::give_up();
                }
                let delay = retry_after
                    .unwrap_or_else(|| self.backoff(state.throttle_retries))
                    .max(self.config.initial_delay);
                if state.throttle_wait + delay > self.config.max_wait_time {
                    return RetryAdvice::give_up();
                }
                RetryAdvice::retry_after(delay)
            }
            ClientError::Transient(_) => {
                if !idempotent || state.transient_retries >= self.config.transient_max_retries {
                    return RetryAdvice::give_up();
                }
                RetryAdvice::retry_after(self.backoff(state.transient_retries))
            }
            _ => RetryAdvice::give_up(),
        }
    }

    fn backoff(&self, retries: u32) -> Duration {
        let factor = self.config.backoff_multiplier.powi(retries.min(32) as i32);
        let secs = self.config.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.config.max_delay.as_secs_f64() {
            self.config.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Runs `call` until it succeeds, returns a domain outcome, or the policy
    /// gives up. The last error is returned unchanged.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &'static str,
        idempotent: bool,
        mut call: F,
    ) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ClientError>> + Send,
        T: Send,
    {
        let mut state = RetryState::default();
        loop {
            match call().await {
                Ok(value) => {
                    if state != RetryState::default() {
                        debug!(
                            operation,
                            throttle_retries = state.throttle_retries,
                            transient_retries = state.transient_retries,
                            "Store request succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(error) if error.is_domain_outcome() => return Err(error),
                Err(error) => {
                    let advice = self.advise(&error, &state, idempotent);
                    if !advice.should_retry {
                        warn!(
                            operation,
                            throttle_retries = state.throttle_retries,
                            transient_retries = state.transient_retries,
                            error = %error,
                            "Store request failed, giving up"
                        );
                        return Err(error);
                    }

                    debug!(
                        operation,
                        delay_ms = advice.delay.as_millis() as u64,
                        error = %error,
                        "Store request failed, retrying"
                    );
                    state.record(&error, advice.delay);
                    sleep(advice.delay).await;
                }
            }
        }
    }
}

/// A [`DocumentClient`] that sends every request through a [`RetryPolicy`].
pub struct RetryingClient {
    inner: Arc<dyn DocumentClient>,
    policy: RetryPolicy,
}

impl RetryingClient {
    pub fn new(inner: Arc<dyn DocumentClient>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl DocumentClient for RetryingClient {
    async fn database_exists(&self, database_id: &str) -> Result<bool, ClientError> {
        let inner = &self.inner;
        self.policy
            .execute("database_exists", true, move || {
                inner.database_exists(database_id)
            })
            .await
    }

    async fn create_database_if_not_exists(
        &self,
        database_id: &str,
        throughput: Option<u32>,
    ) -> Result<bool, ClientError> {
        let inner = &self.inner;
        self.policy
            .execute("create_database", true, move || {
                inner.create_database_if_not_exists(database_id, throughput)
            })
            .await
    }

    async fn create_collection_if_not_exists(
        &self,
        collection: &CollectionLink,
        settings: &CollectionSettings,
    ) -> Result<bool, ClientError> {
        let inner = &self.inner;
        self.policy
            .execute("create_collection", true, move || {
                inner.create_collection_if_not_exists(collection, settings)
            })
            .await
    }

    async fn read_collection(
        &self,
        collection: &CollectionLink,
    ) -> Result<Option<CollectionSettings>, ClientError> {
        let inner = &self.inner;
        self.policy
            .execute("read_collection", true, move || {
                inner.read_collection(collection)
            })
            .await
    }

    async fn replace_collection(
        &self,
        collection: &CollectionLink,
        settings: &CollectionSettings,
    ) -> Result<(), ClientError> {
        let inner = &self.inner;
        self.policy
            .execute("replace_collection", true, move || {
                inner.replace_collection(collection, settings)
            })
            .await
    }

    async fn read_stored_procedure(
        &self,
        collection: &CollectionLink,
        id: &str,
    ) -> Result<Option<StoredProcedure>, ClientError> {
        let inner = &self.inner;
        self.policy
            .execute("read_stored_procedure", true, move || {
                inner.read_stored_procedure(collection, id)
            })
            .await
    }

    async fn upsert_stored_procedure(
        &self,
        collection: &CollectionLink,
        procedure: &StoredProcedure,
    ) -> Result<(), ClientError> {
        let inner = &self.inner;
        self.policy
            .execute("upsert_stored_procedure", true, move || {
                inner.upsert_stored_procedure(collection, procedure)
            })
            .await
    }

    async fn read_document(
        &self,
        collection: &CollectionLink,
        partition_key: &str,
        id: &str,
    ) -> Result<Option<StoredDocument>, ClientError> {
        let inner = &self.inner;
        self.policy
            .execute("read_document", true, move || {
                inner.read_document(collection, partition_key, id)
            })
            .await
    }

    async fn create_document(
        &self,
        collection: &CollectionLink,
        document: Document,
    ) -> Result<StoredDocument, ClientError> {
        // Create-if-absent is conditional: a replayed create reports Conflict.
        let inner = &self.inner;
        self.policy
            .execute("create_document", true, move || {
                inner.create_document(collection, document.clone())
            })
            .await
    }

    async fn replace_document(
        &self,
        collection: &CollectionLink,
        document: Document,
        if_match: Option<&str>,
    ) -> Result<StoredDocument, ClientError> {
        let inner = &self.inner;
        self.policy
            .execute("replace_document", if_match.is_some(), move || {
                inner.replace_document(collection, document.clone(), if_match)
            })
            .await
    }

    async fn upsert_document(
        &self,
        collection: &CollectionLink,
        document: Document,
        if_match: Option<&str>,
    ) -> Result<StoredDocument, ClientError> {
        let inner = &self.inner;
        self.policy
            .execute("upsert_document", if_match.is_some(), move || {
                inner.upsert_document(collection, document.clone(), if_match)
            })
            .await
    }

    async fn delete_document(
        &self,
        collection: &CollectionLink,
        partition_key: &str,
        id: &str,
        if_match: Option<&str>,
    ) -> Result<(), ClientError> {
        // A replayed delete reports NotFound, which callers already tolerate.
        let inner = &self.inner;
        self.policy
            .execute("delete_document", true, move || {
                inner.delete_document(collection, partition_key, id, if_match)
            })
            .await
    }

    async fn query_documents(
        &self,
        collection: &CollectionLink,
        query: &DocumentQuery,
        continuation: Option<&str>,
        max_items: usize,
    ) -> Result<QueryPage, ClientError> {
        let inner = &self.inner;
        self.policy
            .execute("query_documents", true, move || {
                inner.query_documents(collection, query, continuation, max_items)
            })
            .await
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, ClientError> {
        let inner = &self.inner;
        self.policy
            .execute("server_time", true, move || inner.server_time())
            .await
    }
}
