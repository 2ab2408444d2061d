//! Distributed lock over lock documents.
//!
//! A lock is a document `lock_{name}` in the `_locks` partition holding the
//! current holder, a lease expiry measured on the store clock and a fencing
//! counter. Every state change is a conditional write on the document's
//! ETag, so at most one holder succeeds per change. Releasing expires the
//! lease instead of deleting the document, which keeps the fencing counter
//! increasing across holders.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{ClientError, CollectionLink, Document, DocumentClient};
use crate::config::LockConfig;
use crate::error::{ConcurrencyError, StorageResult};
use crate::layout::{DocumentKind, LOCK_PARTITION, lock_document_id};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockDocument {
    id: String,
    partition_key: String,
    kind: DocumentKind,
    name: String,
    holder: Option<String>,
    lease_expires_at: DateTime<Utc>,
    fencing_token: u64,
    acquired_at: Option<DateTime<Utc>>,
}

impl LockDocument {
    fn into_document(self) -> Result<Document, serde_json::Error> {
        Document::from_serializable(self.id.clone(), self.partition_key.clone(), &self)
    }

    fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        self.holder.is_some() && self.lease_expires_at > now
    }
}

/// Proof of holding a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    name: String,
    holder_id: String,
    fencing_token: u64,
    lease: Duration,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    etag: String,
}

impl LockToken {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Strictly increases with every successful acquisition of this lock.
    pub fn fencing_token(&self) -> u64 {
        self.fencing_token
    }

    /// Lease expiry on the store clock as of the last acquire or renew.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Mutual exclusion between processes sharing one collection.
pub struct DistributedLock {
    client: Arc<dyn DocumentClient>,
    collection: CollectionLink,
    config: LockConfig,
    holder_id: String,
}

fn lease_end(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(lease)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl DistributedLock {
    /// Creates a lock client with a fresh holder id.
    pub fn new(
        client: Arc<dyn DocumentClient>,
        collection: CollectionLink,
        config: LockConfig,
    ) -> Self {
        Self::with_holder_id(client, collection, config, Uuid::new_v4().to_string())
    }

    pub fn with_holder_id(
        client: Arc<dyn DocumentClient>,
        collection: CollectionLink,
        config: LockConfig,
        holder_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            collection,
            config,
            holder_id: holder_id.into(),
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Acquires the lock `name` for `lease`.
    ///
    /// Backs off exponentially between attempts until the configured acquire
    /// timeout elapses.
    ///
    /// # Errors
    ///
    /// Returns [`ConcurrencyError::LockTimeout`] if another holder keeps the
    /// lock past the deadline, or a store error if the store fails.
    pub async fn acquire(&self, name: &str, lease: Duration) -> StorageResult<LockToken> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        let mut backoff = self.config.retry_interval;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(token) = self.try_acquire(name, lease).await? {
                info!(
                    lock = name,
                    holder = %self.holder_id,
                    fencing_token = token.fencing_token,
                    attempts,
                    "Lock acquired"
                );
                return Ok(token);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(lock = name, holder = %self.holder_id, attempts, "Lock acquisition timed out");
                return Err(ConcurrencyError::LockTimeout {
                    name: name.to_string(),
                    timeout_ms: self.config.acquire_timeout.as_millis() as u64,
                }
                .into());
            }

            sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(self.config.max_retry_interval);
        }
    }

    /// Makes one attempt to take the lock. Returns `None` if it is held.
    pub async fn try_acquire(&self, name: &str, lease: Duration) -> StorageResult<Option<LockToken>> {
        let id = lock_document_id(name);
        let existing = self
            .client
            .read_document(&self.collection, LOCK_PARTITION, &id)
            .await?;
        let now = self.client.server_time().await?;

        let (fencing_token, if_match) = match &existing {
            None => (1, None),
            Some(stored) => {
                let current: LockDocument = stored.deserialize()?;
                if current.is_held_at(now) {
                    debug!(
                        lock = name,
                        holder = current.holder.as_deref().unwrap_or_default(),
                        expires_at = %current.lease_expires_at,
                        "Lock is held"
                    );
                    return Ok(None);
                }
                (current.fencing_token + 1, Some(stored.etag.as_str()))
            }
        };

        let expires_at = lease_end(now, lease);
        let document = LockDocument {
            id,
            partition_key: LOCK_PARTITION.to_string(),
            kind: DocumentKind::Lock,
            name: name.to_string(),
            holder: Some(self.holder_id.clone()),
            lease_expires_at: expires_at,
            fencing_token,
            acquired_at: Some(now),
        }
        .into_document()?;

        let written = match if_match {
            None => self.client.create_document(&self.collection, document).await,
            Some(etag) => {
                self.client
                    .replace_document(&self.collection, document, Some(etag))
                    .await
            }
        };

        match written {
            Ok(stored) => Ok(Some(LockToken {
                name: name.to_string(),
                holder_id: self.holder_id.clone(),
                fencing_token,
                lease,
                acquired_at: now,
                expires_at,
                etag: stored.etag,
            })),
            Err(ClientError::Conflict | ClientError::PreconditionFailed | ClientError::NotFound) => {
                match self.own_write_etag(name, fencing_token).await? {
                    Some(etag) => {
                        debug!(lock = name, fencing_token, "Replayed lock write was already applied");
                        Ok(Some(LockToken {
                            name: name.to_string(),
                            holder_id: self.holder_id.clone(),
                            fencing_token,
                            lease,
                            acquired_at: now,
                            expires_at,
                            etag,
                        }))
                    }
                    None => {
                        debug!(lock = name, "Lost race for lock");
                        Ok(None)
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the lock document's ETag if it carries this holder and
    /// `fencing_token`.
    ///
    /// A retried create or conditional replace whose first attempt reached
    /// the store reports a conflict against its own write.
    async fn own_write_etag(&self, name: &str, fencing_token: u64) -> StorageResult<Option<String>> {
        let stored = self
            .client
            .read_document(&self.collection, LOCK_PARTITION, &lock_document_id(name))
            .await?;
        let Some(stored) = stored else {
            return Ok(None);
        };
        let current: LockDocument = stored.deserialize()?;
        let ours = current.holder.as_deref() == Some(self.holder_id.as_str())
            && current.fencing_token == fencing_token;
        Ok(ours.then_some(stored.etag))
    }

    /// Extends the lease of a held lock.
    ///
    /// # Errors
    ///
    /// Returns [`ConcurrencyError::LockLost`] if the lease already expired on
    /// the store clock or another holder has written the lock document.
    pub async fn renew(&self, token: &mut LockToken) -> StorageResult<()> {
        let now = self.client.server_time().await?;
        if now >= token.expires_at {
            warn!(lock = %token.name, holder = %token.holder_id, "Lease expired before renewal");
            return Err(self.lost(token));
        }

        let expires_at = lease_end(now, token.lease);
        let document = LockDocument {
            id: lock_document_id(&token.name),
            partition_key: LOCK_PARTITION.to_string(),
            kind: DocumentKind::Lock,
            name: token.name.clone(),
            holder: Some(token.holder_id.clone()),
            lease_expires_at: expires_at,
            fencing_token: token.fencing_token,
            acquired_at: Some(token.acquired_at),
        }
        .into_document()?;

        match self
            .client
            .replace_document(&self.collection, document, Some(&token.etag))
            .await
        {
            Ok(stored) => {
                token.etag = stored.etag;
                token.expires_at = expires_at;
                debug!(lock = %token.name, expires_at = %expires_at, "Lease renewed");
                Ok(())
            }
            Err(ClientError::PreconditionFailed | ClientError::NotFound) => {
                if let Some(etag) = self.own_write_etag(&token.name, token.fencing_token).await? {
                    token.etag = etag;
                    token.expires_at = expires_at;
                    debug!(lock = %token.name, "Replayed renewal was already applied");
                    return Ok(());
                }
                warn!(lock = %token.name, holder = %token.holder_id, "Lock taken over by another holder");
                Err(self.lost(token))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lost(&self, token: &LockToken) -> crate::error::StorageError {
        ConcurrencyError::LockLost {
            name: token.name.clone(),
        }
        .into()
    }

    /// Releases a held lock. Best effort: failures are logged, never returned.
    pub async fn release(&self, token: LockToken) {
        if let Err(e) = self.try_release(&token).await {
            warn!(lock = %token.name, error = %e, "Failed to release lock; it will expire");
        }
    }

    async fn try_release(&self, token: &LockToken) -> StorageResult<()> {
        let now = self.client.server_time().await?;
        let document = LockDocument {
            id: lock_document_id(&token.name),
            partition_key: LOCK_PARTITION.to_string(),
            kind: DocumentKind::Lock,
            name: token.name.clone(),
            holder: None,
            lease_expires_at: now,
            fencing_token: token.fencing_token,
            acquired_at: None,
        }
        .into_document()?;

        match self
            .client
            .replace_document(&self.collection, document, Some(&token.etag))
            .await
        {
            Ok(_) => {
                info!(lock = %token.name, fencing_token = token.fencing_token, "Lock released");
                Ok(())
            }
            Err(ClientError::PreconditionFailed | ClientError::NotFound) => {
                debug!(lock = %token.name, "Lock already taken over; nothing to release");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
