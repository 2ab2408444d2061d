//! Error types for the document-store core.
//!
//! Errors are grouped by category. Resource and concurrency outcomes are
//! typed results the caller is expected to branch on; store errors are what
//! remains after the retry wrapper has given up; upgrade, job, definition and
//! control-plane errors belong to their respective subsystems.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use std::time::Duration;

use thiserror::Error;

use crate::client::ClientError;

/// The primary error type for all storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Resource state errors
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Concurrency, versioning and locking errors
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    /// Errors surfaced by the document store itself
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Collection upgrade errors
    #[error(transparent)]
    Upgrade(#[from] UpgradeError),

    /// Reindex job errors
    #[error(transparent)]
    Job(#[from] JobError),

    /// Compartment definition errors
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    /// Control-plane (RBAC) errors
    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
}

/// Errors related to resource state.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// The requested resource was not found.
    #[error("resource not found: {resource_type}/{id}")]
    NotFound { resource_type: String, id: String },

    /// The requested version of the resource was not found.
    #[error("version not found: {resource_type}/{id}/_history/{version_id}")]
    VersionNotFound {
        resource_type: String,
        id: String,
        version_id: String,
    },

    /// The resource has been deleted (HTTP 410 Gone).
    #[error("resource deleted: {resource_type}/{id} (version {version_id})")]
    Gone {
        resource_type: String,
        id: String,
        version_id: String,
    },
}

/// Errors related to concurrency control and distributed locking.
#[derive(Error, Debug)]
pub enum ConcurrencyError {
    /// The version tag supplied by the caller does not match the current version.
    #[error("version conflict on {resource_type}/{id}: expected {expected_version}, found {actual_version}")]
    VersionConflict {
        resource_type: String,
        id: String,
        expected_version: String,
        actual_version: String,
    },

    /// The document changed between read and conditional write.
    #[error("document changed concurrently: {resource_type}/{id}")]
    DocumentChanged { resource_type: String, id: String },

    /// Lock acquisition did not succeed before the deadline.
    #[error("lock timeout after {timeout_ms}ms for lock '{name}'")]
    LockTimeout { name: String, timeout_ms: u64 },

    /// The lease expired or another holder claimed the lock.
    #[error("lock '{name}' was lost")]
    LockLost { name: String },
}

/// Errors surfaced by the document store after retries are exhausted.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store kept throttling requests.
    #[error("request rate too large{}", retry_hint(.retry_after))]
    Throttled { retry_after: Option<Duration> },

    /// The store could not be reached or kept failing.
    #[error("document store unavailable: {message}")]
    Unavailable { message: String },

    /// The configured database does not exist and creation is disabled.
    #[error("database '{database_id}' does not exist and database creation is not allowed")]
    DatabaseMissing { database_id: String },

    /// A required collection does not exist.
    #[error("collection not found: {collection}")]
    CollectionMissing { collection: String },

    /// The store configuration is invalid.
    #[error("invalid store configuration: {message}")]
    InvalidConfiguration { message: String },

    /// A persisted document could not be (de)serialized.
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// The store returned an outcome the caller did not expect.
    #[error("internal store error: {message}")]
    Internal { message: String },
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(delay) => format!(", retry after {}ms", delay.as_millis()),
        None => String::new(),
    }
}

/// Errors related to collection upgrades.
#[derive(Error, Debug)]
pub enum UpgradeError {
    /// An upgrade step failed; the version marker was not advanced.
    #[error("upgrade step {version} ({name}) failed: {message}")]
    StepFailed {
        version: u32,
        name: String,
        message: String,
    },

    /// The upgrade lock was lost while the pass was running.
    #[error("upgrade lock lost for collection {collection}")]
    LockLost { collection: String },

    /// The upgrade lock could not be acquired.
    #[error("could not acquire upgrade lock for collection {collection} after {attempts} attempts")]
    LockTimeout { collection: String, attempts: u32 },

    /// Two upgraders declare the same version.
    #[error("duplicate upgrader version {version}")]
    DuplicateVersion { version: u32 },

    /// The version marker was written by a holder with a newer fencing token.
    #[error("collection version marker is fenced by token {marker_token}, ours is {our_token}")]
    Fenced { marker_token: u64, our_token: u64 },
}

/// Errors related to reindex jobs.
#[derive(Error, Debug)]
pub enum JobError {
    /// The job was not found.
    #[error("reindex job not found: {job_id}")]
    NotFound { job_id: String },

    /// The job document changed since it was read.
    #[error("reindex job {job_id} was modified concurrently")]
    Conflict { job_id: String },

    /// Another reindex job is already active.
    #[error("reindex job {job_id} is already active")]
    ActiveJobExists { job_id: String },

    /// The request was rejected.
    #[error("invalid reindex request: {message}")]
    InvalidRequest { message: String },
}

/// Errors related to compartment definitions.
#[derive(Error, Debug)]
pub enum DefinitionError {
    /// The resource type does not participate in the compartment.
    #[error("resource type '{resource_type}' is not supported")]
    ResourceNotSupported { resource_type: String },

    /// The bundled definition could not be loaded.
    #[error("invalid compartment definition: {message}")]
    InvalidDefinition { message: String },
}

/// Errors related to the control-plane (RBAC) directory.
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    /// The identity provider was not found.
    #[error("identity provider not found: {name}")]
    IdentityProviderNotFound { name: String },

    /// The role was not found.
    #[error("role not found: {name}")]
    RoleNotFound { name: String },

    /// The entry changed since it was read.
    #[error("control-plane entry '{name}' was modified concurrently")]
    Conflict { name: String },

    /// The entry failed validation.
    #[error("invalid control-plane entry: {message}")]
    Invalid { message: String },
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Returns `true` if the error is a throttling or availability failure
    /// that may clear up on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Store(StoreError::Throttled { .. })
                | StorageError::Store(StoreError::Unavailable { .. })
        )
    }

    /// Returns `true` if the error is a lost optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::Concurrency(ConcurrencyError::VersionConflict { .. })
                | StorageError::Concurrency(ConcurrencyError::DocumentChanged { .. })
                | StorageError::Job(JobError::Conflict { .. })
                | StorageError::ControlPlane(ControlPlaneError::Conflict { .. })
        )
    }
}

// Domain outcomes (not found, conflict, precondition failed) are handled by
// callers before conversion; reaching this impl with one of them is a bug in
// the caller's match and surfaces as an internal error.
impl From<ClientError> for StorageError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Throttled { retry_after } => {
                StorageError::Store(StoreError::Throttled { retry_after })
            }
            ClientError::Transient(message) => {
                StorageError::Store(StoreError::Unavailable { message })
            }
            ClientError::Unavailable(message) => {
                StorageError::Store(StoreError::Unavailable { message })
            }
            ClientError::Fatal(message) => StorageError::Store(StoreError::Internal { message }),
            ClientError::CollectionMissing(collection) => {
                StorageError::Store(StoreError::CollectionMissing { collection })
            }
            other => StorageError::Store(StoreError::Internal {
                message: format!("unexpected store outcome: {other}"),
            }),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Store(StoreError::Serialization {
            message: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::Resource(ResourceError::NotFound {
            resource_type: "Patient".to_string(),
            id: "123".to_string(),
        });
        assert_eq!(err.to_string(), "resource not found: Patient/123");
    }

    #[test]
    fn test_concurrency_error_display() {
        let err = ConcurrencyError::VersionConflict {
            resource_type: "Patient".to_string(),
            id: "123".to_string(),
            expected_version: "1".to_string(),
            actual_version: "2".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "version conflict on Patient/123: expected 1, found 2"
        );
    }

    #[test]
    fn test_throttled_display() {
        let err = StoreError::Throttled {
            retry_after: Some(Duration::from_millis(250)),
        };
        assert_eq!(err.to_string(), "request rate too large, retry after 250ms");

        let err = StoreError::Throttled { retry_after: None };
        assert_eq!(err.to_string(), "request rate too large");
    }

    #[test]
    fn test_from_client_error() {
        let err: StorageError = ClientError::Throttled {
            retry_after: Some(Duration::from_millis(10)),
        }
        .into();
        assert!(err.is_transient());

        let err: StorageError = ClientError::Transient("connection reset".into()).into();
        assert!(matches!(
            err,
            StorageError::Store(StoreError::Unavailable { .. })
        ));

        let err: StorageError = ClientError::Unavailable("service unavailable".into()).into();
        assert_eq!(err.outcome().status, http::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.outcome().retry_after, None);

        let err: StorageError = ClientError::Fatal("bad request".into()).into();
        assert_eq!(err.outcome().status, http::StatusCode::INTERNAL_SERVER_ERROR);

        let err: StorageError = ClientError::PreconditionFailed.into();
        assert!(matches!(err, StorageError::Store(StoreError::Internal { .. })));
    }

    #[test]
    fn test_conflict_classification() {
        let err: StorageError = JobError::Conflict {
            job_id: "j1".to_string(),
        }
        .into();
        assert!(err.is_conflict());
        assert!(!err.is_transient());
    }
}
