//! Mapping of storage errors to HTTP outcomes.
//!
//! The HTTP layer itself lives outside this crate; it asks a
//! [`StorageError`] for its [`ErrorOutcome`] and renders that.
//!
//! | Storage Error | HTTP Status | FHIR Issue Code | Extra |
//! |--------------|-------------|-----------------|-------|
//! | NotFound / VersionNotFound | 404 | not-found | |
//! | Gone | 410 | deleted | ETag of the deleted version |
//! | VersionConflict | 412 | conflict | current ETag |
//! | DocumentChanged | 409 | conflict | |
//! | Throttled | 429 | throttled | `x-ms-retry-after-ms` |
//! | Unavailable / LockTimeout / LockLost | 503 | transient | |
//! | ActiveJobExists / job Conflict | 409 | conflict | |
//! | ResourceNotSupported | 400 | not-supported | |
//! | Upgrade / internal | 500 | exception | |

use std::time::Duration;

use http::StatusCode;

use crate::error::{
    ConcurrencyError, ControlPlaneError, DefinitionError, JobError, ResourceError, StorageError,
    StoreError,
};
use crate::types::WeakETag;

/// Response header carrying the retry delay of a throttled request.
pub const RETRY_AFTER_MS_HEADER: &str = "x-ms-retry-after-ms";

/// How an error should be reported to an HTTP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorOutcome {
    /// HTTP status code.
    pub status: StatusCode,
    /// FHIR `OperationOutcome.issue.code`.
    pub issue_code: &'static str,
    /// Delay to report in [`RETRY_AFTER_MS_HEADER`].
    pub retry_after: Option<Duration>,
    /// ETag to report in the `ETag` header.
    pub etag: Option<WeakETag>,
}

impl ErrorOutcome {
    fn new(status: StatusCode, issue_code: &'static str) -> Self {
        Self {
            status,
            issue_code,
            retry_after: None,
            etag: None,
        }
    }

    fn with_etag(mut self, version_id: &str) -> Self {
        self.etag = Some(WeakETag::from_version_id(version_id));
        self
    }

    /// Returns the extra response headers for this outcome.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::new();
        if let Some(etag) = &self.etag {
            headers.push(("ETag", etag.to_string()));
        }
        if let Some(delay) = self.retry_after {
            headers.push((RETRY_AFTER_MS_HEADER, delay.as_millis().to_string()));
        }
        headers
    }
}

impl StorageError {
    /// Maps this error to its HTTP outcome.
    pub fn outcome(&self) -> ErrorOutcome {
        match self {
            StorageError::Resource(e) => match e {
                ResourceError::NotFound { .. } | ResourceError::VersionNotFound { .. } => {
                    ErrorOutcome::new(StatusCode::NOT_FOUND, "not-found")
                }
                ResourceError::Gone { version_id, .. } => {
                    ErrorOutcome::new(StatusCode::GONE, "deleted").with_etag(version_id)
                }
            },
            StorageError::Concurrency(e) => match e {
                ConcurrencyError::VersionConflict { actual_version, .. } => {
                    ErrorOutcome::new(StatusCode::PRECONDITION_FAILED, "conflict")
                        .with_etag(actual_version)
                }
                ConcurrencyError::DocumentChanged { .. } => {
                    ErrorOutcome::new(StatusCode::CONFLICT, "conflict")
                }
                ConcurrencyError::LockTimeout { .. } | ConcurrencyError::LockLost { .. } => {
                    ErrorOutcome::new(StatusCode::SERVICE_UNAVAILABLE, "transient")
                }
            },
            StorageError::Store(e) => match e {
                StoreError::Throttled { retry_after } => ErrorOutcome {
                    retry_after: *retry_after,
                    ..ErrorOutcome::new(StatusCode::TOO_MANY_REQUESTS, "throttled")
                },
                StoreError::Unavailable { .. } => {
                    ErrorOutcome::new(StatusCode::SERVICE_UNAVAILABLE, "transient")
                }
                _ => ErrorOutcome::new(StatusCode::INTERNAL_SERVER_ERROR, "exception"),
            },
            StorageError::Upgrade(_) => {
                ErrorOutcome::new(StatusCode::INTERNAL_SERVER_ERROR, "exception")
            }
            StorageError::Job(e) => match e {
                JobError::NotFound { .. } => ErrorOutcome::new(StatusCode::NOT_FOUND, "not-found"),
                JobError::Conflict { .. } | JobError::ActiveJobExists { .. } => {
                    ErrorOutcome::new(StatusCode::CONFLICT, "conflict")
                }
                JobError::InvalidRequest { .. } => {
                    ErrorOutcome::new(StatusCode::BAD_REQUEST, "invalid")
                }
            },
            StorageError::Definition(e) => match e {
                DefinitionError::ResourceNotSupported { .. } => {
                    ErrorOutcome::new(StatusCode::BAD_REQUEST, "not-supported")
                }
                DefinitionError::InvalidDefinition { .. } => {
                    ErrorOutcome::new(StatusCode::INTERNAL_SERVER_ERROR, "exception")
                }
            },
            StorageError::ControlPlane(e) => match e {
                ControlPlaneError::IdentityProviderNotFound { .. }
                | ControlPlaneError::RoleNotFound { .. } => {
                    ErrorOutcome::new(StatusCode::NOT_FOUND, "not-found")
                }
                ControlPlaneError::Conflict { .. } => {
                    ErrorOutcome::new(StatusCode::PRECONDITION_FAILED, "conflict")
                }
                ControlPlaneError::Invalid { .. } => {
                    ErrorOutcome::new(StatusCode::BAD_REQUEST, "invalid")
                }
            },
        }
    }
}
