//! Reindex job records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;
use crate::types::WeakETag;

/// Lifecycle of a reindex job.
///
/// `Created -> Running -> {Completed, Failed, Canceled}`; a `Created` job can
/// also be canceled directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReindexStatus {
    Created,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl ReindexStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, ReindexStatus::Created | ReindexStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReindexStatus::Created => "created",
            ReindexStatus::Running => "running",
            ReindexStatus::Completed => "completed",
            ReindexStatus::Failed => "failed",
            ReindexStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ReindexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReindexStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "created" => Ok(ReindexStatus::Created),
            "running" => Ok(ReindexStatus::Running),
            "completed" => Ok(ReindexStatus::Completed),
            "failed" => Ok(ReindexStatus::Failed),
            "canceled" | "cancelled" => Ok(ReindexStatus::Canceled),
            _ => Err(JobError::InvalidRequest {
                message: format!("unknown job status '{s}'"),
            }),
        }
    }
}

/// Identifier of a reindex job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReindexJobId(String);

impl ReindexJobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ReindexJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for ReindexJobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ReindexJobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ReindexJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resume position: index into the job's resource types and the store
/// continuation within that type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReindexCursor {
    pub type_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<String>,
}

/// Counters for one resource type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReindexProgress {
    /// Resources read.
    pub processed: u64,
    /// Resources whose indices were rewritten.
    pub reindexed: u64,
    /// Resources already indexed with the current hash.
    pub skipped: u64,
    /// Resources that changed while being reindexed.
    pub conflicts: u64,
}

impl ReindexProgress {
    pub fn add(&mut self, other: &ReindexProgress) {
        self.processed += other.processed;
        self.reindexed += other.reindexed;
        self.skipped += other.skipped;
        self.conflicts += other.conflicts;
    }
}

/// Persisted state of a reindex job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReindexJobRecord {
    pub id: ReindexJobId,
    pub status: ReindexStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Store-clock time of the runner's last write.
    #[serde(default)]
    pub heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub runner_id: Option<String>,
    pub resource_types: Vec<String>,
    #[serde(default)]
    pub cursor: ReindexCursor,
    #[serde(default)]
    pub progress: BTreeMap<String, ReindexProgress>,
    pub batch_size: u32,
    pub max_threads: u16,
    pub search_parameter_hash: String,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl ReindexJobRecord {
    pub fn new(
        resource_types: Vec<String>,
        batch_size: u32,
        max_threads: u16,
        search_parameter_hash: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReindexJobId::new(),
            status: ReindexStatus::Created,
            created_at,
            started_at: None,
            end_time: None,
            heartbeat: None,
            runner_id: None,
            resource_types,
            cursor: ReindexCursor::default(),
            progress: BTreeMap::new(),
            batch_size,
            max_threads,
            search_parameter_hash: search_parameter_hash.into(),
            cancel_requested: false,
            error: None,
        }
    }

    /// The resource type the cursor points at, or `None` when every type is done.
    pub fn current_resource_type(&self) -> Option<&str> {
        self.resource_types
            .get(self.cursor.type_index)
            .map(String::as_str)
    }

    /// A running job whose heartbeat is older than `threshold` at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        if self.status != ReindexStatus::Running {
            return false;
        }
        let threshold = TimeDelta::from_std(threshold).unwrap_or(TimeDelta::MAX);
        match self.heartbeat {
            Some(heartbeat) => now.signed_duration_since(heartbeat) > threshold,
            None => true,
        }
    }

    /// Sum of all per-type counters.
    pub fn total_progress(&self) -> ReindexProgress {
        let mut total = ReindexProgress::default();
        for progress in self.progress.values() {
            total.add(progress);
        }
        total
    }

    pub(crate) fn finish(&mut self, status: ReindexStatus, now: DateTime<Utc>) {
        self.status = status;
        self.end_time = Some(now);
        self.heartbeat = Some(now);
    }
}

/// A job record together with the store ETag it was read with.
#[derive(Debug, Clone, PartialEq)]
pub struct ReindexJobWrapper {
    pub record: ReindexJobRecord,
    pub etag: String,
}

impl ReindexJobWrapper {
    pub fn new(record: ReindexJobRecord, etag: String) -> Self {
        Self { record, etag }
    }

    /// The ETag rendered for HTTP clients.
    pub fn weak_etag(&self) -> WeakETag {
        WeakETag::from_weak_etag(&self.etag)
    }
}

/// Parameters of a reindex request; unset values take the configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReindexRequest {
    #[serde(default)]
    pub resource_types: Option<Vec<String>>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub max_threads: Option<u16>,
}
