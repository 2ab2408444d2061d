//! Configuration for the document store, its retry policy, distributed
//! locking and the reindex job engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult, StoreError};

/// Connection and layout settings for the document store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataStoreConfig {
    /// Store endpoint.
    #[serde(default = "default_host")]
    pub host: String,

    /// Store access key.
    #[serde(default, skip_serializing)]
    pub key: String,

    /// Database holding all collections.
    #[serde(default = "default_database_id")]
    pub database_id: String,

    /// Throughput provisioned when the database is created.
    #[serde(default)]
    pub initial_database_throughput: Option<u32>,

    /// Collection holding clinical resources, locks, markers and jobs.
    #[serde(default = "default_fhir_collection_id")]
    pub fhir_collection_id: String,

    /// Throughput provisioned for the resource collection.
    #[serde(default)]
    pub initial_fhir_collection_throughput: Option<u32>,

    /// Collection holding identity providers and roles.
    #[serde(default = "default_control_plane_collection_id")]
    pub control_plane_collection_id: String,

    /// Throughput provisioned for the control-plane collection.
    #[serde(default)]
    pub initial_control_plane_collection_throughput: Option<u32>,

    /// Create the database if it does not exist.
    #[serde(default = "default_true")]
    pub allow_database_creation: bool,

    /// Page size used when an upgrade or scan walks documents.
    #[serde(default = "default_data_migration_batch_size")]
    pub data_migration_batch_size: usize,

    /// How many times the upgrade manager tries to take the upgrade lock.
    #[serde(default = "default_upgrade_lock_attempts")]
    pub upgrade_lock_attempts: u32,

    /// Bounded re-read/retry budget for untagged writes that lose a race.
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,

    /// Retry policy for store requests.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Distributed lock settings.
    #[serde(default)]
    pub lock: LockConfig,
}

fn default_host() -> String {
    "https://localhost:8081".to_string()
}

fn default_database_id() -> String {
    "health".to_string()
}

fn default_fhir_collection_id() -> String {
    "fhir".to_string()
}

fn default_control_plane_collection_id() -> String {
    "controlPlane".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_migration_batch_size() -> usize {
    100
}

fn default_upgrade_lock_attempts() -> u32 {
    3
}

fn default_max_write_attempts() -> u32 {
    5
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            key: String::new(),
            database_id: default_database_id(),
            initial_database_throughput: None,
            fhir_collection_id: default_fhir_collection_id(),
            initial_fhir_collection_throughput: None,
            control_plane_collection_id: default_control_plane_collection_id(),
            initial_control_plane_collection_throughput: None,
            allow_database_creation: true,
            data_migration_batch_size: default_data_migration_batch_size(),
            upgrade_lock_attempts: default_upgrade_lock_attempts(),
            max_write_attempts: default_max_write_attempts(),
            retry: RetryConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

impl DataStoreConfig {
    /// Validates configuration invariants.
    pub fn validate(&self) -> StorageResult<()> {
        let invalid = |message: &str| {
            Err(StorageError::Store(StoreError::InvalidConfiguration {
                message: message.to_string(),
            }))
        };

        if self.host.trim().is_empty() {
            return invalid("host must not be empty");
        }
        if self.database_id.trim().is_empty() {
            return invalid("database_id must not be empty");
        }
        if self.fhir_collection_id.trim().is_empty() {
            return invalid("fhir_collection_id must not be empty");
        }
        if self.control_plane_collection_id.trim().is_empty() {
            return invalid("control_plane_collection_id must not be empty");
        }
        if self.control_plane_collection_id == self.fhir_collection_id {
            return invalid("control_plane_collection_id must differ from fhir_collection_id");
        }
        if self.data_migration_batch_size == 0 {
            return invalid("data_migration_batch_size must be > 0");
        }
        if self.upgrade_lock_attempts == 0 {
            return invalid("upgrade_lock_attempts must be > 0");
        }
        if self.max_write_attempts == 0 {
            return invalid("max_write_attempts must be > 0");
        }

        self.retry.validate()?;
        self.lock.validate()
    }
}

/// Retry policy for requests to the document store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries of a throttled request.
    #[serde(default = "default_max_number_of_retries")]
    pub max_number_of_retries: u32,

    /// Cumulative time a single request may spend waiting on throttling.
    #[serde(with = "humantime_serde", default = "default_max_wait_time")]
    pub max_wait_time: Duration,

    /// Maximum number of retries of a transient (timeout, reset) failure.
    #[serde(default = "default_transient_max_retries")]
    pub transient_max_retries: u32,

    /// Initial backoff between retries.
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Maximum backoff between retries.
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Backoff multiplier.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_number_of_retries() -> u32 {
    9
}

fn default_max_wait_time() -> Duration {
    Duration::from_secs(30)
}

fn default_transient_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_number_of_retries: default_max_number_of_retries(),
            max_wait_time: default_max_wait_time(),
            transient_max_retries: default_transient_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Validates configuration invariants.
    pub fn validate(&self) -> StorageResult<()> {
        if self.backoff_multiplier < 1.0 {
            return Err(StorageError::Store(StoreError::InvalidConfiguration {
                message: "retry.backoff_multiplier must be >= 1.0".to_string(),
            }));
        }
        if self.initial_delay > self.max_delay {
            return Err(StorageError::Store(StoreError::InvalidConfiguration {
                message: "retry.initial_delay must not exceed retry.max_delay".to_string(),
            }));
        }
        Ok(())
    }
}

/// Distributed lock settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long `acquire` keeps trying before failing with a timeout.
    #[serde(with = "humantime_serde", default = "default_acquire_timeout")]
    pub acquire_timeout: Duration,

    /// First backoff between acquire attempts.
    #[serde(with = "humantime_serde", default = "default_retry_interval")]
    pub retry_interval: Duration,

    /// Backoff cap between acquire attempts.
    #[serde(with = "humantime_serde", default = "default_max_retry_interval")]
    pub max_retry_interval: Duration,

    /// Lease requested by the upgrade manager.
    #[serde(with = "humantime_serde", default = "default_lease")]
    pub lease: Duration,
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_retry_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_max_retry_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_lease() -> Duration {
    Duration::from_secs(60)
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: default_acquire_timeout(),
            retry_interval: default_retry_interval(),
            max_retry_interval: default_max_retry_interval(),
            lease: default_lease(),
        }
    }
}

impl LockConfig {
    /// Validates configuration invariants.
    pub fn validate(&self) -> StorageResult<()> {
        if self.lease.is_zero() {
            return Err(StorageError::Store(StoreError::InvalidConfiguration {
                message: "lock.lease must be > 0".to_string(),
            }));
        }
        if self.retry_interval.is_zero() {
            return Err(StorageError::Store(StoreError::InvalidConfiguration {
                message: "lock.retry_interval must be > 0".to_string(),
            }));
        }
        Ok(())
    }
}

/// Reindex job engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReindexJobConfig {
    /// Run the background scheduler.
    #[serde(default)]
    pub enabled: bool,

    /// Thread count used when a request does not name one.
    #[serde(default = "default_max_threads_per_job")]
    pub default_max_threads_per_job: u16,

    /// A running job whose heartbeat is older than this may be taken over.
    #[serde(with = "humantime_serde", default = "default_heartbeat_timeout")]
    pub job_heartbeat_timeout_threshold: Duration,

    /// Interval between scheduler polls.
    #[serde(with = "humantime_serde", default = "default_polling_frequency")]
    pub job_polling_frequency: Duration,

    /// Batch size used when a request does not name one.
    #[serde(default = "default_max_resources_per_query")]
    pub max_resources_per_query: u32,

    /// Active jobs allowed at once. Fixed at one; not configurable from outside the crate.
    #[serde(skip, default = "default_max_concurrent_jobs")]
    max_concurrent_jobs: u32,
}

fn default_max_threads_per_job() -> u16 {
    1
}

fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_polling_frequency() -> Duration {
    Duration::from_secs(10)
}

fn default_max_resources_per_query() -> u32 {
    100
}

fn default_max_concurrent_jobs() -> u32 {
    1
}

impl Default for ReindexJobConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_max_threads_per_job: default_max_threads_per_job(),
            job_heartbeat_timeout_threshold: default_heartbeat_timeout(),
            job_polling_frequency: default_polling_frequency(),
            max_resources_per_query: default_max_resources_per_query(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
        }
    }
}

impl ReindexJobConfig {
    /// Active jobs allowed at once.
    pub fn max_concurrent_jobs(&self) -> u32 {
        self.max_concurrent_jobs
    }

    /// Validates configuration invariants.
    pub fn validate(&self) -> StorageResult<()> {
        let invalid = |message: &str| {
            Err(StorageError::Store(StoreError::InvalidConfiguration {
                message: message.to_string(),
            }))
        };

        if self.default_max_threads_per_job == 0 {
            return invalid("reindex.default_max_threads_per_job must be > 0");
        }
        if self.max_resources_per_query == 0 {
            return invalid("reindex.max_resources_per_query must be > 0");
        }
        if self.job_heartbeat_timeout_threshold.is_zero() {
            return invalid("reindex.job_heartbeat_timeout_threshold must be > 0");
        }
        if self.job_polling_frequency.is_zero() {
            return invalid("reindex.job_polling_frequency must be > 0");
        }
        Ok(())
    }
}

/// Serde module for Duration with humantime format.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(DataStoreConfig::default().validate().is_ok());
        assert!(ReindexJobConfig::default().validate().is_ok());
    }

    #[test]
    fn test_reindex_defaults() {
        let config = ReindexJobConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.default_max_threads_per_job, 1);
        assert_eq!(config.job_heartbeat_timeout_threshold, Duration::from_secs(600));
        assert_eq!(config.job_polling_frequency, Duration::from_secs(10));
        assert_eq!(config.max_resources_per_query, 100);
        assert_eq!(config.max_concurrent_jobs(), 1);
    }

    #[test]
    fn test_max_concurrent_jobs_not_deserialized() {
        let config: ReindexJobConfig =
            serde_json::from_str(r#"{"enabled": true, "max_concurrent_jobs": 5}"#).unwrap();
        assert!(config.enabled);
        assert_eq!(config.max_concurrent_jobs(), 1);
    }

    #[test]
    fn test_durations_parse_humantime() {
        let config: RetryConfig =
            serde_json::from_str(r#"{"max_wait_time": "2s", "initial_delay": "50ms"}"#).unwrap();
        assert_eq!(config.max_wait_time, Duration::from_secs(2));
        assert_eq!(config.initial_delay, Duration::from_millis(50));
        assert_eq!(config.max_number_of_retries, 9);
    }

    #[test]
    fn test_validate_rejects_shared_collection() {
        let config = DataStoreConfig {
            control_plane_collection_id: "fhir".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let config = DataStoreConfig {
            data_migration_batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
