//! Host process configuration.
//!
//! Every option can be given on the command line or through the environment.
//! Store settings left unset fall back to the optional JSON store
//! configuration file, then to the library defaults.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `HFS_LOG_LEVEL` | info | Log level (error, warn, info, debug, trace) |
//! | `HFS_STORE_CONFIG` | | Path to a JSON store configuration file |
//! | `HFS_STORE_HOST` | | Store endpoint |
//! | `HFS_STORE_KEY` | | Store access key |
//! | `HFS_DATABASE_ID` | | Database name |
//! | `HFS_FHIR_COLLECTION` | | Resource collection name |
//! | `HFS_CONTROL_PLANE_COLLECTION` | | Control-plane collection name |
//! | `HFS_ALLOW_DATABASE_CREATION` | | Create the database when it is missing |
//! | `HFS_REINDEX_ENABLED` | false | Run the background reindex worker |
//! | `HFS_REINDEX_POLLING_SECONDS` | 10 | Seconds between reindex polls |
//! | `HFS_REINDEX_HEARTBEAT_TIMEOUT_SECONDS` | 600 | Seconds before a silent job may be taken over |
//! | `HFS_REINDEX_MAX_THREADS` | 1 | Default parallelism of a reindex job |
//! | `HFS_REINDEX_BATCH_SIZE` | 100 | Default batch size of a reindex job |

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use helios_docstore::config::{DataStoreConfig, ReindexJobConfig};

/// Host process configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "hfs")]
#[command(about = "Helios FHIR Server - document store host")]
pub struct ServerConfig {
    /// Log level (error, warn, info, debug, trace).
    #[arg(long, env = "HFS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// JSON file holding a full store configuration.
    #[arg(long, env = "HFS_STORE_CONFIG")]
    pub store_config: Option<PathBuf>,

    /// Store endpoint.
    #[arg(long, env = "HFS_STORE_HOST")]
    pub store_host: Option<String>,

    /// Store access key.
    #[arg(long, env = "HFS_STORE_KEY", hide_env_values = true)]
    pub store_key: Option<String>,

    /// Database name.
    #[arg(long, env = "HFS_DATABASE_ID")]
    pub database_id: Option<String>,

    /// Resource collection name.
    #[arg(long, env = "HFS_FHIR_COLLECTION")]
    pub fhir_collection: Option<String>,

    /// Control-plane collection name.
    #[arg(long, env = "HFS_CONTROL_PLANE_COLLECTION")]
    pub control_plane_collection: Option<String>,

    /// Create the database when it is missing.
    #[arg(long, env = "HFS_ALLOW_DATABASE_CREATION")]
    pub allow_database_creation: Option<bool>,

    /// Run the background reindex worker.
    #[arg(long, env = "HFS_REINDEX_ENABLED", default_value = "false")]
    pub reindex_enabled: bool,

    /// Seconds between reindex polls.
    #[arg(long, env = "HFS_REINDEX_POLLING_SECONDS", default_value = "10")]
    pub reindex_polling_seconds: u64,

    /// Seconds without a heartbeat before a running job may be taken over.
    #[arg(long, env = "HFS_REINDEX_HEARTBEAT_TIMEOUT_SECONDS", default_value = "600")]
    pub reindex_heartbeat_timeout_seconds: u64,

    /// Parallelism of a reindex job that does not name one.
    #[arg(long, env = "HFS_REINDEX_MAX_THREADS", default_value = "1")]
    pub reindex_max_threads: u16,

    /// Batch size of a reindex job that does not name one.
    #[arg(long, env = "HFS_REINDEX_BATCH_SIZE", default_value = "100")]
    pub reindex_batch_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            store_config: None,
            store_host: None,
            store_key: None,
            database_id: None,
            fhir_collection: None,
            control_plane_collection: None,
            allow_database_creation: None,
            reindex_enabled: false,
            reindex_polling_seconds: 10,
            reindex_heartbeat_timeout_seconds: 600,
            reindex_max_threads: 1,
            reindex_batch_size: 100,
        }
    }
}

impl ServerConfig {
    /// Checks the command-line values. Store settings are checked later, once
    /// merged with the configuration file.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !matches!(
            self.log_level.to_ascii_lowercase().as_str(),
            "error" | "warn" | "info" | "debug" | "trace"
        ) {
            errors.push(format!("Unknown log level: {}", self.log_level));
        }
        if self.reindex_polling_seconds == 0 {
            errors.push("Reindex polling interval must be at least one second".to_string());
        }
        if self.reindex_heartbeat_timeout_seconds <= self.reindex_polling_seconds {
            errors.push(
                "Reindex heartbeat timeout must be longer than the polling interval".to_string(),
            );
        }
        if self.reindex_max_threads == 0 {
            errors.push("Reindex max threads must be greater than 0".to_string());
        }
        if self.reindex_batch_size == 0 {
            errors.push("Reindex batch size must be greater than 0".to_string());
        }
        for (name, value) in [
            ("Database id", &self.database_id),
            ("FHIR collection", &self.fhir_collection),
            ("Control-plane collection", &self.control_plane_collection),
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                errors.push(format!("{name} must not be empty"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Builds the store configuration: file values first, then explicit
    /// command-line overrides.
    pub fn data_store_config(&self) -> anyhow::Result<DataStoreConfig> {
        let mut config = match &self.store_config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading store config {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing store config {}", path.display()))?
            }
            None => DataStoreConfig::default(),
        };

        if let Some(host) = &self.store_host {
            config.host = host.clone();
        }
        if let Some(key) = &self.store_key {
            config.key = key.clone();
        }
        if let Some(database_id) = &self.database_id {
            config.database_id = database_id.clone();
        }
        if let Some(collection) = &self.fhir_collection {
            config.fhir_collection_id = collection.clone();
        }
        if let Some(collection) = &self.control_plane_collection {
            config.control_plane_collection_id = collection.clone();
        }
        if let Some(allow) = self.allow_database_creation {
            config.allow_database_creation = allow;
        }
        Ok(config)
    }

    pub fn reindex_config(&self) -> ReindexJobConfig {
        let mut config = ReindexJobConfig::default();
        config.enabled = self.reindex_enabled;
        config.default_max_threads_per_job = self.reindex_max_threads;
        config.job_heartbeat_timeout_threshold =
            Duration::from_secs(self.reindex_heartbeat_timeout_seconds);
        config.job_polling_frequency = Duration::from_secs(self.reindex_polling_seconds);
        config.max_resources_per_query = self.reindex_batch_size;
        config
    }
}
