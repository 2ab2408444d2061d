//! Helios FHIR Server Document-Store Core
//!
//! This crate coordinates many server processes that share one remote,
//! horizontally-partitioned document store. The only coordination primitive
//! it relies on is the store's conditional write: replace-if-ETag-matches and
//! create-if-absent.
//!
//! # Features
//!
//! - **Store gateway**: a [`DocumentClient`](client::DocumentClient) seam with a
//!   retry wrapper that absorbs throttling and transient failures
//! - **Distributed locking**: leased locks with fencing tokens, measured on the
//!   store clock
//! - **Collection upgrades**: ordered, idempotent upgrade steps applied once per
//!   version under a lock
//! - **Resource storage**: versioned resources with optimistic concurrency and
//!   history
//! - **Reindexing**: resumable background jobs with a single runner per job and
//!   stale-runner takeover
//!
//! # Architecture
//!
//! - [`client`] - Store gateway and retry policy
//! - [`backends`] - In-memory store implementation
//! - [`lock`] - Distributed lock
//! - [`upgrade`] - Collection upgraders and the upgrade manager
//! - [`initializer`] - Store startup
//! - [`store`] - Resource store and job persistence
//! - [`reindex`] - Reindex job engine
//! - [`definition`] - Compartment definitions
//! - [`control_plane`] - Identity providers and roles
//! - [`error`] / [`outcome`] - Error types and their HTTP mapping
//! - [`config`] - Configuration
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use helios_docstore::backends::InMemoryDocumentClient;
//! use helios_docstore::config::DataStoreConfig;
//! use helios_docstore::initializer::StoreInitializer;
//! use helios_docstore::types::{RawResource, ResourceMethod, ResourceWrapper};
//!
//! # tokio_test();
//! # fn tokio_test() {
//! # let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
//! # rt.block_on(async {
//! let initializer = StoreInitializer::new(
//!     Arc::new(InMemoryDocumentClient::new()),
//!     DataStoreConfig::default(),
//! );
//! let ready = initializer.initialize().await.unwrap();
//!
//! let patient = ResourceWrapper::new(
//!     "Patient",
//!     "p1",
//!     RawResource::json(r#"{"resourceType":"Patient","id":"p1"}"#),
//!     ResourceMethod::Put,
//! );
//! let saved = ready
//!     .resource_store
//!     .upsert(patient, None, true, true)
//!     .await
//!     .unwrap();
//! assert_eq!(saved.etag().to_string(), "W/\"1\"");
//! # });
//! # }
//! ```

pub mod backends;
pub mod client;
pub mod config;
pub mod control_plane;
pub mod definition;
pub mod error;
pub mod initializer;
pub mod layout;
pub mod lock;
pub mod outcome;
pub mod reindex;
pub mod store;
pub mod types;
pub mod upgrade;

pub use error::{StorageError, StorageResult};
pub use initializer::{InitializedStore, StoreInitializer};
pub use outcome::ErrorOutcome;
pub use store::ResourceStore;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
