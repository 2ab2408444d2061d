//! Document store client implementations.
//!
//! | Backend | Description |
//! |---------|-------------|
//! | [`memory`] | In-process store with conditional writes, a store clock, paging and fault injection; used for local runs and tests |
//!
//! A client for a remote store implements [`DocumentClient`](crate::client::DocumentClient)
//! and is handed to [`StoreInitializer`](crate::initializer::StoreInitializer).

pub mod memory;

pub use memory::{InMemoryDocumentClient, OperationKind};
