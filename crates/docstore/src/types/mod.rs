//! Core types for stored resources.
//!
//! - [`ResourceWrapper`] - a resource version with its persistence metadata
//! - [`WeakETag`] - the version tag exchanged with clients
//! - [`ResourceKey`] - identifies a resource or one of its versions
//! - [`SaveOutcome`] - the result of a write

mod etag;
mod resource_wrapper;

pub use etag::{WeakETag, normalize_etag};
pub use resource_wrapper::{
    CompartmentIndices, RawResource, ResourceFormat, ResourceKey, ResourceMethod, ResourceWrapper,
    SaveOutcome, SaveOutcomeType,
};
pub(crate) use resource_wrapper::partition_key;
