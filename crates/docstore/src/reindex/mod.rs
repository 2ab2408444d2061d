//! Background reindexing.
//!
//! A reindex job walks every current resource of the selected types and
//! rewrites its search indices when they were computed with a different
//! search-parameter hash. Jobs are documents in the resource collection;
//! runners claim them with conditional writes and record a heartbeat on the
//! store clock after every batch. A `Running` job whose heartbeat goes stale
//! is taken over by another runner and resumes from its cursor.
//!
//! ```text
//! Created ──claim──> Running ──cursor exhausted──> Completed
//!    │                  │ ──batch error──────────> Failed
//!    └──cancel──> Canceled <──cancel requested──┘
//! ```

mod engine;
mod indexer;
mod models;
mod task;

pub use engine::ReindexJobWorker;
pub use indexer::{CompartmentIndexer, SearchIndexer};
pub use models::{
    ReindexCursor, ReindexJobId, ReindexJobRecord, ReindexJobWrapper, ReindexProgress,
    ReindexRequest, ReindexStatus,
};
pub use task::{BatchOutcome, ReindexJobTask};
