//! Batch job pipeline.
//!
//! Jobs flow through four stage queues (Tar, Upload, Create, Submit), each
//! serviced by its own bounded worker pool. A job enters the next queue only
//! after its current stage succeeded; a failed stage ends that job alone.

mod manager;
mod report;
mod stages;
mod worker_pool;

pub use manager::{CATALOG_CACHE_KEY, PipelineEngine, PipelineHandle};
pub use report::{JobFailure, RunOutcome, RunReport};
