//! Domain layer for batch-runner.
//!
//! Job specifications, persisted job progress and platform metadata.

mod catalog;
mod job_spec;
mod job_state;

pub use catalog::PlatformCatalog;
pub use job_spec::{JobSpec, SubmitMode, validate_batch, walltime_hours, walltime_seconds};
pub use job_state::{JobState, Stage, StageStatus};
