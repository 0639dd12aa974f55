//! Resumable persisted state of job batches.

mod model;
mod store;

pub use model::JobStateDbModel;
pub use store::{StateStore, state_file_path};
