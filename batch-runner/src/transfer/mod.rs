//! Ad-hoc single-file transfers, independent of the batch pipeline.

mod queue;
mod task;

pub use queue::TransferQueue;
pub use task::{TransferRequest, TransferState, TransferStats, TransferTask, TransferType};
