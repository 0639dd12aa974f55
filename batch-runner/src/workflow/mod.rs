//! Batch-preparation session workflow.

mod controller;
mod state;

pub use controller::{JobTemplate, WorkflowController, WorkflowMemory};
pub use state::{WorkflowPath, WorkflowState, is_legal_transition};
