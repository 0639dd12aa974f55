//! batch-runner library crate.
//!
//! Drives batches of HPC jobs through archive, upload, create and submit
//! stages with resumable state, plus an independent queue for ad-hoc
//! transfers. Archiving, storage and the platform API are supplied by the
//! caller through the traits in [`clients`].

pub mod cache;
pub mod clients;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod logging;
pub mod pipeline;
pub mod state;
pub mod transfer;
pub mod utils;
pub mod workflow;

pub use error::{Error, Result};
