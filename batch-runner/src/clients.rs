//! Seams to the external collaborators.
//!
//! Archive construction, the object-storage wire protocol and the job
//! platform API live outside this crate. The engine and the transfer queue
//! only see these traits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::domain::{JobSpec, PlatformCatalog};
use crate::{Error, Result};

/// Builds an archive of a job directory.
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Archive `dir`, returning the path of the created archive.
    async fn create_archive(
        &self,
        dir: &Path,
        include_patterns: &[String],
        exclude_patterns: &[String],
    ) -> Result<PathBuf>;
}

/// Moves files to and from the provider's object store.
///
/// Implementations should call [`TransferControl::report`] as bytes move and
/// [`TransferControl::checkpoint`] between chunks so pause and cancel take
/// effect.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Upload a local file, returning the remote file ID.
    async fn upload(&self, path: &Path, control: &TransferControl) -> Result<String>;

    /// Download a remote file to `dest`.
    async fn download(&self, file_id: &str, dest: &Path, control: &TransferControl) -> Result<()>;
}

/// The job platform API.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Register a job record, returning the platform job ID.
    async fn create_job(&self, request: &JobRequest) -> Result<String>;

    /// Submit a created job for execution.
    async fn submit_job(&self, job_id: &str) -> Result<()>;

    /// Current remote status of each job ID.
    async fn get_job_statuses(&self, job_ids: &[String]) -> Result<HashMap<String, String>>;

    /// Core types and analysis codes offered by the platform.
    async fn fetch_catalog(&self) -> Result<PlatformCatalog>;
}

/// Remote job creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,
    pub analysis_code: String,
    pub analysis_version: String,
    pub command: String,
    pub core_type: String,
    pub cores_per_slot: u32,
    pub slots: u32,
    pub walltime_seconds: u64,
    pub license_settings: String,
    /// Archive file ID first, then extra input files.
    pub input_file_ids: Vec<String>,
    pub tags: Vec<String>,
    pub project_id: Option<String>,
}

impl JobRequest {
    /// Build the request for a job whose inputs are already uploaded.
    pub fn from_spec(spec: &JobSpec, input_file_ids: Vec<String>) -> Self {
        Self {
            name: spec.job_name.clone(),
            analysis_code: spec.analysis_code.clone(),
            analysis_version: spec.analysis_version.clone(),
            command: spec.command.clone(),
            core_type: spec.core_type.clone(),
            cores_per_slot: spec.cores_per_slot,
            slots: spec.slots,
            walltime_seconds: spec.walltime_seconds(),
            license_settings: spec.license_settings.clone(),
            input_file_ids,
            tags: spec.tags.clone(),
            project_id: spec.project_id.clone(),
        }
    }
}

type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Progress reporting and pause/cancel checkpoints for one transfer.
#[derive(Clone)]
pub struct TransferControl {
    cancel: CancellationToken,
    paused: Option<watch::Receiver<bool>>,
    on_progress: Option<ProgressFn>,
}

impl TransferControl {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            paused: None,
            on_progress: None,
        }
    }

    /// A control that never pauses, never cancels and discards progress.
    pub fn noop() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Honor a pause flag at checkpoints.
    pub fn with_pause(mut self, paused: watch::Receiver<bool>) -> Self {
        self.paused = Some(paused);
        self
    }

    /// Receive `(bytes_done, bytes_total)` on every report.
    pub fn with_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(f));
        self
    }

    pub fn report(&self, bytes_done: u64, bytes_total: u64) {
        if let Some(f) = &self.on_progress {
            f(bytes_done, bytes_total);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait while paused; fail with [`Error::Cancelled`] once cancelled.
    pub async fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Some(paused) = &self.paused else {
            return Ok(());
        };

        let mut paused = paused.clone();
        loop {
            if !*paused.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                changed = paused.changed() => {
                    if changed.is_err() {
                        // Pause owner is gone; nothing can resume us later.
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for TransferControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferControl")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("pausable", &self.paused.is_some())
            .finish()
    }
}
