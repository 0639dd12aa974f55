//! Runtime configuration.
//!
//! Worker pool sizes and queue tuning. Every section deserializes with
//! defaults so partial documents are accepted; pool sizes below 1 are clamped
//! by [`RunnerConfig::normalized`].

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default suffix appended to a batch source path to name its state file.
pub const DEFAULT_STATE_FILE_SUFFIX: &str = ".state.db";

/// Default per-type event buffer capacity.
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub pipeline: PipelineConfig,
    pub transfer: TransferQueueConfig,
    pub events: EventBusConfig,
}

impl RunnerConfig {
    /// Defaults overridden by `BATCH_RUNNER_*` environment variables.
    ///
    /// A `.env` file in the working directory is loaded first when present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config.normalized())
    }

    /// Apply worker count overrides from a key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let targets: [(&str, &mut usize); 5] = [
            ("BATCH_RUNNER_TAR_WORKERS", &mut self.pipeline.tar_workers),
            ("BATCH_RUNNER_UPLOAD_WORKERS", &mut self.pipeline.upload_workers),
            ("BATCH_RUNNER_CREATE_WORKERS", &mut self.pipeline.create_workers),
            ("BATCH_RUNNER_SUBMIT_WORKERS", &mut self.pipeline.submit_workers),
            ("BATCH_RUNNER_TRANSFER_WORKERS", &mut self.transfer.max_workers),
        ];

        for (key, slot) in targets {
            if let Some(raw) = lookup(key) {
                *slot = raw.trim().parse().map_err(|_| {
                    Error::config(format!("{key} must be a whole number, got '{raw}'"))
                })?;
            }
        }
        Ok(())
    }

    /// Clamp every pool size to at least one worker.
    pub fn normalized(mut self) -> Self {
        self.pipeline = self.pipeline.normalized();
        self.transfer = self.transfer.normalized();
        self.events.capacity = self.events.capacity.max(1);
        self
    }
}

/// Pipeline engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Concurrent archive operations.
    pub tar_workers: usize,
    /// Concurrent uploads.
    pub upload_workers: usize,
    /// Concurrent job-creation API calls.
    pub create_workers: usize,
    /// Concurrent job-submission API calls.
    pub submit_workers: usize,
    /// Glob patterns of files to include in archives. Empty means everything.
    pub include_patterns: Vec<String>,
    /// Glob patterns of files to leave out of archives.
    pub exclude_patterns: Vec<String>,
    /// Suffix appended to a batch source path to name its state file.
    pub state_file_suffix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tar_workers: 2,
            upload_workers: 4,
            create_workers: 4,
            submit_workers: 4,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            state_file_suffix: DEFAULT_STATE_FILE_SUFFIX.to_string(),
        }
    }
}

impl PipelineConfig {
    /// Same pool size for every stage.
    pub fn uniform(workers: usize) -> Self {
        Self {
            tar_workers: workers,
            upload_workers: workers,
            create_workers: workers,
            submit_workers: workers,
            ..Default::default()
        }
        .normalized()
    }

    pub fn normalized(mut self) -> Self {
        self.tar_workers = self.tar_workers.max(1);
        self.upload_workers = self.upload_workers.max(1);
        self.create_workers = self.create_workers.max(1);
        self.submit_workers = self.submit_workers.max(1);
        if self.state_file_suffix.is_empty() {
            self.state_file_suffix = DEFAULT_STATE_FILE_SUFFIX.to_string();
        }
        self
    }
}

/// Transfer queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferQueueConfig {
    /// Maximum concurrent transfers.
    pub max_workers: usize,
    /// Idle poll interval of the workers in milliseconds.
    pub poll_interval_ms: u64,
    /// Minimum interval between raw progress events per task in milliseconds.
    pub progress_interval_ms: u64,
}

impl Default for TransferQueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            poll_interval_ms: 200,
            progress_interval_ms: 250,
        }
    }
}

impl TransferQueueConfig {
    pub fn normalized(mut self) -> Self {
        self.max_workers = self.max_workers.max(1);
        self.poll_interval_ms = self.poll_interval_ms.max(1);
        self
    }
}

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Buffered events per subscriber and event type before the oldest are dropped.
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}
