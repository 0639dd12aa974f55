//! Transfer task model.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::fs::display_name;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    Upload,
    Download,
}

impl TransferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

impl std::fmt::Display for TransferType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a transfer task.
///
/// ```text
/// Queued -> Initializing -> Active -> Completed | Failed | Cancelled
///                           Active <-> Paused
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Queued,
    Initializing,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    pub const ALL: [TransferState; 7] = [
        TransferState::Queued,
        TransferState::Initializing,
        TransferState::Active,
        TransferState::Paused,
        TransferState::Completed,
        TransferState::Failed,
        TransferState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States a retry may start from.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parameters of a transfer, reused verbatim by a retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransferRequest {
    Upload { source: PathBuf },
    Download { file_id: String, dest: PathBuf },
}

impl TransferRequest {
    pub fn transfer_type(&self) -> TransferType {
        match self {
            Self::Upload { .. } => TransferType::Upload,
            Self::Download { .. } => TransferType::Download,
        }
    }

    /// Name shown to users: the local file name.
    pub fn display_name(&self) -> String {
        match self {
            Self::Upload { source } => display_name(source),
            Self::Download { dest, .. } => display_name(dest),
        }
    }
}

/// An ad-hoc single-file transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTask {
    /// Unique per enqueue; a retry gets a new ID.
    pub id: String,
    pub transfer_type: TransferType,
    pub name: String,
    /// Size in bytes, 0 until known.
    pub size: u64,
    /// Fraction transferred in `[0, 1]`.
    pub progress: f64,
    /// Bytes per second over the last progress interval.
    pub speed: f64,
    pub state: TransferState,
    pub error: Option<String>,
    pub request: TransferRequest,
    pub created_at: DateTime<Utc>,
}

impl TransferTask {
    pub fn new(request: TransferRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            transfer_type: request.transfer_type(),
            name: request.display_name(),
            size: 0,
            progress: 0.0,
            speed: 0.0,
            state: TransferState::Queued,
            error: None,
            request,
            created_at: Utc::now(),
        }
    }
}

/// Snapshot of task counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    pub queued: usize,
    pub initializing: usize,
    pub active: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TransferStats {
    pub fn record(&mut self, state: TransferState) {
        match state {
            TransferState::Queued => self.queued += 1,
            TransferState::Initializing => self.initializing += 1,
            TransferState::Active => self.active += 1,
            TransferState::Paused => self.paused += 1,
            TransferState::Completed => self.completed += 1,
            TransferState::Failed => self.failed += 1,
            TransferState::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.queued
            + self.initializing
            + self.active
            + self.paused
            + self.completed
            + self.failed
            + self.cancelled
    }
}
