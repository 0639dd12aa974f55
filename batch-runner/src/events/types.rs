//! Event payloads published on the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Stage, StageStatus};
use crate::transfer::{TransferState, TransferType};

/// Progress stage name of the synthetic batch-wide progress event.
pub const OVERALL_STAGE: &str = "overall";

/// Kind of event, used to pick a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Log,
    Progress,
    StateChange,
    Transfer,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::Log,
        EventType::Progress,
        EventType::StateChange,
        EventType::Transfer,
    ];

    pub(super) fn slot(&self) -> usize {
        match self {
            Self::Log => 0,
            Self::Progress => 1,
            Self::StateChange => 2,
            Self::Transfer => 3,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Log => write!(f, "log"),
            Self::Progress => write!(f, "progress"),
            Self::StateChange => write!(f, "state_change"),
            Self::Transfer => write!(f, "transfer"),
        }
    }
}

/// Log level of a user-visible log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// A user-visible log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub stage: Option<Stage>,
    pub job_name: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            stage: None,
            job_name: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn for_job(mut self, stage: Stage, job_name: impl Into<String>) -> Self {
        self.stage = Some(stage);
        self.job_name = Some(job_name.into());
        self
    }
}

/// Fractional progress of one job in one stage, or of the whole batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Stage name, or [`OVERALL_STAGE`] for batch progress.
    pub stage: String,
    pub job_name: Option<String>,
    /// Progress in `[0, 1]`.
    pub progress: f64,
    pub message: String,
}

impl ProgressEvent {
    pub fn stage(stage: Stage, job_name: impl Into<String>, progress: f64) -> Self {
        Self {
            stage: stage.as_str().to_string(),
            job_name: Some(job_name.into()),
            progress: progress.clamp(0.0, 1.0),
            message: String::new(),
        }
    }

    pub fn overall(done: usize, total: usize) -> Self {
        let progress = if total == 0 {
            1.0
        } else {
            done as f64 / total as f64
        };
        Self {
            stage: OVERALL_STAGE.to_string(),
            job_name: None,
            progress,
            message: format!("{done}/{total} jobs finished"),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn is_overall(&self) -> bool {
        self.stage == OVERALL_STAGE
    }
}

/// A job stage changed status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub job_name: String,
    pub stage: Stage,
    pub new_status: StageStatus,
    pub job_id: Option<String>,
    pub error_message: Option<String>,
    /// Upload progress in `[0, 1]` when the stage is an upload.
    pub upload_progress: Option<f64>,
}

/// Lifecycle and progress of an ad-hoc transfer task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransferEvent {
    /// The task moved to a new lifecycle state. Always delivered.
    StateChanged {
        task_id: String,
        transfer_type: TransferType,
        name: String,
        state: TransferState,
        error: Option<String>,
    },
    /// Raw progress sample. May be throttled.
    Progress {
        task_id: String,
        progress: f64,
        speed_bytes_per_sec: f64,
    },
}

impl TransferEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::StateChanged { task_id, .. } | Self::Progress { task_id, .. } => task_id,
        }
    }
}

/// Any event carried by the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Log(LogEvent),
    Progress(ProgressEvent),
    StateChange(StateChangeEvent),
    Transfer(TransferEvent),
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Log(_) => EventType::Log,
            Self::Progress(_) => EventType::Progress,
            Self::StateChange(_) => EventType::StateChange,
            Self::Transfer(_) => EventType::Transfer,
        }
    }
}

impl From<LogEvent> for Event {
    fn from(event: LogEvent) -> Self {
        Self::Log(event)
    }
}

impl From<ProgressEvent> for Event {
    fn from(event: ProgressEvent) -> Self {
        Self::Progress(event)
    }
}

impl From<StateChangeEvent> for Event {
    fn from(event: StateChangeEvent) -> Self {
        Self::StateChange(event)
    }
}

impl From<TransferEvent> for Event {
    fn from(event: TransferEvent) -> Self {
        Self::Transfer(event)
    }
}
