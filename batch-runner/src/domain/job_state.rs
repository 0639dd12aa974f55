//! Persisted per-job stage progress.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SubmitMode;

/// One of the four ordered stages every job passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Tar,
    Upload,
    Create,
    Submit,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 4] = [Stage::Tar, Stage::Upload, Stage::Create, Stage::Submit];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tar => "tar",
            Self::Upload => "upload",
            Self::Create => "create",
            Self::Submit => "submit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tar" => Some(Self::Tar),
            "upload" => Some(Self::Upload),
            "create" => Some(Self::Create),
            "submit" => Some(Self::Submit),
            _ => None,
        }
    }

    /// The stage that follows this one, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Tar => Some(Self::Upload),
            Self::Upload => Some(Self::Create),
            Self::Create => Some(Self::Submit),
            Self::Submit => None,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::Tar => 0,
            Self::Upload => 1,
            Self::Create => 2,
            Self::Submit => 3,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a single stage of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether the stage needs no further work.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Mutable, persisted progress record of one job, keyed by job name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    /// Position of the job within its batch.
    pub index: i64,
    pub job_name: String,
    pub directory: PathBuf,
    pub tar_path: Option<PathBuf>,
    pub tar_status: StageStatus,
    pub file_id: Option<String>,
    pub upload_status: StageStatus,
    pub job_id: Option<String>,
    pub create_status: StageStatus,
    pub submit_status: StageStatus,
    #[serde(default)]
    pub extra_file_ids: Vec<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl JobState {
    /// Fresh state with every stage pending.
    pub fn new(index: i64, job_name: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            index,
            job_name: job_name.into(),
            directory: directory.into(),
            tar_path: None,
            tar_status: StageStatus::Pending,
            file_id: None,
            upload_status: StageStatus::Pending,
            job_id: None,
            create_status: StageStatus::Pending,
            submit_status: StageStatus::Pending,
            extra_file_ids: Vec::new(),
            error_message: None,
            last_updated: Utc::now(),
        }
    }

    pub fn status(&self, stage: Stage) -> StageStatus {
        match stage {
            Stage::Tar => self.tar_status,
            Stage::Upload => self.upload_status,
            Stage::Create => self.create_status,
            Stage::Submit => self.submit_status,
        }
    }

    pub fn set_status(&mut self, stage: Stage, status: StageStatus) {
        match stage {
            Stage::Tar => self.tar_status = status,
            Stage::Upload => self.upload_status = status,
            Stage::Create => self.create_status = status,
            Stage::Submit => self.submit_status = status,
        }
        self.last_updated = Utc::now();
    }

    /// Mark a stage as started, clearing any error left by an earlier run.
    pub fn begin(&mut self, stage: Stage) {
        self.error_message = None;
        self.set_status(stage, StageStatus::InProgress);
    }

    pub fn complete(&mut self, stage: Stage) {
        self.set_status(stage, StageStatus::Completed);
    }

    pub fn fail(&mut self, stage: Stage, message: impl Into<String>) {
        self.error_message = Some(message.into());
        self.set_status(stage, StageStatus::Failed);
    }

    pub fn skip(&mut self, stage: Stage) {
        self.set_status(stage, StageStatus::Skipped);
    }

    /// First stage that still needs work, or `None` when every stage is done.
    pub fn next_stage(&self) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| !self.status(*s).is_done())
    }

    /// The stage that failed, if any.
    pub fn failed_stage(&self) -> Option<Stage> {
        Stage::ALL
            .into_iter()
            .find(|s| self.status(*s) == StageStatus::Failed)
    }

    /// Whether the job has finished all work required by its submit mode.
    pub fn is_successful(&self, mode: SubmitMode) -> bool {
        let created = self.tar_status.is_done()
            && self.upload_status.is_done()
            && self.create_status == StageStatus::Completed;
        match mode {
            SubmitMode::CreateAndSubmit => {
                created && self.submit_status == StageStatus::Completed
            }
            SubmitMode::CreateOnly => created && self.submit_status.is_done(),
        }
    }

    /// Fraction of stages that are done, in `[0, 1]`.
    pub fn completion_fraction(&self) -> f64 {
        let done = Stage::ALL
            .iter()
            .filter(|s| self.status(**s).is_done())
            .count();
        done as f64 / Stage::ALL.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            StageStatus::Pending,
            StageStatus::InProgress,
            StageStatus::Completed,
            StageStatus::Failed,
            StageStatus::Skipped,
        ] {
            assert_eq!(StageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(StageStatus::parse("done"), None);
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::Tar.next(), Some(Stage::Upload));
        assert_eq!(Stage::Create.next(), Some(Stage::Submit));
        assert_eq!(Stage::Submit.next(), None);
        assert!(Stage::Tar < Stage::Submit);
    }

    #[test]
    fn test_next_stage_skips_completed() {
        let mut state = JobState::new(0, "a", "/data/a");
        assert_eq!(state.next_stage(), Some(Stage::Tar));

        state.complete(Stage::Tar);
        state.complete(Stage::Upload);
        assert_eq!(state.next_stage(), Some(Stage::Create));

        state.complete(Stage::Create);
        state.skip(Stage::Submit);
        assert_eq!(state.next_stage(), None);
        assert!(state.is_successful(SubmitMode::CreateOnly));
        assert!(!state.is_successful(SubmitMode::CreateAndSubmit));
    }

    #[test]
    fn test_fail_records_error_and_begin_clears_it() {
        let mut state = JobState::new(0, "a", "/data/a");
        state.begin(Stage::Tar);
        state.fail(Stage::Tar, "disk full");
        assert_eq!(state.tar_status, StageStatus::Failed);
        assert_eq!(state.error_message.as_deref(), Some("disk full"));
        assert_eq!(state.failed_stage(), Some(Stage::Tar));

        state.begin(Stage::Tar);
        assert_eq!(state.tar_status, StageStatus::InProgress);
        assert!(state.error_message.is_none());
    }

    #[test]
    fn test_completion_fraction() {
        let mut state = JobState::new(0, "a", "/data/a");
        assert_eq!(state.completion_fraction(), 0.0);
        state.complete(Stage::Tar);
        state.complete(Stage::Upload);
        assert_eq!(state.completion_fraction(), 0.5);
    }
}
