//! Aggregate result of a pipeline run.

use serde::{Deserialize, Serialize};

use crate::domain::Stage;

/// How a run ended, from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every job succeeded.
    Success,
    /// Some jobs failed, at least one succeeded.
    PartialFailure,
    /// Jobs were given but none succeeded.
    NoProgress,
    /// The run was stopped before every job finished.
    Stopped,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialFailure => "partial_failure",
            Self::NoProgress => "no_progress",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A job that ended in a failed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub job_name: String,
    pub stage: Stage,
    pub message: String,
}

/// Counts reported when a run ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub total_jobs: usize,
    pub success_count: usize,
    pub failed_count: usize,
    /// The cancellation signal was observed before every job finished.
    pub stopped: bool,
    pub failures: Vec<JobFailure>,
}

impl RunReport {
    pub fn new(total_jobs: usize) -> Self {
        Self {
            total_jobs,
            ..Default::default()
        }
    }

    /// Jobs that reached neither success nor failure.
    pub fn unfinished_count(&self) -> usize {
        self.total_jobs
            .saturating_sub(self.success_count + self.failed_count)
    }

    pub fn is_partial_failure(&self) -> bool {
        self.failed_count > 0
    }

    pub fn is_no_progress(&self) -> bool {
        self.total_jobs > 0 && self.success_count == 0
    }

    pub fn outcome(&self) -> RunOutcome {
        if self.stopped {
            RunOutcome::Stopped
        } else if self.is_no_progress() {
            RunOutcome::NoProgress
        } else if self.is_partial_failure() {
            RunOutcome::PartialFailure
        } else {
            RunOutcome::Success
        }
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        let counts = format!(
            "{} jobs: {} succeeded, {} failed",
            self.total_jobs, self.success_count, self.failed_count
        );
        match self.outcome() {
            RunOutcome::Success => counts,
            RunOutcome::PartialFailure => format!("{counts} (partial failure)"),
            RunOutcome::NoProgress => format!("{counts} (no job made it through the pipeline)"),
            RunOutcome::Stopped => format!(
                "{counts}, {} unfinished (stopped, resumable)",
                self.unfinished_count()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(total: usize, success: usize, failed: usize) -> RunReport {
        RunReport {
            total_jobs: total,
            success_count: success,
            failed_count: failed,
            ..Default::default()
        }
    }

    #[test]
    fn test_outcomes() {
        assert_eq!(report(3, 3, 0).outcome(), RunOutcome::Success);
        assert_eq!(report(3, 1, 2).outcome(), RunOutcome::PartialFailure);
        assert_eq!(report(3, 0, 3).outcome(), RunOutcome::NoProgress);
        assert_eq!(report(3, 0, 0).outcome(), RunOutcome::NoProgress);
        assert_eq!(report(0, 0, 0).outcome(), RunOutcome::Success);

        let mut stopped = report(3, 1, 0);
        stopped.stopped = true;
        assert_eq!(stopped.outcome(), RunOutcome::Stopped);
        assert_eq!(stopped.unfinished_count(), 2);
    }

    #[test]
    fn test_summary() {
        assert_eq!(
            report(3, 1, 2).summary(),
            "3 jobs: 1 succeeded, 2 failed (partial failure)"
        );
        assert!(report(2, 0, 2).summary().contains("no job made it"));
    }
}
