//! Session workflow controller.
//!
//! Gates which batch operations a caller may run next. It holds no locks and
//! runs no work of its own; a session owns one controller and drives it from a
//! single task.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::state::{WorkflowPath, WorkflowState, is_legal_transition};
use crate::domain::{JobSpec, SubmitMode};
use crate::{Error, Result};

/// Job fields shared by every job created from a directory scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTemplate {
    pub analysis_code: String,
    #[serde(default)]
    pub analysis_version: String,
    pub command: String,
    pub core_type: String,
    pub cores_per_slot: u32,
    pub slots: u32,
    pub walltime_hours: f64,
    #[serde(default)]
    pub license_settings: String,
    #[serde(default)]
    pub submit_mode: SubmitMode,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl JobTemplate {
    /// Job spec for one scanned directory.
    pub fn instantiate(
        &self,
        directory: impl Into<PathBuf>,
        job_name: impl Into<String>,
    ) -> JobSpec {
        let mut spec = JobSpec::new(
            directory,
            job_name,
            self.analysis_code.clone(),
            self.command.clone(),
            self.core_type.clone(),
        )
        .with_analysis_version(self.analysis_version.clone())
        .with_cores(self.cores_per_slot, self.slots)
        .with_walltime_hours(self.walltime_hours)
        .with_license_settings(self.license_settings.clone())
        .with_submit_mode(self.submit_mode)
        .with_tags(self.tags.clone());
        spec.project_id = self.project_id.clone();
        spec
    }
}

/// Inputs remembered across resets for the next session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMemory {
    pub last_scan_dir: Option<PathBuf>,
    pub scan_pattern: Option<String>,
    pub template: Option<JobTemplate>,
}

/// Current step of a session plus the path it follows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowController {
    state: WorkflowState,
    path: WorkflowPath,
    /// State to return to from `Error`.
    previous_state: Option<WorkflowState>,
    last_error: Option<String>,
    memory: WorkflowMemory,
}

impl WorkflowController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session that remembers inputs from an earlier one.
    pub fn with_memory(memory: WorkflowMemory) -> Self {
        Self {
            memory,
            ..Self::default()
        }
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn path(&self) -> WorkflowPath {
        self.path
    }

    pub fn previous_state(&self) -> Option<WorkflowState> {
        self.previous_state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn memory(&self) -> &WorkflowMemory {
        &self.memory
    }

    pub fn can_transition_to(&self, target: WorkflowState) -> bool {
        is_legal_transition(self.state, self.path, target)
    }

    /// Move to `target`. An illegal edge changes nothing and returns
    /// [`Error::InvalidStateTransition`].
    pub fn transition_to(&mut self, target: WorkflowState) -> Result<()> {
        if !self.can_transition_to(target) {
            return Err(Error::invalid_transition(
                self.state.as_str(),
                target.as_str(),
            ));
        }

        match target {
            WorkflowState::Error => {
                if self.state != WorkflowState::Error {
                    self.previous_state = Some(self.state);
                }
            }
            WorkflowState::Initial => {
                self.path = WorkflowPath::Unknown;
                self.previous_state = None;
                self.last_error = None;
            }
            _ => {
                self.previous_state = None;
                self.last_error = None;
            }
        }

        debug!(from = %self.state, to = %target, path = %self.path, "Workflow transition");
        self.state = target;
        Ok(())
    }

    /// Pick how jobs are obtained. Only legal from `Initial`.
    pub fn choose_path(&mut self, path: WorkflowPath) -> Result<()> {
        if self.state != WorkflowState::Initial || path == WorkflowPath::Unknown {
            return Err(Error::invalid_transition(
                self.state.as_str(),
                WorkflowState::PathChosen.as_str(),
            ));
        }
        self.path = path;
        self.transition_to(WorkflowState::PathChosen)
    }

    /// Store the job template and move to `TemplateReady`.
    ///
    /// Fails on the `LoadCsv` path, which has no template step.
    pub fn set_template(&mut self, template: JobTemplate) -> Result<()> {
        if self.path == WorkflowPath::LoadCsv {
            return Err(Error::invalid_transition(
                format!("{} ({})", self.state, self.path),
                WorkflowState::TemplateReady.as_str(),
            ));
        }
        self.transition_to(WorkflowState::TemplateReady)?;
        self.memory.template = Some(template);
        Ok(())
    }

    /// Remember the directory and pattern of the latest scan.
    pub fn record_scan(&mut self, dir: impl AsRef<Path>, pattern: impl Into<String>) {
        self.memory.last_scan_dir = Some(dir.as_ref().to_path_buf());
        self.memory.scan_pattern = Some(pattern.into());
    }

    /// Enter `Error`, remembering where the session was.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(state = %self.state, error = %message, "Workflow entered error state");
        if self.state != WorkflowState::Error {
            self.previous_state = Some(self.state);
        }
        self.state = WorkflowState::Error;
        self.last_error = Some(message);
    }

    /// Leave `Error` for the state it was entered from.
    pub fn go_back(&mut self) -> Result<WorkflowState> {
        let previous = match (self.state, self.previous_state) {
            (WorkflowState::Error, Some(previous)) => previous,
            (state, _) => {
                let target = self.previous_state.unwrap_or(WorkflowState::Initial);
                return Err(Error::invalid_transition(state.as_str(), target.as_str()));
            }
        };
        debug!(to = %previous, "Workflow returning from error");
        self.state = previous;
        self.previous_state = None;
        self.last_error = None;
        Ok(previous)
    }

    /// Back to `Initial` with no path chosen. Memory is kept.
    pub fn reset(&mut self) {
        self.state = WorkflowState::Initial;
        self.path = WorkflowPath::Unknown;
        self.previous_state = None;
        self.last_error = None;
    }
}
