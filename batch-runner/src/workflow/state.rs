//! Session workflow states and the legal transition table.

use serde::{Deserialize, Serialize};

/// Step of a batch-preparation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    #[default]
    Initial,
    PathChosen,
    TemplateReady,
    DirectoriesScanned,
    JobsValidated,
    Executing,
    Completed,
    Error,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 8] = [
        WorkflowState::Initial,
        WorkflowState::PathChosen,
        WorkflowState::TemplateReady,
        WorkflowState::DirectoriesScanned,
        WorkflowState::JobsValidated,
        WorkflowState::Executing,
        WorkflowState::Completed,
        WorkflowState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::PathChosen => "path_chosen",
            Self::TemplateReady => "template_ready",
            Self::DirectoriesScanned => "directories_scanned",
            Self::JobsValidated => "jobs_validated",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the session obtains its jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPath {
    #[default]
    Unknown,
    /// Build jobs from a template and a directory scan.
    CreateNew,
    /// Load a prepared batch file.
    #[serde(rename = "load_csv")]
    LoadCsv,
}

impl WorkflowPath {
    pub const ALL: [WorkflowPath; 3] = [
        WorkflowPath::Unknown,
        WorkflowPath::CreateNew,
        WorkflowPath::LoadCsv,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::CreateNew => "create_new",
            Self::LoadCsv => "load_csv",
        }
    }
}

impl std::fmt::Display for WorkflowPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether `from -> to` is a legal edge while on `path`.
pub fn is_legal_transition(from: WorkflowState, path: WorkflowPath, to: WorkflowState) -> bool {
    use WorkflowPath::*;
    use WorkflowState::*;

    match (from, path, to) {
        // Failure and reset are reachable from anywhere
        (_, _, Error) | (_, _, Initial) => true,

        (Initial, _, PathChosen) => true,

        // Template flow
        (PathChosen, CreateNew, TemplateReady) => true,
        (TemplateReady, CreateNew, DirectoriesScanned) => true,
        (DirectoriesScanned, CreateNew, JobsValidated) => true,

        // A loaded batch skips template and scan
        (PathChosen, LoadCsv, JobsValidated) => true,

        (JobsValidated, _, Executing) => true,
        (Executing, _, Completed) => true,

        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_new_happy_path() {
        let path = WorkflowPath::CreateNew;
        let steps = [
            WorkflowState::Initial,
            WorkflowState::PathChosen,
            WorkflowState::TemplateReady,
            WorkflowState::DirectoriesScanned,
            WorkflowState::JobsValidated,
            WorkflowState::Executing,
            WorkflowState::Completed,
        ];
        for pair in steps.windows(2) {
            assert!(is_legal_transition(pair[0], path, pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn test_load_csv_skips_template() {
        let path = WorkflowPath::LoadCsv;
        assert!(is_legal_transition(
            WorkflowState::PathChosen,
            path,
            WorkflowState::JobsValidated
        ));
        assert!(!is_legal_transition(
            WorkflowState::PathChosen,
            path,
            WorkflowState::TemplateReady
        ));
        assert!(!is_legal_transition(
            WorkflowState::PathChosen,
            WorkflowPath::CreateNew,
            WorkflowState::JobsValidated
        ));
    }

    #[test]
    fn test_no_skipping_ahead() {
        assert!(!is_legal_transition(
            WorkflowState::Initial,
            WorkflowPath::CreateNew,
            WorkflowState::Executing
        ));
        assert!(!is_legal_transition(
            WorkflowState::Completed,
            WorkflowPath::CreateNew,
            WorkflowState::Executing
        ));
    }
}
