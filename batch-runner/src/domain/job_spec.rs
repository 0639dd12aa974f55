//! Job specification.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::PlatformCatalog;
use crate::{Error, Result};

/// Seconds per hour, used by the walltime conversions.
const SECONDS_PER_HOUR: f64 = 3600.0;

/// Whether a created job is also submitted for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    /// Create the job record, then submit it.
    #[default]
    CreateAndSubmit,
    /// Only create the job record; the submit stage is skipped.
    CreateOnly,
}

impl SubmitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateAndSubmit => "create_and_submit",
            Self::CreateOnly => "create_only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create_and_submit" | "submit" => Some(Self::CreateAndSubmit),
            "create_only" | "create" => Some(Self::CreateOnly),
            _ => None,
        }
    }

    pub fn submits(&self) -> bool {
        matches!(self, Self::CreateAndSubmit)
    }
}

/// Immutable description of one job in a batch.
///
/// Produced by directory scanning, template authoring or batch files. The
/// pipeline engine never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Directory whose contents are archived and uploaded.
    pub directory: PathBuf,
    /// Unique key of the job within a run.
    pub job_name: String,
    pub analysis_code: String,
    pub analysis_version: String,
    pub command: String,
    pub core_type: String,
    pub cores_per_slot: u32,
    pub slots: u32,
    /// Requested walltime in hours.
    pub walltime_hours: f64,
    /// Opaque structured license settings passed through to the platform.
    #[serde(default)]
    pub license_settings: String,
    #[serde(default)]
    pub submit_mode: SubmitMode,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    /// Additional files uploaded next to the archive and attached to the job.
    #[serde(default)]
    pub extra_input_files: Vec<PathBuf>,
}

impl JobSpec {
    /// Create a spec with the required fields and defaults for the rest.
    pub fn new(
        directory: impl Into<PathBuf>,
        job_name: impl Into<String>,
        analysis_code: impl Into<String>,
        command: impl Into<String>,
        core_type: impl Into<String>,
    ) -> Self {
        Self {
            directory: directory.into(),
            job_name: job_name.into(),
            analysis_code: analysis_code.into(),
            analysis_version: String::new(),
            command: command.into(),
            core_type: core_type.into(),
            cores_per_slot: 1,
            slots: 1,
            walltime_hours: 1.0,
            license_settings: String::new(),
            submit_mode: SubmitMode::default(),
            tags: Vec::new(),
            project_id: None,
            extra_input_files: Vec::new(),
        }
    }

    pub fn with_analysis_version(mut self, version: impl Into<String>) -> Self {
        self.analysis_version = version.into();
        self
    }

    pub fn with_cores(mut self, cores_per_slot: u32, slots: u32) -> Self {
        self.cores_per_slot = cores_per_slot;
        self.slots = slots;
        self
    }

    pub fn with_walltime_hours(mut self, hours: f64) -> Self {
        self.walltime_hours = hours;
        self
    }

    pub fn with_submit_mode(mut self, mode: SubmitMode) -> Self {
        self.submit_mode = mode;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_license_settings(mut self, settings: impl Into<String>) -> Self {
        self.license_settings = settings.into();
        self
    }

    pub fn with_extra_input_files(mut self, files: Vec<PathBuf>) -> Self {
        self.extra_input_files = files;
        self
    }

    /// Total cores requested by the job.
    pub fn total_cores(&self) -> u64 {
        u64::from(self.cores_per_slot) * u64::from(self.slots)
    }

    /// Requested walltime in whole seconds.
    pub fn walltime_seconds(&self) -> u64 {
        walltime_seconds(self.walltime_hours)
    }

    /// Check required fields and numeric ranges.
    pub fn validate(&self) -> Result<()> {
        let name = if self.job_name.trim().is_empty() {
            return Err(Error::validation("job name is required"));
        } else {
            self.job_name.as_str()
        };

        if self.directory.as_os_str().is_empty() {
            return Err(Error::validation(format!("{name}: directory is required")));
        }
        if self.analysis_code.trim().is_empty() {
            return Err(Error::validation(format!(
                "{name}: analysis code is required"
            )));
        }
        if self.command.trim().is_empty() {
            return Err(Error::validation(format!("{name}: command is required")));
        }
        if self.core_type.trim().is_empty() {
            return Err(Error::validation(format!("{name}: core type is required")));
        }
        if self.cores_per_slot == 0 {
            return Err(Error::validation(format!(
                "{name}: cores per slot must be at least 1"
            )));
        }
        if self.slots == 0 {
            return Err(Error::validation(format!("{name}: slots must be at least 1")));
        }
        if !self.walltime_hours.is_finite() || self.walltime_hours <= 0.0 {
            return Err(Error::validation(format!(
                "{name}: walltime must be a positive number of hours, got {}",
                self.walltime_hours
            )));
        }
        if self.walltime_seconds() == 0 {
            return Err(Error::validation(format!(
                "{name}: walltime must be at least one second"
            )));
        }
        Ok(())
    }

    /// Check the core type and analysis code against platform metadata.
    pub fn validate_against_catalog(&self, catalog: &PlatformCatalog) -> Result<()> {
        if !catalog.has_core_type(&self.core_type) {
            return Err(Error::validation(format!(
                "{}: unknown core type '{}'",
                self.job_name, self.core_type
            )));
        }
        if !catalog.has_analysis_code(&self.analysis_code) {
            return Err(Error::validation(format!(
                "{}: unknown analysis code '{}'",
                self.job_name, self.analysis_code
            )));
        }
        Ok(())
    }
}

/// Validate every spec of a batch and reject duplicate job names.
pub fn validate_batch(jobs: &[JobSpec]) -> Result<()> {
    let mut seen = HashSet::with_capacity(jobs.len());
    for job in jobs {
        job.validate()?;
        if !seen.insert(job.job_name.as_str()) {
            return Err(Error::validation(format!(
                "duplicate job name '{}'",
                job.job_name
            )));
        }
    }
    Ok(())
}

/// Convert hours to whole seconds, truncating any fractional second.
pub fn walltime_seconds(hours: f64) -> u64 {
    let seconds = hours * SECONDS_PER_HOUR;
    let nearest = seconds.round();
    // `hours` is exactly k/3600 when k / 3600.0 gives it back; the product
    // may still land one ulp below k, which floor would turn into k - 1.
    if nearest / SECONDS_PER_HOUR == hours {
        nearest.max(0.0) as u64
    } else {
        seconds.floor().max(0.0) as u64
    }
}

/// Convert seconds back to hours.
pub fn walltime_hours(seconds: u64) -> f64 {
    seconds as f64 / SECONDS_PER_HOUR
}
