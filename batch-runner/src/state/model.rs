//! Row model of the `job_state` table.

use std::path::PathBuf;

use sqlx::FromRow;
use tracing::warn;

use crate::domain::{JobState, StageStatus};
use crate::utils::time::{datetime_to_ms, ms_to_datetime};
use crate::Result;

/// Schema of a state file. One row per job name.
pub(super) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS job_state (
    job_name TEXT PRIMARY KEY NOT NULL,
    idx INTEGER NOT NULL,
    directory TEXT NOT NULL,
    tar_path TEXT,
    tar_status TEXT NOT NULL DEFAULT 'pending',
    file_id TEXT,
    upload_status TEXT NOT NULL DEFAULT 'pending',
    job_id TEXT,
    create_status TEXT NOT NULL DEFAULT 'pending',
    submit_status TEXT NOT NULL DEFAULT 'pending',
    extra_file_ids TEXT NOT NULL DEFAULT '[]',
    error_message TEXT,
    last_updated INTEGER NOT NULL
)
"#;

pub(super) const UPSERT: &str = r#"
INSERT INTO job_state (
    job_name, idx, directory, tar_path, tar_status, file_id, upload_status,
    job_id, create_status, submit_status, extra_file_ids, error_message, last_updated
)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(job_name) DO UPDATE SET
    idx = excluded.idx,
    directory = excluded.directory,
    tar_path = excluded.tar_path,
    tar_status = excluded.tar_status,
    file_id = excluded.file_id,
    upload_status = excluded.upload_status,
    job_id = excluded.job_id,
    create_status = excluded.create_status,
    submit_status = excluded.submit_status,
    extra_file_ids = excluded.extra_file_ids,
    error_message = excluded.error_message,
    last_updated = excluded.last_updated
"#;

/// Job state database model.
#[derive(Debug, Clone, FromRow)]
pub struct JobStateDbModel {
    pub job_name: String,
    pub idx: i64,
    pub directory: String,
    pub tar_path: Option<String>,
    pub tar_status: String,
    pub file_id: Option<String>,
    pub upload_status: String,
    pub job_id: Option<String>,
    pub create_status: String,
    pub submit_status: String,
    pub extra_file_ids: String,
    pub error_message: Option<String>,
    pub last_updated: i64,
}

impl JobStateDbModel {
    pub fn from_state(state: &JobState) -> Result<Self> {
        Ok(Self {
            job_name: state.job_name.clone(),
            idx: state.index,
            directory: state.directory.to_string_lossy().into_owned(),
            tar_path: state
                .tar_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            tar_status: state.tar_status.as_str().to_string(),
            file_id: state.file_id.clone(),
            upload_status: state.upload_status.as_str().to_string(),
            job_id: state.job_id.clone(),
            create_status: state.create_status.as_str().to_string(),
            submit_status: state.submit_status.as_str().to_string(),
            extra_file_ids: serde_json::to_string(&state.extra_file_ids)?,
            error_message: state.error_message.clone(),
            last_updated: datetime_to_ms(state.last_updated),
        })
    }

    pub fn into_state(self) -> JobState {
        let extra_file_ids = serde_json::from_str(&self.extra_file_ids).unwrap_or_else(|e| {
            warn!(job_name = %self.job_name, "Ignoring unreadable extra file ids: {}", e);
            Vec::new()
        });

        JobState {
            index: self.idx,
            tar_status: parse_status(&self.job_name, &self.tar_status),
            upload_status: parse_status(&self.job_name, &self.upload_status),
            create_status: parse_status(&self.job_name, &self.create_status),
            submit_status: parse_status(&self.job_name, &self.submit_status),
            directory: PathBuf::from(self.directory),
            tar_path: self.tar_path.map(PathBuf::from),
            file_id: self.file_id,
            job_id: self.job_id,
            extra_file_ids,
            error_message: self.error_message,
            last_updated: ms_to_datetime(self.last_updated),
            job_name: self.job_name,
        }
    }
}

/// Unknown statuses fall back to pending so the stage is redone rather than skipped.
fn parse_status(job_name: &str, raw: &str) -> StageStatus {
    StageStatus::parse(raw).unwrap_or_else(|| {
        warn!(
            job_name = %job_name,
            status = %raw,
            "Unknown stage status in state file, treating as pending"
        );
        StageStatus::Pending
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Stage;

    #[test]
    fn test_model_conversion_preserves_fields() {
        let mut state = JobState::new(3, "job-3", "/data/job-3");
        state.tar_path = Some(PathBuf::from("/tmp/job-3.tar.gz"));
        state.complete(Stage::Tar);
        state.file_id = Some("file-abc".to_string());
        state.extra_file_ids = vec!["x1".to_string(), "x2".to_string()];
        state.fail(Stage::Upload, "network timeout");

        let model = JobStateDbModel::from_state(&state).unwrap();
        assert_eq!(model.tar_status, "completed");
        assert_eq!(model.upload_status, "failed");
        assert_eq!(model.extra_file_ids, r#"["x1","x2"]"#);

        let restored = model.into_state();
        assert_eq!(restored.job_name, "job-3");
        assert_eq!(restored.index, 3);
        assert_eq!(restored.upload_status, StageStatus::Failed);
        assert_eq!(restored.extra_file_ids, state.extra_file_ids);
        assert_eq!(restored.error_message.as_deref(), Some("network timeout"));
        assert_eq!(
            restored.last_updated.timestamp_millis(),
            state.last_updated.timestamp_millis()
        );
    }

    #[test]
    fn test_unknown_status_is_pending() {
        assert_eq!(parse_status("a", "bogus"), StageStatus::Pending);
    }
}
