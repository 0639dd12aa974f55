//! Execution of a single stage for a single job.
//!
//! Every stage follows the same shape: mark the stage in progress and persist,
//! run the collaborator call, then persist the result. The job's state is
//! owned by whichever stage currently holds the job, so no lock is needed
//! around it.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clients::{Archiver, JobRequest, PlatformClient, StorageClient, TransferControl};
use crate::config::PipelineConfig;
use crate::domain::{JobSpec, JobState, Stage, StageStatus};
use crate::events::{EventBus, LogLevel, ProgressEvent, StateChangeEvent};
use crate::state::StateStore;
use crate::utils::throttle::{ProgressThrottle, fraction};
use crate::{Error, Result};

/// Minimum interval between upload progress events of one job.
const UPLOAD_PROGRESS_INTERVAL_MS: u64 = 250;

/// A job travelling between stage queues.
#[derive(Debug, Clone)]
pub(super) struct JobItem {
    pub spec: Arc<JobSpec>,
    pub state: JobState,
}

/// Result of handing a job to a stage worker.
#[derive(Debug)]
pub(super) enum StageOutcome {
    /// The stage succeeded and the job continues at `next`.
    Advance { item: JobItem, next: Stage },
    /// The job reached a terminal state.
    Finished { item: JobItem, succeeded: bool },
    /// The run was cancelled while the job was in this stage.
    Interrupted(JobItem),
    /// The state file could not be written; the run cannot continue safely.
    Fatal(Error),
}

/// Runs stages against the collaborators, persisting and publishing every transition.
pub(super) struct StageExecutor {
    pub archiver: Arc<dyn Archiver>,
    pub storage: Arc<dyn StorageClient>,
    pub platform: Arc<dyn PlatformClient>,
    pub store: Arc<StateStore>,
    pub bus: EventBus,
    pub config: PipelineConfig,
}

impl StageExecutor {
    pub(super) async fn run(
        &self,
        stage: Stage,
        mut item: JobItem,
        cancel: &CancellationToken,
    ) -> StageOutcome {
        if stage == Stage::Submit && !item.spec.submit_mode.submits() {
            return self.skip_submit(item).await;
        }

        item.state.begin(stage);
        if let Err(e) = self.store.save(&item.state).await {
            return StageOutcome::Fatal(e);
        }
        self.publish_transition(&item.state, stage);
        self.bus
            .publish(ProgressEvent::stage(stage, &item.spec.job_name, 0.0));

        let result = match stage {
            Stage::Tar => self.tar(&mut item, cancel).await,
            Stage::Upload => self.upload(&mut item, cancel).await,
            Stage::Create => self.create(&mut item).await,
            Stage::Submit => self.submit(&item).await,
        };

        let job_name = item.spec.job_name.clone();
        match result {
            Ok(()) => {
                item.state.complete(stage);
                if let Err(e) = self.store.save(&item.state).await {
                    return StageOutcome::Fatal(e);
                }
                self.publish_transition(&item.state, stage);
                self.bus.publish(ProgressEvent::stage(stage, &job_name, 1.0));
                debug!(job_name = %job_name, stage = %stage, "Stage completed");

                match stage.next() {
                    Some(next) => StageOutcome::Advance { item, next },
                    None => {
                        self.bus
                            .job_log(LogLevel::Info, stage, &job_name, "job submitted");
                        StageOutcome::Finished {
                            item,
                            succeeded: true,
                        }
                    }
                }
            }
            Err(e) if e.is_cancelled() => {
                // Left in progress on disk; the next run redoes this stage.
                info!(job_name = %job_name, stage = %stage, "Stage interrupted by stop request");
                StageOutcome::Interrupted(item)
            }
            Err(e) => {
                let message = e.to_string();
                warn!(job_name = %job_name, stage = %stage, error = %message, "Stage failed");
                item.state.fail(stage, &message);
                if let Err(e) = self.store.save(&item.state).await {
                    return StageOutcome::Fatal(e);
                }
                self.publish_transition(&item.state, stage);
                self.bus.job_log(
                    LogLevel::Error,
                    stage,
                    &job_name,
                    format!("{stage} failed: {message}"),
                );
                StageOutcome::Finished {
                    item,
                    succeeded: false,
                }
            }
        }
    }

    async fn tar(&self, item: &mut JobItem, cancel: &CancellationToken) -> Result<()> {
        let archive = tokio::select! {
            result = self.archiver.create_archive(
                &item.spec.directory,
                &self.config.include_patterns,
                &self.config.exclude_patterns,
            ) => result?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        debug!(job_name = %item.spec.job_name, archive = %archive.display(), "Archive created");
        item.state.tar_path = Some(archive);
        Ok(())
    }

    async fn upload(&self, item: &mut JobItem, cancel: &CancellationToken) -> Result<()> {
        let archive = item
            .state
            .tar_path
            .clone()
            .ok_or_else(|| Error::stage(Stage::Upload.as_str(), "no archive recorded for job"))?;

        let control = self.upload_control(&item.spec.job_name, cancel);
        let file_id = tokio::select! {
            result = self.storage.upload(&archive, &control) => result?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        item.state.file_id = Some(file_id);

        let mut extra_ids = Vec::with_capacity(item.spec.extra_input_files.len());
        for extra in &item.spec.extra_input_files {
            let control = TransferControl::new(cancel.child_token());
            let id = tokio::select! {
                result = self.storage.upload(extra, &control) => result?,
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            };
            extra_ids.push(id);
        }
        item.state.extra_file_ids = extra_ids;
        Ok(())
    }

    /// Control for an archive upload that publishes throttled progress.
    fn upload_control(&self, job_name: &str, cancel: &CancellationToken) -> TransferControl {
        let bus = self.bus.clone();
        let job_name = job_name.to_string();
        let throttle = ProgressThrottle::from_millis(UPLOAD_PROGRESS_INTERVAL_MS);
        TransferControl::new(cancel.child_token()).with_progress(move |done, total| {
            if throttle.should_emit(done, total) {
                bus.publish(ProgressEvent::stage(
                    Stage::Upload,
                    &job_name,
                    fraction(done, total),
                ));
            }
        })
    }

    /// Create the remote job. API calls are not abandoned mid-flight so a
    /// created job is never left unrecorded.
    async fn create(&self, item: &mut JobItem) -> Result<()> {
        let file_id = item.state.file_id.clone().ok_or_else(|| {
            Error::stage(Stage::Create.as_str(), "no uploaded file recorded for job")
        })?;

        let mut input_ids = Vec::with_capacity(1 + item.state.extra_file_ids.len());
        input_ids.push(file_id);
        input_ids.extend(item.state.extra_file_ids.iter().cloned());

        let request = JobRequest::from_spec(&item.spec, input_ids);
        let job_id = self.platform.create_job(&request).await?;
        info!(job_name = %item.spec.job_name, job_id = %job_id, "Remote job created");
        item.state.job_id = Some(job_id);
        Ok(())
    }

    async fn submit(&self, item: &JobItem) -> Result<()> {
        let job_id = item
            .state
            .job_id
            .as_deref()
            .ok_or_else(|| Error::stage(Stage::Submit.as_str(), "no remote job recorded for job"))?;
        self.platform.submit_job(job_id).await?;
        info!(job_name = %item.spec.job_name, job_id = %job_id, "Remote job submitted");
        Ok(())
    }

    async fn skip_submit(&self, mut item: JobItem) -> StageOutcome {
        item.state.skip(Stage::Submit);
        if let Err(e) = self.store.save(&item.state).await {
            return StageOutcome::Fatal(e);
        }
        self.publish_transition(&item.state, Stage::Submit);
        self.bus.publish(
            ProgressEvent::stage(Stage::Submit, &item.spec.job_name, 1.0)
                .with_message("create only, not submitted"),
        );
        StageOutcome::Finished {
            item,
            succeeded: true,
        }
    }

    fn publish_transition(&self, state: &JobState, stage: Stage) {
        let status = state.status(stage);
        let upload_progress = (stage == Stage::Upload).then(|| match status {
            StageStatus::Completed => 1.0,
            _ => 0.0,
        });
        self.bus.publish(StateChangeEvent {
            job_name: state.job_name.clone(),
            stage,
            new_status: status,
            job_id: state.job_id.clone(),
            error_message: state.error_message.clone(),
            upload_progress,
        });
    }
}

/// First stage a job must run given its persisted state, or `None` when done.
///
/// Completed stages are never redone. A stage whose input was not recorded
/// fails when it runs instead of sending the job back to an earlier stage.
pub(super) fn resume_stage(state: &JobState) -> Option<Stage> {
    state.next_stage()
}
