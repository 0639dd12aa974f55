//! Pipeline Engine implementation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::report::{JobFailure, RunReport};
use super::stages::{JobItem, StageExecutor, StageOutcome, resume_stage};
use super::worker_pool::{StagePool, stage_queue};
use crate::cache::MetadataCache;
use crate::clients::{Archiver, PlatformClient, StorageClient};
use crate::config::PipelineConfig;
use crate::domain::{JobSpec, JobState, PlatformCatalog, Stage, validate_batch};
use crate::events::{EventBus, LogLevel, ProgressEvent};
use crate::state::{StateStore, state_file_path};
use crate::{Error, Result};

/// Cache key of the platform catalog.
pub const CATALOG_CACHE_KEY: &str = "catalog";

/// The run currently owned by an engine.
struct ActiveRun {
    run_id: String,
    cancel: CancellationToken,
}

/// Drives batches of jobs through Tar, Upload, Create and Submit.
pub struct PipelineEngine {
    /// Pool sizes and archive patterns.
    config: PipelineConfig,
    /// Builds job archives.
    archiver: Arc<dyn Archiver>,
    /// Uploads archives and extra inputs.
    storage: Arc<dyn StorageClient>,
    /// Creates and submits remote jobs.
    platform: Arc<dyn PlatformClient>,
    /// Event bus shared with observers.
    bus: EventBus,
    /// At most one run at a time.
    active: Arc<Mutex<Option<ActiveRun>>>,
}

impl PipelineEngine {
    pub fn new(
        config: PipelineConfig,
        archiver: Arc<dyn Archiver>,
        storage: Arc<dyn StorageClient>,
        platform: Arc<dyn PlatformClient>,
        bus: EventBus,
    ) -> Self {
        Self {
            config: config.normalized(),
            archiver,
            storage,
            platform,
            bus,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// State file of the batch loaded from `batch_source`, named with the
    /// configured suffix.
    pub fn state_file_for(&self, batch_source: impl AsRef<Path>) -> PathBuf {
        state_file_path(batch_source.as_ref(), &self.config.state_file_suffix)
    }

    /// Whether a run is in progress.
    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Start a run over `jobs`, persisting to the state file at `state_path`.
    ///
    /// The batch is validated before anything runs. Existing rows in the state
    /// file are loaded so finished stages are not repeated. Cancelling
    /// `cancel` (or calling [`PipelineEngine::stop`]) stops the run.
    pub async fn start_pipeline(
        &self,
        jobs: Vec<JobSpec>,
        state_path: impl AsRef<Path>,
        cancel: CancellationToken,
    ) -> Result<PipelineHandle> {
        validate_batch(&jobs)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let run_cancel = cancel.child_token();
        {
            let mut active = self.active.lock();
            if active.is_some() {
                return Err(Error::validation("a pipeline run is already active"));
            }
            *active = Some(ActiveRun {
                run_id: run_id.clone(),
                cancel: run_cancel.clone(),
            });
        }

        let store = match Self::open_store(state_path.as_ref()).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                self.release(&run_id);
                return Err(e);
            }
        };

        info!(
            run_id = %run_id,
            jobs = jobs.len(),
            state_file = %store.path().display(),
            "Starting pipeline run"
        );
        let message = format!("Starting pipeline with {} jobs", jobs.len());
        self.bus.log(LogLevel::Info, message);

        let executor = Arc::new(StageExecutor {
            archiver: self.archiver.clone(),
            storage: self.storage.clone(),
            platform: self.platform.clone(),
            store: store.clone(),
            bus: self.bus.clone(),
            config: self.config.clone(),
        });
        let coordinator = Coordinator {
            config: self.config.clone(),
            executor,
            store: store.clone(),
            bus: self.bus.clone(),
            cancel: run_cancel.clone(),
        };

        let active = self.active.clone();
        let task_run_id = run_id.clone();
        let task = tokio::spawn(async move {
            let result = coordinator.run(jobs).await;
            let mut slot = active.lock();
            if slot.as_ref().is_some_and(|run| run.run_id == task_run_id) {
                *slot = None;
            }
            result
        });

        Ok(PipelineHandle {
            run_id,
            cancel: run_cancel,
            store,
            task,
        })
    }

    /// Start a run and wait for its report.
    pub async fn run(
        &self,
        jobs: Vec<JobSpec>,
        state_path: impl AsRef<Path>,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        self.start_pipeline(jobs, state_path, cancel).await?.wait().await
    }

    /// Raise the cancellation signal of the active run.
    ///
    /// Returns `false` when no run is active.
    pub fn stop(&self) -> bool {
        match self.active.lock().as_ref() {
            Some(run) => {
                info!(run_id = %run.run_id, "Stopping pipeline run");
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Remote status of every job in `store` that has a platform job ID,
    /// keyed by job name.
    pub async fn refresh_remote_statuses(
        &self,
        store: &StateStore,
    ) -> Result<HashMap<String, String>> {
        let states = store.ordered_states();
        let by_job_id: HashMap<&str, &str> = states
            .iter()
            .filter_map(|s| s.job_id.as_deref().map(|id| (id, s.job_name.as_str())))
            .collect();
        if by_job_id.is_empty() {
            return Ok(HashMap::new());
        }

        let ids: Vec<String> = by_job_id.keys().map(|id| id.to_string()).collect();
        let statuses = self.platform.get_job_statuses(&ids).await?;
        debug!(requested = ids.len(), received = statuses.len(), "Refreshed remote job statuses");

        Ok(statuses
            .into_iter()
            .filter_map(|(job_id, status)| {
                by_job_id
                    .get(job_id.as_str())
                    .map(|name| (name.to_string(), status))
            })
            .collect())
    }

    /// A catalog cache backed by this engine's platform client.
    pub fn catalog_cache(&self, ttl: Duration) -> MetadataCache<PlatformCatalog> {
        let platform = self.platform.clone();
        MetadataCache::new(ttl, move |_key: String| {
            let platform = platform.clone();
            async move { platform.fetch_catalog().await }.boxed()
        })
    }

    /// Validate a batch, and against the platform catalog when one is given.
    pub async fn validate_jobs(
        jobs: &[JobSpec],
        catalog: Option<&MetadataCache<PlatformCatalog>>,
    ) -> Result<()> {
        validate_batch(jobs)?;
        if let Some(cache) = catalog {
            let catalog = cache.get(CATALOG_CACHE_KEY).await?;
            for job in jobs {
                job.validate_against_catalog(&catalog)?;
            }
        }
        Ok(())
    }

    async fn open_store(path: &Path) -> Result<StateStore> {
        let store = StateStore::open(path).await?;
        store.load().await?;
        Ok(store)
    }

    fn release(&self, run_id: &str) {
        let mut slot = self.active.lock();
        if slot.as_ref().is_some_and(|run| run.run_id == run_id) {
            *slot = None;
        }
    }
}

/// Handle to a running pipeline.
pub struct PipelineHandle {
    run_id: String,
    cancel: CancellationToken,
    store: Arc<StateStore>,
    task: JoinHandle<Result<RunReport>>,
}

impl PipelineHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Raise the run's cancellation signal.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// State store of the run, readable while the run progresses.
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Wait for the run to end.
    ///
    /// A stopped run is reported through [`RunReport::stopped`], not as an
    /// error. An error means the state file could not be written.
    pub async fn wait(self) -> Result<RunReport> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Other(format!("pipeline task failed: {e}"))),
        }
    }
}

/// Owns one run: dispatches jobs between the stage pools and tallies outcomes.
struct Coordinator {
    config: PipelineConfig,
    executor: Arc<StageExecutor>,
    store: Arc<StateStore>,
    bus: EventBus,
    cancel: CancellationToken,
}

impl Coordinator {
    fn workers_for(&self, stage: Stage) -> usize {
        match stage {
            Stage::Tar => self.config.tar_workers,
            Stage::Upload => self.config.upload_workers,
            Stage::Create => self.config.create_workers,
            Stage::Submit => self.config.submit_workers,
        }
    }

    async fn run(self, jobs: Vec<JobSpec>) -> Result<RunReport> {
        let total = jobs.len();
        let mut report = RunReport::new(total);

        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let mut senders = Vec::with_capacity(Stage::ALL.len());
        let mut pools = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            let (tx, queue) = stage_queue();
            let mut pool = StagePool::new(stage, self.workers_for(stage));
            pool.start(
                queue,
                self.executor.clone(),
                outcome_tx.clone(),
                self.cancel.clone(),
            );
            senders.push(tx);
            pools.push(pool);
        }
        drop(outcome_tx);

        let mut in_flight = 0usize;
        let mut fatal = None;

        for (index, spec) in jobs.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }

            let mut state = self
                .store
                .get_state(&spec.job_name)
                .unwrap_or_else(|| JobState::new(index as i64, &spec.job_name, &spec.directory));
            state.index = index as i64;
            state.directory = spec.directory.clone();
            if let Err(e) = self.store.save(&state).await {
                fatal = Some(e);
                break;
            }

            match resume_stage(&state) {
                Some(stage) => {
                    debug!(job_name = %spec.job_name, stage = %stage, "Dispatching job");
                    let item = JobItem {
                        spec: Arc::new(spec),
                        state,
                    };
                    if senders[stage.index()].send(item).is_ok() {
                        in_flight += 1;
                    }
                }
                None => {
                    debug!(job_name = %spec.job_name, "Job already finished in a previous run");
                    report.success_count += 1;
                    self.publish_overall(&report);
                }
            }
        }

        while fatal.is_none() && in_flight > 0 {
            let outcome = tokio::select! {
                biased;
                outcome = outcome_rx.recv() => outcome,
                _ = self.cancel.cancelled() => break,
            };
            let Some(outcome) = outcome else {
                break;
            };

            match outcome {
                StageOutcome::Advance { item, next } => {
                    if senders[next.index()].send(item).is_err() {
                        in_flight -= 1;
                    }
                }
                StageOutcome::Finished { item, succeeded } => {
                    in_flight -= 1;
                    self.tally(&mut report, &item, succeeded);
                }
                StageOutcome::Interrupted(_) => {
                    in_flight -= 1;
                }
                StageOutcome::Fatal(e) => {
                    fatal = Some(e);
                }
            }
        }

        if fatal.is_some() {
            self.cancel.cancel();
        }

        // Closing the queues lets idle workers exit; busy ones finish or abandon
        // their item once cancelled.
        drop(senders);
        for pool in pools {
            pool.join().await;
        }
        while let Some(outcome) = outcome_rx.recv().await {
            match outcome {
                StageOutcome::Finished { item, succeeded } => {
                    self.tally(&mut report, &item, succeeded);
                }
                StageOutcome::Fatal(e) => {
                    fatal.get_or_insert(e);
                }
                StageOutcome::Advance { .. } | StageOutcome::Interrupted(_) => {}
            }
        }

        if let Some(e) = fatal {
            error!(error = %e, "Pipeline run aborted: state file could not be written");
            self.bus.log(LogLevel::Error, format!("Pipeline aborted: {e}"));
            return Err(e);
        }

        report.stopped = self.cancel.is_cancelled() && report.unfinished_count() > 0;

        let summary = report.summary();
        if report.stopped {
            warn!("Pipeline run stopped: {}", summary);
        } else {
            info!("Pipeline run finished: {}", summary);
        }
        let level = if report.failed_count > 0 || report.stopped {
            LogLevel::Warn
        } else {
            LogLevel::Info
        };
        self.bus.log(level, summary);

        Ok(report)
    }

    fn tally(&self, report: &mut RunReport, item: &JobItem, succeeded: bool) {
        if succeeded {
            report.success_count += 1;
        } else {
            report.failed_count += 1;
            if let Some(stage) = item.state.failed_stage() {
                report.failures.push(JobFailure {
                    job_name: item.state.job_name.clone(),
                    stage,
                    message: item.state.error_message.clone().unwrap_or_default(),
                });
            }
        }
        self.publish_overall(report);
    }

    fn publish_overall(&self, report: &RunReport) {
        self.bus.publish(ProgressEvent::overall(
            report.success_count + report.failed_count,
            report.total_jobs,
        ));
    }
}
