//! In-memory collaborators that record every call.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use batch_runner::clients::{Archiver, JobRequest, PlatformClient, StorageClient, TransferControl};
use batch_runner::config::PipelineConfig;
use batch_runner::domain::{JobSpec, PlatformCatalog};
use batch_runner::events::EventBus;
use batch_runner::pipeline::PipelineEngine;
use batch_runner::utils::fs::display_name;
use batch_runner::{Error, Result};

/// Writes a small archive per job directory into `out_dir`.
pub struct FakeArchiver {
    out_dir: PathBuf,
    failures: HashMap<String, String>,
    delay: Duration,
    calls: Mutex<Vec<String>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl FakeArchiver {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            failures: HashMap::new(),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    /// Fail archiving of the directory named `job` with `message`.
    pub fn failing(mut self, job: &str, message: &str) -> Self {
        self.failures.insert(job.to_string(), message.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls_for(&self, job: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == job).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Archiver for FakeArchiver {
    async fn create_archive(
        &self,
        dir: &Path,
        _include_patterns: &[String],
        _exclude_patterns: &[String],
    ) -> Result<PathBuf> {
        let job = display_name(dir);
        self.calls.lock().push(job.clone());

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        if let Some(message) = self.failures.get(&job) {
            return Err(Error::Other(message.clone()));
        }
        let archive = self.out_dir.join(format!("{job}.tar.gz"));
        tokio::fs::write(&archive, job.as_bytes()).await?;
        Ok(archive)
    }
}

/// Accepts uploads instantly, returning `file-<file name>` as the ID.
pub struct FakeStorage {
    failures: Mutex<HashMap<String, String>>,
    uploads: Mutex<Vec<PathBuf>>,
    downloads: Mutex<Vec<String>>,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            uploads: Mutex::new(Vec::new()),
            downloads: Mutex::new(Vec::new()),
        }
    }

    /// Fail uploads of the file named `file_name` with `message`.
    pub fn failing(self, file_name: &str, message: &str) -> Self {
        self.failures
            .lock()
            .insert(file_name.to_string(), message.to_string());
        self
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    pub fn uploads_of(&self, file_name: &str) -> usize {
        self.uploads
            .lock()
            .iter()
            .filter(|p| display_name(p) == file_name)
            .count()
    }

    pub fn total_uploads(&self) -> usize {
        self.uploads.lock().len()
    }
}

#[async_trait]
impl StorageClient for FakeStorage {
    async fn upload(&self, path: &Path, control: &TransferControl) -> Result<String> {
        let name = display_name(path);
        self.uploads.lock().push(path.to_path_buf());
        control.checkpoint().await?;

        let failure = self.failures.lock().get(&name).cloned();
        if let Some(message) = failure {
            return Err(Error::Other(message));
        }
        control.report(50, 100);
        control.report(100, 100);
        Ok(format!("file-{name}"))
    }

    async fn download(&self, file_id: &str, dest: &Path, control: &TransferControl) -> Result<()> {
        self.downloads.lock().push(file_id.to_string());
        control.checkpoint().await?;
        tokio::fs::write(dest, file_id.as_bytes()).await?;
        control.report(1, 1);
        Ok(())
    }
}

/// Records created and submitted jobs; job IDs are `job-<name>`.
pub struct FakePlatform {
    created: Mutex<Vec<JobRequest>>,
    submitted: Mutex<Vec<String>>,
    remote_status: String,
    catalog_fetches: AtomicUsize,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            submitted: Mutex::new(Vec::new()),
            remote_status: "Running".to_string(),
            catalog_fetches: AtomicUsize::new(0),
        }
    }

    pub fn created(&self) -> Vec<JobRequest> {
        self.created.lock().clone()
    }

    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().clone()
    }

    pub fn catalog_fetches(&self) -> usize {
        self.catalog_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn create_job(&self, request: &JobRequest) -> Result<String> {
        self.created.lock().push(request.clone());
        Ok(format!("job-{}", request.name))
    }

    async fn submit_job(&self, job_id: &str) -> Result<()> {
        self.submitted.lock().push(job_id.to_string());
        Ok(())
    }

    async fn get_job_statuses(&self, job_ids: &[String]) -> Result<HashMap<String, String>> {
        Ok(job_ids
            .iter()
            .map(|id| (id.clone(), self.remote_status.clone()))
            .collect())
    }

    async fn fetch_catalog(&self) -> Result<PlatformCatalog> {
        self.catalog_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(PlatformCatalog::new(
            vec!["emerald".to_string()],
            vec!["openfoam".to_string()],
        ))
    }
}

/// Collaborators plus a scratch directory for archives and state files.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub archiver: Arc<FakeArchiver>,
    pub storage: Arc<FakeStorage>,
    pub platform: Arc<FakePlatform>,
    pub bus: EventBus,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let archiver = FakeArchiver::new(dir.path());
        Self::with(dir, archiver, FakeStorage::new())
    }

    pub fn with(dir: tempfile::TempDir, archiver: FakeArchiver, storage: FakeStorage) -> Self {
        Self {
            dir,
            archiver: Arc::new(archiver),
            storage: Arc::new(storage),
            platform: Arc::new(FakePlatform::new()),
            bus: EventBus::new(),
        }
    }

    pub fn engine(&self, config: PipelineConfig) -> PipelineEngine {
        PipelineEngine::new(
            config,
            self.archiver.clone(),
            self.storage.clone(),
            self.platform.clone(),
            self.bus.clone(),
        )
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.path().join("jobs.csv.state.db")
    }
}

/// Valid spec for a job in `/data/<name>`.
pub fn job(name: &str) -> JobSpec {
    JobSpec::new(format!("/data/{name}"), name, "openfoam", "./run.sh", "emerald")
        .with_cores(4, 1)
        .with_walltime_hours(2.5)
}
