//! Durable per-batch job state store.
//!
//! Each batch has its own SQLite file. Every [`StateStore::save`] is a single
//! upsert statement committed with `synchronous = FULL`, so a job's row is
//! either fully written or not written at all and survives an unclean
//! shutdown. Reads are served from an in-memory map that is updated only after
//! the commit succeeds.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use super::model::{JobStateDbModel, SCHEMA, UPSERT};
use crate::domain::JobState;
use crate::utils::DerivedView;
use crate::utils::fs::{self, with_suffix};
use crate::utils::time::now_ms;
use crate::{Error, Result};

/// Busy timeout for the state file lock.
const BUSY_TIMEOUT_MS: u64 = 30_000;

/// Name of the state file for a batch loaded from `batch_source`.
pub fn state_file_path(batch_source: &Path, suffix: &str) -> PathBuf {
    with_suffix(batch_source, suffix)
}

/// Persisted job states of one batch.
pub struct StateStore {
    path: PathBuf,
    pool: SqlitePool,
    states: RwLock<HashMap<String, JobState>>,
    ordered: DerivedView<Vec<JobState>>,
}

impl StateStore {
    /// Open (or create) the state file at `path`.
    ///
    /// A file that exists but cannot be read as a state file is moved aside
    /// and replaced by an empty one.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::ensure_parent_dir(&path).await?;

        let pool = match Self::connect(&path).await {
            Ok(pool) => pool,
            Err(Error::Database(e)) => {
                if !fs::path_exists(&path).await {
                    return Err(Error::Database(e));
                }
                warn!(path = %path.display(), "State file unreadable, starting fresh: {}", e);
                Self::quarantine(&path).await?;
                Self::connect(&path).await?
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            path,
            pool,
            states: RwLock::new(HashMap::new()),
            ordered: DerivedView::new(),
        })
    }

    async fn connect(path: &Path) -> Result<SqlitePool> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            // FULL: a returned save survives power loss, not only process crashes.
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));

        // A single connection serializes writes to the file.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(60))
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;
        // Touch the table so a corrupt file fails here rather than mid-run.
        sqlx::query("SELECT COUNT(*) FROM job_state")
            .fetch_one(&pool)
            .await?;

        debug!(path = %path.display(), "State file opened");
        Ok(pool)
    }

    /// Move an unreadable state file out of the way.
    async fn quarantine(path: &Path) -> Result<()> {
        let aside = with_suffix(path, &format!(".corrupt-{}", now_ms()));
        tokio::fs::rename(path, &aside)
            .await
            .map_err(|e| fs::io_error("moving aside", path, e))?;
        for sidecar in ["-wal", "-shm"] {
            let _ = tokio::fs::remove_file(with_suffix(path, sidecar)).await;
        }
        warn!(
            path = %path.display(),
            moved_to = %aside.display(),
            "Unreadable state file moved aside"
        );
        Ok(())
    }

    /// Read every persisted job state, replacing the in-memory view.
    pub async fn load(&self) -> Result<()> {
        let rows = sqlx::query_as::<_, JobStateDbModel>("SELECT * FROM job_state ORDER BY idx")
            .fetch_all(&self.pool)
            .await?;

        let loaded: HashMap<String, JobState> = rows
            .into_iter()
            .map(|row| {
                let state = row.into_state();
                (state.job_name.clone(), state)
            })
            .collect();
        let count = loaded.len();

        *self.states.write() = loaded;
        self.ordered.touch();

        info!(path = %self.path.display(), jobs = count, "Loaded job states");
        Ok(())
    }

    /// Insert or replace the state of one job, durably.
    pub async fn save(&self, state: &JobState) -> Result<()> {
        let row = JobStateDbModel::from_state(state)?;
        sqlx::query(UPSERT)
            .bind(&row.job_name)
            .bind(row.idx)
            .bind(&row.directory)
            .bind(&row.tar_path)
            .bind(&row.tar_status)
            .bind(&row.file_id)
            .bind(&row.upload_status)
            .bind(&row.job_id)
            .bind(&row.create_status)
            .bind(&row.submit_status)
            .bind(&row.extra_file_ids)
            .bind(&row.error_message)
            .bind(row.last_updated)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::persistence(format!(
                    "failed to write state of job '{}' to {}: {}",
                    state.job_name,
                    self.path.display(),
                    e
                ))
            })?;

        self.states
            .write()
            .insert(state.job_name.clone(), state.clone());
        // Lock released before touching the view; readers lock view then states.
        self.ordered.touch();
        Ok(())
    }

    /// Snapshot of every known job state keyed by job name.
    pub fn get_all_states(&self) -> HashMap<String, JobState> {
        self.states.read().clone()
    }

    pub fn get_state(&self, job_name: &str) -> Option<JobState> {
        self.states.read().get(job_name).cloned()
    }

    /// Job states ordered by batch index.
    pub fn ordered_states(&self) -> Arc<Vec<JobState>> {
        self.ordered.get_or_compute(|| {
            let mut states: Vec<JobState> = self.states.read().values().cloned().collect();
            states.sort_by(|a, b| {
                a.index
                    .cmp(&b.index)
                    .then_with(|| a.job_name.cmp(&b.job_name))
            });
            states
        })
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the underlying connection, flushing the write-ahead log.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
