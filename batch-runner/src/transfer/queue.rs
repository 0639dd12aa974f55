//! Transfer queue implementation.
//!
//! Tasks live in an ordered table guarded by a read-write lock. Every state
//! change is applied under the write lock, and the matching event is published
//! after the lock is released.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::task::{TransferRequest, TransferState, TransferStats, TransferTask};
use crate::clients::{StorageClient, TransferControl};
use crate::config::TransferQueueConfig;
use crate::events::{EventBus, LogLevel, TransferEvent};
use crate::utils::DerivedView;
use crate::utils::fs::file_size;
use crate::utils::throttle::{ProgressThrottle, fraction};
use crate::{Error, Result};

/// Cancel and pause handles of one task.
struct TaskControl {
    cancel: CancellationToken,
    pause: watch::Sender<bool>,
}

impl TaskControl {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            pause: watch::channel(false).0,
        }
    }
}

struct TaskEntry {
    task: TransferTask,
    control: TaskControl,
}

#[derive(Default)]
struct TaskTable {
    /// Every visible task in enqueue order.
    entries: Vec<TaskEntry>,
    /// IDs waiting for a worker, oldest first.
    pending: VecDeque<String>,
}

impl TaskTable {
    fn get(&self, id: &str) -> Option<&TaskEntry> {
        self.entries.iter().find(|e| e.task.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut TaskEntry> {
        self.entries.iter_mut().find(|e| e.task.id == id)
    }
}

/// State shared between the queue handle and its workers.
struct Shared {
    config: TransferQueueConfig,
    storage: Arc<dyn StorageClient>,
    bus: EventBus,
    table: RwLock<TaskTable>,
    by_state: DerivedView<HashMap<TransferState, Vec<TransferTask>>>,
    wakeup: Notify,
}

struct Workers {
    tasks: JoinSet<()>,
    shutdown: CancellationToken,
}

/// Independent manager of ad-hoc uploads and downloads.
pub struct TransferQueue {
    shared: Arc<Shared>,
    workers: Mutex<Option<Workers>>,
}

impl TransferQueue {
    /// Create a queue. Workers are not running until [`TransferQueue::start`].
    pub fn new(
        config: TransferQueueConfig,
        storage: Arc<dyn StorageClient>,
        bus: EventBus,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config: config.normalized(),
                storage,
                bus,
                table: RwLock::new(TaskTable::default()),
                by_state: DerivedView::new(),
                wakeup: Notify::new(),
            }),
            workers: Mutex::new(None),
        }
    }

    /// Add a transfer, returning its ID.
    pub fn enqueue(&self, request: TransferRequest) -> String {
        let task = TransferTask::new(request);
        let id = task.id.clone();
        let event = state_event(&task);
        self.shared.table.write().entries.push(TaskEntry {
            task,
            control: TaskControl::new(),
        });
        self.shared.changed();
        self.shared.bus.publish(event);

        // Visible to workers only after Queued went out, so it always comes first.
        {
            let mut table = self.shared.table.write();
            if table
                .get(&id)
                .is_some_and(|e| e.task.state == TransferState::Queued)
            {
                table.pending.push_back(id.clone());
            }
        }
        self.shared.wakeup.notify_one();

        debug!(task_id = %id, "Transfer enqueued");
        id
    }

    /// Cancel a task that has not reached a terminal state.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let event = {
            let mut table = self.shared.table.write();
            let entry = table
                .get_mut(id)
                .ok_or_else(|| Error::not_found("TransferTask", id))?;
            if entry.task.state.is_terminal() {
                return Err(Error::invalid_transition(
                    entry.task.state.as_str(),
                    TransferState::Cancelled.as_str(),
                ));
            }
            let event = cancel_entry(entry);
            table.pending.retain(|p| p != id);
            event
        };
        self.shared.changed();
        self.shared.bus.publish(event);

        info!(task_id = %id, "Transfer cancelled");
        Ok(())
    }

    /// Enqueue a new task with the parameters of a failed or cancelled one.
    ///
    /// The old task is left untouched. Returns the new task's ID.
    pub fn retry(&self, id: &str) -> Result<String> {
        let request = {
            let table = self.shared.table.read();
            let entry = table
                .get(id)
                .ok_or_else(|| Error::not_found("TransferTask", id))?;
            if !entry.task.state.is_retryable() {
                return Err(Error::invalid_transition(
                    entry.task.state.as_str(),
                    TransferState::Queued.as_str(),
                ));
            }
            entry.task.request.clone()
        };

        let new_id = self.enqueue(request);
        info!(task_id = %id, new_task_id = %new_id, "Transfer retried");
        Ok(new_id)
    }

    /// Pause an active transfer at its next checkpoint.
    pub fn pause(&self, id: &str) -> Result<()> {
        self.set_paused(id, TransferState::Active, TransferState::Paused)
    }

    /// Resume a paused transfer.
    pub fn resume(&self, id: &str) -> Result<()> {
        self.set_paused(id, TransferState::Paused, TransferState::Active)
    }

    fn set_paused(&self, id: &str, from: TransferState, to: TransferState) -> Result<()> {
        let event = {
            let mut table = self.shared.table.write();
            let entry = table
                .get_mut(id)
                .ok_or_else(|| Error::not_found("TransferTask", id))?;
            if entry.task.state != from {
                return Err(Error::invalid_transition(entry.task.state.as_str(), to.as_str()));
            }
            entry.task.state = to;
            if to == TransferState::Paused {
                entry.task.speed = 0.0;
            }
            entry.control.pause.send_replace(to == TransferState::Paused);
            state_event(&entry.task)
        };
        self.shared.changed();
        self.shared.bus.publish(event);
        Ok(())
    }

    /// Cancel every non-terminal task in one step. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let events: Vec<TransferEvent> = {
            let mut table = self.shared.table.write();
            table.pending.clear();
            table
                .entries
                .iter_mut()
                .filter(|e| !e.task.state.is_terminal())
                .map(cancel_entry)
                .collect()
        };
        let count = events.len();
        if count > 0 {
            self.shared.changed();
            for event in events {
                self.shared.bus.publish(event);
            }
            info!(count, "Cancelled all transfers");
        }
        count
    }

    /// Remove every terminal task from history. Returns how many were removed.
    pub fn clear_completed(&self) -> usize {
        let removed = {
            let mut table = self.shared.table.write();
            let before = table.entries.len();
            table.entries.retain(|e| !e.task.state.is_terminal());
            before - table.entries.len()
        };
        if removed > 0 {
            self.shared.changed();
            debug!(removed, "Cleared finished transfers");
        }
        removed
    }

    /// Consistent snapshot of task counts per state.
    pub fn get_stats(&self) -> TransferStats {
        let table = self.shared.table.read();
        let mut stats = TransferStats::default();
        for entry in &table.entries {
            stats.record(entry.task.state);
        }
        stats
    }

    pub fn get_task(&self, id: &str) -> Option<TransferTask> {
        self.shared.table.read().get(id).map(|e| e.task.clone())
    }

    /// Every visible task in enqueue order.
    pub fn get_tasks(&self) -> Vec<TransferTask> {
        self.shared
            .table
            .read()
            .entries
            .iter()
            .map(|e| e.task.clone())
            .collect()
    }

    /// Tasks currently in `state`, in enqueue order.
    pub fn tasks_in_state(&self, state: TransferState) -> Vec<TransferTask> {
        let grouped = self.shared.by_state.get_or_compute(|| {
            let table = self.shared.table.read();
            let mut grouped: HashMap<TransferState, Vec<TransferTask>> = HashMap::new();
            for entry in &table.entries {
                grouped
                    .entry(entry.task.state)
                    .or_default()
                    .push(entry.task.clone());
            }
            grouped
        });
        grouped.get(&state).cloned().unwrap_or_default()
    }

    /// Whether the worker pool is running.
    pub fn is_running(&self) -> bool {
        self.workers.lock().is_some()
    }

    /// Spawn the worker pool. Calling it again while running does nothing.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if workers.is_some() {
            return;
        }

        let max_workers = self.shared.config.max_workers;
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();
        info!("Starting transfer queue with {} workers", max_workers);

        for i in 0..max_workers {
            let shared = self.shared.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                debug!("Transfer worker {} started", i);
                shared.worker_loop(shutdown).await;
                debug!("Transfer worker {} shutting down", i);
            });
        }

        *workers = Some(Workers { tasks, shutdown });
    }

    /// Stop the worker pool. In-flight transfers end as Cancelled.
    pub async fn shutdown(&self) {
        let Some(mut workers) = self.workers.lock().take() else {
            return;
        };
        workers.shutdown.cancel();
        while workers.tasks.join_next().await.is_some() {}
        info!("Transfer queue stopped");
    }
}

impl Shared {
    fn changed(&self) {
        self.by_state.touch();
    }

    async fn worker_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.claim_next() {
                Some(claim) => self.run_task(claim, &shutdown).await,
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.wakeup.notified() => {}
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
            }
        }
    }

    /// Take the oldest queued task and move it to Initializing.
    fn claim_next(&self) -> Option<Claim> {
        let claim = {
            let mut table = self.table.write();
            loop {
                let id = table.pending.pop_front()?;
                let Some(entry) = table.get_mut(&id) else {
                    continue;
                };
                if entry.task.state != TransferState::Queued {
                    continue;
                }
                entry.task.state = TransferState::Initializing;
                break Claim {
                    id,
                    request: entry.task.request.clone(),
                    cancel: entry.control.cancel.clone(),
                    paused: entry.control.pause.subscribe(),
                    event: state_event(&entry.task),
                };
            }
        };
        self.changed();
        self.bus.publish(claim.event.clone());
        Some(claim)
    }

    async fn run_task(self: &Arc<Self>, claim: Claim, shutdown: &CancellationToken) {
        let id = claim.id.clone();

        let size = match &claim.request {
            TransferRequest::Upload { source } => match file_size(source).await {
                Ok(size) => size,
                Err(e) => {
                    self.finish(&id, Err(e));
                    return;
                }
            },
            // Learned from the first progress report.
            TransferRequest::Download { .. } => 0,
        };

        if !self.update(&id, |task| {
            if task.state != TransferState::Initializing {
                return false;
            }
            task.size = size;
            task.state = TransferState::Active;
            true
        }) {
            return;
        }

        let control = TransferControl::new(claim.cancel.clone())
            .with_pause(claim.paused)
            .with_progress(self.progress_reporter(&id));

        let transfer = async {
            match &claim.request {
                TransferRequest::Upload { source } => {
                    self.storage.upload(source, &control).await.map(|_| ())
                }
                TransferRequest::Download { file_id, dest } => {
                    self.storage.download(file_id, dest, &control).await
                }
            }
        };

        let result = tokio::select! {
            result = transfer => result,
            _ = claim.cancel.cancelled() => Err(Error::Cancelled),
            _ = shutdown.cancelled() => {
                claim.cancel.cancel();
                Err(Error::Cancelled)
            }
        };
        self.finish(&id, result);
    }

    /// Record the end of a transfer unless the task was already finished by a cancel.
    fn finish(&self, id: &str, result: Result<()>) {
        let (state, error) = match &result {
            Ok(()) => (TransferState::Completed, None),
            Err(e) if e.is_cancelled() => (TransferState::Cancelled, None),
            Err(e) => (TransferState::Failed, Some(e.to_string())),
        };

        let applied = self.update(id, |task| {
            if task.state.is_terminal() {
                return false;
            }
            task.state = state;
            task.error = error.clone();
            task.speed = 0.0;
            if state == TransferState::Completed {
                task.progress = 1.0;
            }
            true
        });

        if applied {
            match (&state, &error) {
                (TransferState::Failed, Some(message)) => {
                    warn!(task_id = %id, error = %message, "Transfer failed");
                    self.bus
                        .log(LogLevel::Error, format!("Transfer {id} failed: {message}"));
                }
                _ => debug!(task_id = %id, state = %state, "Transfer finished"),
            }
        }
    }

    /// Apply `f` to a task; when it returns true, publish the task's new state.
    fn update<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut TransferTask) -> bool,
    {
        let event = {
            let mut table = self.table.write();
            let Some(entry) = table.get_mut(id) else {
                return false;
            };
            if !f(&mut entry.task) {
                return false;
            }
            state_event(&entry.task)
        };
        self.changed();
        self.bus.publish(event);
        true
    }

    /// Progress callback that tracks speed and publishes throttled samples.
    fn progress_reporter(self: &Arc<Self>, id: &str) -> impl Fn(u64, u64) + Send + Sync + 'static {
        let shared = Arc::downgrade(self);
        let id = id.to_string();
        let throttle = ProgressThrottle::from_millis(self.config.progress_interval_ms);
        let last_sample: Mutex<Option<(Instant, u64)>> = Mutex::new(None);

        move |done, total| {
            let Some(shared) = shared.upgrade() else {
                return;
            };

            let now = Instant::now();
            let measured = {
                let mut last = last_sample.lock();
                let measured = match *last {
                    Some((at, bytes)) => {
                        let elapsed = now.duration_since(at).as_secs_f64();
                        if elapsed > 0.0 {
                            Some(done.saturating_sub(bytes) as f64 / elapsed)
                        } else {
                            None
                        }
                    }
                    None => None,
                };
                *last = Some((now, done));
                measured
            };

            let progress = fraction(done, total);
            let current_speed = {
                let mut table = shared.table.write();
                let Some(entry) = table.get_mut(&id) else {
                    return;
                };
                if entry.task.state != TransferState::Active {
                    return;
                }
                entry.task.progress = progress;
                if total > 0 {
                    entry.task.size = total;
                }
                if let Some(speed) = measured {
                    entry.task.speed = speed;
                }
                entry.task.speed
            };
            shared.changed();

            if throttle.should_emit(done, total) {
                shared.bus.publish(TransferEvent::Progress {
                    task_id: id.clone(),
                    progress,
                    speed_bytes_per_sec: current_speed,
                });
            }
        }
    }
}

/// A task handed to a worker.
struct Claim {
    id: String,
    request: TransferRequest,
    cancel: CancellationToken,
    paused: watch::Receiver<bool>,
    event: TransferEvent,
}

fn cancel_entry(entry: &mut TaskEntry) -> TransferEvent {
    entry.task.state = TransferState::Cancelled;
    entry.task.speed = 0.0;
    entry.control.cancel.cancel();
    state_event(&entry.task)
}

fn state_event(task: &TransferTask) -> TransferEvent {
    TransferEvent::StateChanged {
        task_id: task.id.clone(),
        transfer_type: task.transfer_type,
        name: task.name.clone(),
        state: task.state,
        error: task.error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventType};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};

    /// Storage double that streams a file in chunks, honoring checkpoints.
    struct ChunkedStorage {
        chunks: u64,
        chunk_delay: Duration,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl StorageClient for ChunkedStorage {
        async fn upload(&self, _path: &Path, control: &TransferControl) -> Result<String> {
            for i in 1..=self.chunks {
                control.checkpoint().await?;
                tokio::time::sleep(self.chunk_delay).await;
                control.report(i * 100, self.chunks * 100);
            }
            match &self.fail_with {
                Some(message) => Err(Error::Other(message.clone())),
                None => Ok("file-1".to_string()),
            }
        }

        async fn download(
            &self,
            _file_id: &str,
            _dest: &Path,
            control: &TransferControl,
        ) -> Result<()> {
            control.checkpoint().await?;
            control.report(10, 10);
            Ok(())
        }
    }

    fn queue(storage: ChunkedStorage) -> TransferQueue {
        let config = TransferQueueConfig {
            max_workers: 2,
            poll_interval_ms: 10,
            progress_interval_ms: 0,
        };
        TransferQueue::new(config, Arc::new(storage), EventBus::new())
    }

    fn upload(path: &str) -> TransferRequest {
        TransferRequest::Upload {
            source: PathBuf::from(path),
        }
    }

    async fn wait_for_state(queue: &TransferQueue, id: &str, state: TransferState) {
        for _ in 0..200 {
            if queue.get_task(id).map(|t| t.state) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "task {} never reached {}, last state {:?}",
            id,
            state,
            queue.get_task(id).map(|t| t.state)
        );
    }

    async fn temp_file(dir: &tempfile::TempDir, name: &str) -> String {
        let path = dir.path().join(name);
        tokio::fs::write(&path, vec![0u8; 300]).await.unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_cancel_rejects_terminal_task() {
        let queue = queue(ChunkedStorage {
            chunks: 1,
            chunk_delay: Duration::ZERO,
            fail_with: None,
        });
        let id = queue.enqueue(upload("/data/a.dat"));
        queue.cancel(&id).unwrap();

        let err = queue.cancel(&id).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert!(matches!(queue.cancel("missing"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_retry_only_from_failed_or_cancelled() {
        let queue = queue(ChunkedStorage {
            chunks: 1,
            chunk_delay: Duration::ZERO,
            fail_with: None,
        });
        let id = queue.enqueue(upload("/data/a.dat"));
        assert!(matches!(
            queue.retry(&id),
            Err(Error::InvalidStateTransition { .. })
        ));

        queue.cancel(&id).unwrap();
        let new_id = queue.retry(&id).unwrap();
        assert_ne!(new_id, id);
        assert_eq!(queue.get_task(&id).unwrap().state, TransferState::Cancelled);
        assert_eq!(queue.get_task(&new_id).unwrap().state, TransferState::Queued);
        assert_eq!(
            queue.get_task(&new_id).unwrap().request,
            upload("/data/a.dat")
        );
    }

    #[test]
    fn test_pause_requires_active() {
        let queue = queue(ChunkedStorage {
            chunks: 1,
            chunk_delay: Duration::ZERO,
            fail_with: None,
        });
        let id = queue.enqueue(upload("/data/a.dat"));
        assert!(matches!(
            queue.pause(&id),
            Err(Error::InvalidStateTransition { .. })
        ));
        assert!(matches!(
            queue.resume(&id),
            Err(Error::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_tasks_in_state_tracks_mutations() {
        let queue = queue(ChunkedStorage {
            chunks: 1,
            chunk_delay: Duration::ZERO,
            fail_with: None,
        });
        let a = queue.enqueue(upload("/data/a.dat"));
        let b = queue.enqueue(upload("/data/b.dat"));
        assert_eq!(queue.tasks_in_state(TransferState::Queued).len(), 2);

        queue.cancel(&a).unwrap();
        let queued = queue.tasks_in_state(TransferState::Queued);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, b);
        assert_eq!(queue.tasks_in_state(TransferState::Cancelled)[0].id, a);
    }

    #[tokio::test]
    async fn test_worker_completes_upload_and_publishes_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let source = temp_file(&dir, "a.dat").await;
        let queue = queue(ChunkedStorage {
            chunks: 3,
            chunk_delay: Duration::from_millis(5),
            fail_with: None,
        });
        let mut events = queue.shared.bus.subscribe(EventType::Transfer);

        queue.start();
        let id = queue.enqueue(upload(&source));
        wait_for_state(&queue, &id, TransferState::Completed).await;
        queue.shutdown().await;

        let task = queue.get_task(&id).unwrap();
        assert_eq!(task.size, 300);
        assert_eq!(task.progress, 1.0);

        let states: Vec<TransferState> = events
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                Event::Transfer(TransferEvent::StateChanged { state, .. }) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                TransferState::Queued,
                TransferState::Initializing,
                TransferState::Active,
                TransferState::Completed
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_upload_records_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = temp_file(&dir, "a.dat").await;
        let queue = queue(ChunkedStorage {
            chunks: 1,
            chunk_delay: Duration::ZERO,
            fail_with: Some("connection reset".to_string()),
        });

        queue.start();
        let id = queue.enqueue(upload(&source));
        wait_for_state(&queue, &id, TransferState::Failed).await;
        queue.shutdown().await;

        assert_eq!(
            queue.get_task(&id).unwrap().error.as_deref(),
            Some("connection reset")
        );
    }

    #[tokio::test]
    async fn test_missing_source_fails_during_initialization() {
        let queue = queue(ChunkedStorage {
            chunks: 1,
            chunk_delay: Duration::ZERO,
            fail_with: None,
        });
        queue.start();
        let id = queue.enqueue(upload("/definitely/not/here.dat"));
        wait_for_state(&queue, &id, TransferState::Failed).await;
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_and_resume_active_upload() {
        let dir = tempfile::tempdir().unwrap();
        let source = temp_file(&dir, "a.dat").await;
        let queue = queue(ChunkedStorage {
            chunks: 20,
            chunk_delay: Duration::from_millis(10),
            fail_with: None,
        });

        queue.start();
        let id = queue.enqueue(upload(&source));
        wait_for_state(&queue, &id, TransferState::Active).await;

        queue.pause(&id).unwrap();
        assert_eq!(queue.get_task(&id).unwrap().state, TransferState::Paused);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let paused_progress = queue.get_task(&id).unwrap().progress;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.get_task(&id).unwrap().progress, paused_progress);

        queue.resume(&id).unwrap();
        wait_for_state(&queue, &id, TransferState::Completed).await;
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let source = temp_file(&dir, "a.dat").await;
        let queue = queue(ChunkedStorage {
            chunks: 1000,
            chunk_delay: Duration::from_millis(10),
            fail_with: None,
        });

        queue.start();
        let id = queue.enqueue(upload(&source));
        wait_for_state(&queue, &id, TransferState::Active).await;
        queue.shutdown().await;

        assert!(!queue.is_running());
        assert_eq!(queue.get_task(&id).unwrap().state, TransferState::Cancelled);
    }
}
