//! Per-stage worker pools.
//!
//! Each stage of a run gets its own pool of `max_workers` tasks pulling from a
//! shared queue, so the number of concurrent archive, upload and API
//! operations is capped independently.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::stages::{JobItem, StageExecutor, StageOutcome};
use crate::domain::Stage;

/// Receiving side of a stage queue, shared by the stage's workers.
pub(super) type StageQueue = Arc<Mutex<mpsc::UnboundedReceiver<JobItem>>>;

/// A worker pool servicing one stage.
pub(super) struct StagePool {
    stage: Stage,
    max_workers: usize,
    tasks: JoinSet<()>,
}

impl StagePool {
    pub(super) fn new(stage: Stage, max_workers: usize) -> Self {
        Self {
            stage,
            max_workers: max_workers.max(1),
            tasks: JoinSet::new(),
        }
    }

    /// Spawn the workers.
    ///
    /// Workers exit when the queue is closed and drained, or when `cancel`
    /// fires. An item received after cancellation is handed back untouched as
    /// [`StageOutcome::Interrupted`].
    pub(super) fn start(
        &mut self,
        queue: StageQueue,
        executor: Arc<StageExecutor>,
        outcomes: mpsc::UnboundedSender<StageOutcome>,
        cancel: CancellationToken,
    ) {
        let stage = self.stage;
        info!("Starting {} worker pool with {} workers", stage, self.max_workers);

        for i in 0..self.max_workers {
            let queue = queue.clone();
            let executor = executor.clone();
            let outcomes = outcomes.clone();
            let cancel = cancel.clone();

            self.tasks.spawn(async move {
                debug!("{} worker {} started", stage, i);

                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        item = async { queue.lock().await.recv().await } => item,
                    };
                    let Some(item) = next else {
                        break;
                    };

                    let outcome = if cancel.is_cancelled() {
                        StageOutcome::Interrupted(item)
                    } else {
                        executor.run(stage, item, &cancel).await
                    };

                    if outcomes.send(outcome).is_err() {
                        break;
                    }
                }

                debug!("{} worker {} shutting down", stage, i);
            });
        }
    }

    /// Wait for every worker to exit.
    pub(super) async fn join(mut self) {
        while self.tasks.join_next().await.is_some() {}
        debug!("{} worker pool stopped", self.stage);
    }
}

/// Create a stage queue and its sender.
pub(super) fn stage_queue() -> (mpsc::UnboundedSender<JobItem>, StageQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Arc::new(Mutex::new(rx)))
}
