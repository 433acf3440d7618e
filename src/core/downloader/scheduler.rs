use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::error::{FailureKind, FailureReason};

use super::instruction::{FetchInstruction, FetchOutcome};
use super::progress::ProgressTracker;
use super::worker::{FetchWorker, WorkerReport};

/// Shared FIFO of pending item indices.
#[derive(Debug)]
pub(crate) struct WorkQueue {
    pending: Mutex<VecDeque<usize>>,
}

impl WorkQueue {
    pub fn new(len: usize) -> Self {
        Self {
            pending: Mutex::new((0..len).collect()),
        }
    }

    pub fn pop(&self) -> Option<usize> {
        match self.pending.lock() {
            Ok(mut pending) => pending.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }
}

/// Fixed set of executors pulling from one [`WorkQueue`] until it drains.
pub(crate) struct WorkerPool {
    worker: Arc<FetchWorker>,
    items: Arc<[FetchInstruction]>,
    tracker: Arc<ProgressTracker>,
    cancel: CancellationToken,
    size: usize,
}

impl WorkerPool {
    pub fn new(
        worker: Arc<FetchWorker>,
        items: Arc<[FetchInstruction]>,
        tracker: Arc<ProgressTracker>,
        cancel: CancellationToken,
        size: usize,
    ) -> Self {
        Self {
            worker,
            items,
            tracker,
            cancel,
            size,
        }
    }

    /// Run every item to a terminal outcome; the result is indexed like `items`.
    pub async fn run(self) -> Vec<WorkerReport> {
        let total = self.items.len();
        let queue = Arc::new(WorkQueue::new(total));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(usize, WorkerReport)>();
        let mut set = JoinSet::new();

        for slot in 0..self.size.min(total) {
            let queue = queue.clone();
            let worker = self.worker.clone();
            let items = self.items.clone();
            let tracker = self.tracker.clone();
            let cancel = self.cancel.clone();
            let done_tx = done_tx.clone();

            set.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let Some(index) = queue.pop() else {
                        break;
                    };
                    tracker.worker_started();
                    let report = worker.fetch(index, &items[index]).await;
                    tracker.worker_finished();
                    if done_tx.send((index, report)).is_err() {
                        break;
                    }
                }
                debug!(worker = slot, "Worker idle");
            });
        }
        drop(done_tx);

        while let Some(joined) = set.join_next().await {
            if let Err(error) = joined {
                warn!("Download worker terminated abnormally: {}", error);
            }
        }

        let mut reports: Vec<Option<WorkerReport>> = (0..total).map(|_| None).collect();
        while let Ok((index, report)) = done_rx.try_recv() {
            reports[index] = Some(report);
        }

        // Items never started (cancellation) or lost with a crashed worker.
        reports
            .into_iter()
            .enumerate()
            .map(|(index, report)| {
                report.unwrap_or_else(|| {
                    self.tracker.record_failed(index);
                    let outcome = if self.cancel.is_cancelled() {
                        FetchOutcome::cancelled()
                    } else {
                        FetchOutcome::Failed {
                            reason: FailureReason {
                                kind: FailureKind::Internal,
                                message: "worker terminated before finishing".to_string(),
                            },
                        }
                    };
                    WorkerReport {
                        outcome,
                        attempts: 0,
                    }
                })
            })
            .collect()
    }
}
