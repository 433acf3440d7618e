use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::config::DownloadConfig;
use crate::core::error::{FetchError, FetchResult};
use crate::core::http::build_http_client;

use super::extract::{ArchiveExtractor, ZipExtractor};
use super::instruction::{FetchInstruction, FetchOutcome, ItemReport};
use super::progress::{BatchState, ProgressAggregator, ProgressTracker};
use super::scheduler::WorkerPool;
use super::worker::FetchWorker;

/// Entry point of the pipeline. One instance per caller/session; batches are independent.
pub struct Downloader {
    client: Client,
    config: Arc<DownloadConfig>,
    extractor: Arc<dyn ArchiveExtractor>,
}

impl Downloader {
    pub fn new(config: DownloadConfig) -> FetchResult<Self> {
        let client = build_http_client(&config)?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: DownloadConfig) -> Self {
        Self {
            client,
            config: Arc::new(config),
            extractor: Arc::new(ZipExtractor),
        }
    }

    pub fn with_extractor(mut self, extractor: impl ArchiveExtractor + 'static) -> Self {
        self.extractor = Arc::new(extractor);
        self
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Validate `items` and start fetching them with at most `concurrency_limit`
    /// parallel workers (clamped to the configured ceiling).
    ///
    /// Validation failures are returned before any network activity. Must be called
    /// from within a Tokio runtime.
    pub fn submit_batch(
        &self,
        items: Vec<FetchInstruction>,
        concurrency_limit: usize,
    ) -> FetchResult<BatchHandle> {
        let workers = self.config.effective_concurrency(concurrency_limit)?;
        validate_instructions(&items)?;
        if self.config.check_disk_space {
            ensure_disk_space(&items, self.config.min_free_disk_bytes)?;
        }

        let id = Uuid::new_v4();
        info!(
            "Starting batch {}: {} files, concurrency={}",
            id,
            items.len(),
            workers
        );

        let items: Arc<[FetchInstruction]> = items.into();
        let tracker = Arc::new(ProgressTracker::new(&items));
        let (sender, receiver) = watch::channel(tracker.snapshot(0.0));
        let cancel = CancellationToken::new();

        let worker = Arc::new(FetchWorker::new(
            self.client.clone(),
            self.config.clone(),
            self.extractor.clone(),
            tracker.clone(),
            cancel.clone(),
        ));
        let pool = WorkerPool::new(worker, items.clone(), tracker.clone(), cancel.clone(), workers);
        let aggregator = ProgressAggregator::new(tracker.clone(), sender, &self.config);

        let task = tokio::spawn(drive_batch(
            id,
            items,
            pool,
            aggregator,
            tracker.clone(),
            cancel.clone(),
        ));

        Ok(BatchHandle {
            id,
            progress: receiver,
            cancel,
            tracker,
            task,
        })
    }

    /// Submit and wait for settlement.
    pub async fn run(
        &self,
        items: Vec<FetchInstruction>,
        concurrency_limit: usize,
    ) -> FetchResult<BatchResult> {
        self.submit_batch(items, concurrency_limit)?.wait().await
    }
}

/// A running batch. Dropping the handle detaches the batch; it still runs to settlement.
pub struct BatchHandle {
    id: Uuid,
    progress: watch::Receiver<BatchState>,
    cancel: CancellationToken,
    tracker: Arc<ProgressTracker>,
    task: JoinHandle<BatchResult>,
}

impl BatchHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Latest-value subscription to `BatchState` snapshots.
    pub fn subscribe(&self) -> watch::Receiver<BatchState> {
        self.progress.clone()
    }

    pub fn snapshot(&self) -> BatchState {
        self.progress.borrow().clone()
    }

    /// Request cooperative cancellation. Committed files stay; nothing partial is left
    /// at a destination.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            info!("Cancelling batch {}", self.id);
            self.tracker.mark_cancelled();
            self.cancel.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn wait(self) -> FetchResult<BatchResult> {
        self.task
            .await
            .map_err(|e| FetchError::Other(format!("Batch task join error: {e}")))
    }
}

/// Per-group tallies for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Final manifest of a settled batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: Uuid,
    /// One report per submitted instruction, in submission order.
    pub items: Vec<ItemReport>,
    pub state: BatchState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub peak_active_workers: usize,
    pub retries: u64,
}

impl BatchResult {
    pub fn outcomes(&self) -> impl Iterator<Item = &FetchOutcome> {
        self.items.iter().map(|item| &item.outcome)
    }

    pub fn failures(&self) -> Vec<&ItemReport> {
        self.items
            .iter()
            .filter(|item| item.outcome.is_failed())
            .collect()
    }

    pub fn is_complete_success(&self) -> bool {
        self.state.failed_items == 0
    }

    pub fn group_summary(&self) -> BTreeMap<String, GroupSummary> {
        let mut groups: BTreeMap<String, GroupSummary> = BTreeMap::new();
        for item in &self.items {
            let entry = groups.entry(item.instruction.group.clone()).or_default();
            match item.outcome {
                FetchOutcome::Completed { .. } => entry.completed += 1,
                FetchOutcome::Skipped { .. } => entry.skipped += 1,
                FetchOutcome::Failed { .. } => entry.failed += 1,
            }
        }
        groups
    }
}

async fn drive_batch(
    id: Uuid,
    items: Arc<[FetchInstruction]>,
    pool: WorkerPool,
    aggregator: ProgressAggregator,
    tracker: Arc<ProgressTracker>,
    cancel: CancellationToken,
) -> BatchResult {
    let started_at = Utc::now();
    let clock = Instant::now();

    let stop = CancellationToken::new();
    let ticker = tokio::spawn(aggregator.run(stop.clone()));

    let reports = pool.run().await;

    if cancel.is_cancelled() {
        tracker.mark_cancelled();
    }
    stop.cancel();
    let state = match ticker.await {
        Ok(aggregator) => aggregator.finish(),
        Err(error) => {
            warn!("Progress aggregator for batch {} failed: {}", id, error);
            tracker.snapshot(0.0)
        }
    };

    let items: Vec<ItemReport> = reports
        .into_iter()
        .enumerate()
        .map(|(index, report)| ItemReport {
            index,
            instruction: items[index].clone(),
            outcome: report.outcome,
            attempts: report.attempts,
        })
        .collect();

    let elapsed = clock.elapsed();
    info!(
        "Batch {} settled in {:?}: {} completed, {} skipped, {} failed ({} bytes)",
        id,
        elapsed,
        state.completed_items,
        state.skipped_items,
        state.failed_items,
        state.downloaded_bytes
    );
    if state.failed_items > 0 {
        warn!("{} downloads failed in batch {}", state.failed_items, id);
    }

    BatchResult {
        batch_id: id,
        items,
        state,
        started_at,
        finished_at: Utc::now(),
        elapsed_ms: elapsed.as_millis().min(u64::MAX as u128) as u64,
        peak_active_workers: tracker.peak_active(),
        retries: tracker.retries(),
    }
}

// ── Batch validation ────────────────────────────────────

fn validate_instructions(items: &[FetchInstruction]) -> FetchResult<()> {
    let mut seen = HashSet::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        if item.source_url.trim().is_empty() {
            return Err(FetchError::InvalidInstruction {
                index,
                message: "empty source URL".to_string(),
            });
        }
        match reqwest::Url::parse(&item.source_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(FetchError::InvalidInstruction {
                    index,
                    message: format!("unsupported URL scheme {:?}", url.scheme()),
                });
            }
            Err(e) => {
                return Err(FetchError::InvalidInstruction {
                    index,
                    message: format!("invalid source URL {:?}: {e}", item.source_url),
                });
            }
        }
        if !item.destination.is_absolute() {
            return Err(FetchError::InvalidInstruction {
                index,
                message: format!("destination {:?} is not absolute", item.destination),
            });
        }

        let normalized = normalize_lexically(&item.destination);
        if normalized.file_name().is_none() {
            return Err(FetchError::InvalidInstruction {
                index,
                message: format!("destination {:?} has no file name", item.destination),
            });
        }
        if !seen.insert(normalized) {
            return Err(FetchError::DuplicateDestination(item.destination.clone()));
        }
    }
    Ok(())
}

/// Resolve `.` and `..` without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ── Disk space pre-flight ───────────────────────────────

fn ensure_disk_space(items: &[FetchInstruction], headroom: u64) -> FetchResult<()> {
    if items.iter().all(|item| item.expected_size.is_none()) {
        return Ok(());
    }

    let disks = sysinfo::Disks::new_with_refreshed_list();
    let mounts: Vec<(PathBuf, u64)> = disks
        .list()
        .iter()
        .map(|disk| (disk.mount_point().to_path_buf(), disk.available_space()))
        .collect();

    for (mount, available, needed) in space_needed_per_mount(items, &mounts) {
        let required = needed.saturating_add(headroom);
        if available < required {
            return Err(FetchError::InsufficientDiskSpace {
                path: mount,
                available,
                required,
            });
        }
    }
    Ok(())
}

/// Sum known sizes per mount point: `(mount, available, needed)`.
/// Destinations on no known mount are ignored.
fn space_needed_per_mount(
    items: &[FetchInstruction],
    mounts: &[(PathBuf, u64)],
) -> Vec<(PathBuf, u64, u64)> {
    let mut needed: HashMap<usize, u64> = HashMap::new();
    for item in items {
        let Some(size) = item.expected_size else {
            continue;
        };
        let anchor = existing_ancestor(&item.destination);
        let canonical = std::fs::canonicalize(&anchor).unwrap_or(anchor);

        let mut best: Option<(usize, usize)> = None;
        for (index, (mount, _)) in mounts.iter().enumerate() {
            if canonical.starts_with(mount) {
                let len = mount.as_os_str().len();
                if best.map_or(true, |(_, best_len)| len >= best_len) {
                    best = Some((index, len));
                }
            }
        }
        if let Some((index, _)) = best {
            let total = needed.entry(index).or_default();
            *total = total.saturating_add(size);
        }
    }

    let mut result: Vec<(PathBuf, u64, u64)> = needed
        .into_iter()
        .map(|(index, bytes)| (mounts[index].0.clone(), mounts[index].1, bytes))
        .collect();
    result.sort_by(|a, b| a.0.cmp(&b.0));
    result
}

fn existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|candidate| candidate.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| path.to_path_buf())
}
