//! Batch-level progress telemetry.
//!
//! Workers only touch atomics on [`ProgressTracker`]; the [`ProgressAggregator`]
//! samples them on a fixed cadence and publishes [`BatchState`] snapshots through a
//! `watch` channel, so a slow subscriber only ever misses intermediate snapshots.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::core::config::DownloadConfig;

use super::instruction::FetchInstruction;

const NO_ITEM: usize = usize::MAX;

/// Read-only view of a running or settled batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchState {
    pub total_items: usize,
    pub completed_items: usize,
    pub skipped_items: usize,
    pub failed_items: usize,
    /// Known sizes up front; unknown sizes are folded in as items finish.
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    /// Most recently started or progressed item (display only).
    pub current_file_name: Option<String>,
    pub download_speed_bytes_per_sec: f64,
    /// `None` while speed or total size is unknown.
    pub estimated_seconds_remaining: Option<f64>,
    pub active_workers: usize,
    pub cancelled: bool,
}

impl BatchState {
    pub fn settled_items(&self) -> usize {
        self.completed_items + self.skipped_items + self.failed_items
    }

    pub fn is_settled(&self) -> bool {
        self.settled_items() == self.total_items
    }

    /// Byte-based completion ratio in `[0, 1]`, when a total is known.
    pub fn fraction(&self) -> Option<f64> {
        if self.total_bytes == 0 {
            return None;
        }
        Some((self.downloaded_bytes as f64 / self.total_bytes as f64).min(1.0))
    }
}

/// Lock-free counters shared by all workers of one batch.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    names: Vec<String>,
    /// High-water byte count per item; never decreases across retries.
    slots: Vec<AtomicU64>,
    completed: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    total_bytes: AtomicU64,
    downloaded_bytes: AtomicU64,
    /// Bytes that actually crossed the network.
    transferred_bytes: AtomicU64,
    current: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    retries: AtomicU64,
    cancelled: AtomicBool,
}

impl ProgressTracker {
    pub fn new(items: &[FetchInstruction]) -> Self {
        let known_bytes = items
            .iter()
            .filter_map(|item| item.expected_size)
            .fold(0, u64::saturating_add);
        Self {
            names: items.iter().map(FetchInstruction::file_name).collect(),
            slots: items.iter().map(|_| AtomicU64::new(0)).collect(),
            completed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            total_bytes: AtomicU64::new(known_bytes),
            downloaded_bytes: AtomicU64::new(0),
            transferred_bytes: AtomicU64::new(0),
            current: AtomicUsize::new(NO_ITEM),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            retries: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn mark_current(&self, index: usize) {
        self.current.store(index, Ordering::Relaxed);
    }

    /// Report that the current attempt for `index` has written `bytes` so far.
    pub fn advance(&self, index: usize, bytes: u64) {
        let delta = self.raise_slot(index, bytes);
        if delta > 0 {
            saturating_add(&self.transferred_bytes, delta);
        }
        self.mark_current(index);
    }

    pub fn record_completed(&self, index: usize, size: u64, size_known: bool) {
        if !size_known {
            saturating_add(&self.total_bytes, size);
        }
        self.raise_slot(index, size);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self, index: usize, size: u64, size_known: bool) {
        if !size_known {
            saturating_add(&self.total_bytes, size);
        }
        self.raise_slot(index, size);
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self, _index: usize) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_started(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
    }

    pub fn worker_finished(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, speed: f64) -> BatchState {
        let total_bytes = self.total_bytes.load(Ordering::Relaxed);
        let downloaded_bytes = self.downloaded_bytes.load(Ordering::Relaxed);
        let current = self.current.load(Ordering::Relaxed);
        BatchState {
            total_items: self.names.len(),
            completed_items: self.completed.load(Ordering::Relaxed),
            skipped_items: self.skipped.load(Ordering::Relaxed),
            failed_items: self.failed.load(Ordering::Relaxed),
            total_bytes,
            downloaded_bytes,
            current_file_name: self.names.get(current).cloned(),
            download_speed_bytes_per_sec: speed,
            estimated_seconds_remaining: estimate_remaining(total_bytes, downloaded_bytes, speed),
            active_workers: self.active.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Raise the item's high-water mark, returning how much the batch total grew.
    fn raise_slot(&self, index: usize, bytes: u64) -> u64 {
        let Some(slot) = self.slots.get(index) else {
            return 0;
        };
        let previous = slot.fetch_max(bytes, Ordering::Relaxed);
        let delta = bytes.saturating_sub(previous);
        if delta > 0 {
            saturating_add(&self.downloaded_bytes, delta);
        }
        delta
    }
}

/// Byte counters come from caller-declared sizes and must not wrap.
fn saturating_add(counter: &AtomicU64, delta: u64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_add(delta))
    });
}

pub(crate) fn estimate_remaining(total_bytes: u64, downloaded_bytes: u64, speed: f64) -> Option<f64> {
    if speed <= 0.0 || !speed.is_finite() || total_bytes == 0 {
        return None;
    }
    Some(total_bytes.saturating_sub(downloaded_bytes) as f64 / speed)
}

/// Exponentially-weighted moving average of throughput between samples.
#[derive(Debug, Clone)]
pub(crate) struct SpeedEstimator {
    smoothing: f64,
    last_bytes: u64,
    last_at: Instant,
    speed: f64,
    primed: bool,
}

impl SpeedEstimator {
    pub fn new(smoothing: f64, bytes: u64, now: Instant) -> Self {
        Self {
            smoothing,
            last_bytes: bytes,
            last_at: now,
            speed: 0.0,
            primed: false,
        }
    }

    pub fn sample(&mut self, bytes: u64, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_at).as_secs_f64();
        if elapsed <= 0.0 {
            return self.speed;
        }
        let instant = bytes.saturating_sub(self.last_bytes) as f64 / elapsed;
        self.speed = if self.primed {
            self.smoothing * instant + (1.0 - self.smoothing) * self.speed
        } else {
            self.primed = true;
            instant
        };
        self.last_bytes = bytes;
        self.last_at = now;
        self.speed
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }
}

/// Samples a [`ProgressTracker`] on a fixed cadence and publishes snapshots.
pub(crate) struct ProgressAggregator {
    tracker: Arc<ProgressTracker>,
    sender: watch::Sender<BatchState>,
    interval: Duration,
    estimator: SpeedEstimator,
    last_downloaded: u64,
}

impl ProgressAggregator {
    pub fn new(
        tracker: Arc<ProgressTracker>,
        sender: watch::Sender<BatchState>,
        config: &DownloadConfig,
    ) -> Self {
        let estimator = SpeedEstimator::new(
            config.smoothing(),
            tracker.transferred_bytes(),
            Instant::now(),
        );
        Self {
            tracker,
            sender,
            interval: config.progress_interval.max(Duration::from_millis(10)),
            estimator,
            last_downloaded: 0,
        }
    }

    /// Tick until `stop` fires, then hand the aggregator back for the final snapshot.
    pub async fn run(mut self, stop: CancellationToken) -> Self {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    self.publish();
                }
            }
        }
        self
    }

    /// Sample and publish one snapshot (replace-latest).
    pub fn publish(&mut self) -> BatchState {
        let speed = self
            .estimator
            .sample(self.tracker.transferred_bytes(), Instant::now());
        let mut state = self.tracker.snapshot(speed);
        state.downloaded_bytes = state.downloaded_bytes.max(self.last_downloaded);
        self.last_downloaded = state.downloaded_bytes;
        self.sender.send_replace(state.clone());
        state
    }

    /// Settlement snapshot: the last smoothed speed, no ETA.
    pub fn finish(mut self) -> BatchState {
        let mut state = self.tracker.snapshot(self.estimator.speed());
        state.downloaded_bytes = state.downloaded_bytes.max(self.last_downloaded);
        state.estimated_seconds_remaining = Some(0.0);
        self.last_downloaded = state.downloaded_bytes;
        self.sender.send_replace(state.clone());
        state
    }
}
