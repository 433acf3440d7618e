use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::Client;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::core::config::DownloadConfig;
use crate::core::error::{FetchError, FetchResult};

use super::extract::ArchiveExtractor;
use super::instruction::{FetchInstruction, FetchOutcome};
use super::progress::ProgressTracker;
use super::verify::{self, Hasher};

/// Bytes written to a temp file and the digest accumulated while streaming.
struct Transferred {
    size: u64,
    digest: Option<String>,
}

/// Result of servicing one instruction.
pub(crate) struct WorkerReport {
    pub outcome: FetchOutcome,
    pub attempts: u32,
}

/// Fetches, verifies, commits and post-processes a single instruction.
pub(crate) struct FetchWorker {
    client: Client,
    config: Arc<DownloadConfig>,
    extractor: Arc<dyn ArchiveExtractor>,
    tracker: Arc<ProgressTracker>,
    cancel: CancellationToken,
}

impl FetchWorker {
    pub fn new(
        client: Client,
        config: Arc<DownloadConfig>,
        extractor: Arc<dyn ArchiveExtractor>,
        tracker: Arc<ProgressTracker>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            config,
            extractor,
            tracker,
            cancel,
        }
    }

    /// Drive `item` to a terminal outcome and record it on the tracker.
    #[instrument(skip_all, fields(url = %item.source_url, dest = ?item.destination))]
    pub async fn fetch(&self, index: usize, item: &FetchInstruction) -> WorkerReport {
        self.tracker.mark_current(index);
        let mut attempts = 0_u32;
        let result = self.fetch_inner(index, item, &mut attempts).await;

        let size_known = item.expected_size.is_some();
        let outcome = match result {
            Ok(Step::Skipped(size)) => {
                debug!("Already valid on disk ({} bytes)", size);
                self.tracker.record_skipped(index, size, size_known);
                FetchOutcome::Skipped { bytes: size }
            }
            Ok(Step::Completed(size)) => {
                debug!("Completed ({} bytes, {} attempt(s))", size, attempts);
                self.tracker.record_completed(index, size, size_known);
                FetchOutcome::Completed { bytes: size }
            }
            Err(error) => {
                if matches!(error, FetchError::Cancelled) {
                    debug!("Cancelled");
                } else {
                    warn!("Fetch failed after {} attempt(s): {}", attempts, error);
                }
                self.tracker.record_failed(index);
                FetchOutcome::Failed {
                    reason: error.to_reason(),
                }
            }
        };

        WorkerReport { outcome, attempts }
    }

    async fn fetch_inner(
        &self,
        index: usize,
        item: &FetchInstruction,
        attempts: &mut u32,
    ) -> FetchResult<Step> {
        if self.cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        // 1. fast path
        match verify::file_matches(
            &item.destination,
            item.expected_digest.as_ref(),
            item.expected_size,
        )
        .await
        {
            Ok(Some(size)) => return Ok(Step::Skipped(size)),
            Ok(None) => {}
            Err(error) => debug!("Fast-path check failed, downloading anyway: {}", error),
        }

        if let Some(parent) = item.destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| FetchError::io(parent, source))?;
        }

        // 2–4. transfer + size/digest checks, retrying transient failures
        let temp = temp_path_for(&item.destination);
        let transferred = self.transfer_with_retry(index, item, &temp, attempts).await?;
        if let Err(error) = check_integrity(item, &transferred) {
            remove_quietly(&temp).await;
            return Err(error);
        }

        // 5. commit
        if let Err(source) = tokio::fs::rename(&temp, &item.destination).await {
            remove_quietly(&temp).await;
            return Err(FetchError::io(&item.destination, source));
        }
        debug!("Committed {:?}", item.destination);

        // 6. post-processing
        if let Some(post) = item.wants_extraction() {
            let target = item.extract_dir(post);
            self.extractor
                .extract(&item.destination, &target, &post.exclude)
                .await
                .map_err(|error| FetchError::Extraction {
                    path: item.destination.clone(),
                    message: error.to_string(),
                })?;
            debug!("Extracted {:?} into {:?}", item.destination, target);

            if post.delete_source_after_extract {
                tokio::fs::remove_file(&item.destination)
                    .await
                    .map_err(|source| FetchError::io(&item.destination, source))?;
            }
        }

        Ok(Step::Completed(transferred.size))
    }

    async fn transfer_with_retry(
        &self,
        index: usize,
        item: &FetchInstruction,
        temp: &Path,
        attempts: &mut u32,
    ) -> FetchResult<Transferred> {
        let max_attempts = self.config.max_attempts();
        loop {
            *attempts += 1;
            // Outside the select: an aborted create can still land after cleanup.
            let file = tokio::fs::File::create(temp)
                .await
                .map_err(|source| FetchError::io(temp, source))?;
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(FetchError::Cancelled),
                result = self.transfer(index, item, temp, file) => result,
            };

            let error = match result {
                Ok(transferred) => return Ok(transferred),
                Err(error) => error,
            };
            remove_quietly(temp).await;

            if !error.is_retryable() || *attempts >= max_attempts {
                return Err(error);
            }

            let delay = self.config.retry_delay(*attempts);
            warn!(
                "Attempt {}/{} failed: {}; retrying in {:?}",
                *attempts, max_attempts, error, delay
            );
            self.tracker.record_retry();
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One network attempt: stream the body into `file` (open at `temp`), hashing as it goes.
    async fn transfer(
        &self,
        index: usize,
        item: &FetchInstruction,
        temp: &Path,
        file: tokio::fs::File,
    ) -> FetchResult<Transferred> {
        let response = self.client.get(&item.source_url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::DownloadFailed {
                url: item.source_url.clone(),
                status: status.as_u16(),
            });
        }

        let mut hasher = item
            .expected_digest
            .as_ref()
            .map(|expected| Hasher::new(expected.algorithm));

        // Write inside a block so the handle is dropped before the rename
        let written = {
            let mut writer = BufWriter::new(file);
            let mut stream = response.bytes_stream();
            let mut written = 0_u64;

            while let Some(chunk) = stream.next().await {
                if self.cancel.is_cancelled() {
                    return Err(FetchError::Cancelled);
                }
                let chunk = chunk?;
                written = written.saturating_add(chunk.len() as u64);
                if let Some(expected) = item.expected_size {
                    if written > expected {
                        return Err(FetchError::SizeMismatch {
                            path: item.destination.clone(),
                            expected,
                            actual: written,
                        });
                    }
                }

                writer
                    .write_all(&chunk)
                    .await
                    .map_err(|source| FetchError::io(temp, source))?;
                if let Some(hasher) = hasher.as_mut() {
                    hasher.update(&chunk);
                }
                self.tracker.advance(index, written);
            }

            writer
                .flush()
                .await
                .map_err(|source| FetchError::io(temp, source))?;
            written
        };

        Ok(Transferred {
            size: written,
            digest: hasher.map(Hasher::finalize_hex),
        })
    }
}

enum Step {
    Skipped(u64),
    Completed(u64),
}

fn check_integrity(item: &FetchInstruction, transferred: &Transferred) -> FetchResult<()> {
    if let Some(expected) = item.expected_size {
        if transferred.size != expected {
            return Err(FetchError::SizeMismatch {
                path: item.destination.clone(),
                expected,
                actual: transferred.size,
            });
        }
    }

    if let (Some(expected), Some(actual)) = (&item.expected_digest, &transferred.digest) {
        if !expected.matches(actual) {
            return Err(FetchError::ChecksumMismatch {
                path: item.destination.clone(),
                algorithm: expected.algorithm,
                expected: expected.hex.clone(),
                actual: actual.clone(),
            });
        }
    }

    Ok(())
}

/// Hidden sibling of `destination`, so the final rename stays on one filesystem.
pub(crate) fn temp_path_for(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    let temp_name = format!(".{}.{}.part", name, Uuid::new_v4().simple());
    match destination.parent() {
        Some(parent) => parent.join(temp_name),
        None => PathBuf::from(temp_name),
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove temp file {:?}: {}", path, error);
        }
    }
}
