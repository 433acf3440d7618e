use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::downloader::verify::DigestAlgorithm;

/// Central error type for the content acquisition pipeline.
/// Every module returns `Result<T, FetchError>`.
#[derive(Debug, Error)]
pub enum FetchError {
    // ── IO ──────────────────────────────────────────────
    #[error("IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    // ── Network ─────────────────────────────────────────
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Download failed for {url}: HTTP {status}")]
    DownloadFailed { url: String, status: u16 },

    // ── Integrity ───────────────────────────────────────
    #[error("Size mismatch for {path:?}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("{algorithm} mismatch for {path:?}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        algorithm: DigestAlgorithm,
        expected: String,
        actual: String,
    },

    // ── Archive ─────────────────────────────────────────
    #[error("Zip extraction error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Extraction of {path:?} failed: {message}")]
    Extraction { path: PathBuf, message: String },

    // ── Batch validation ────────────────────────────────
    #[error("Duplicate destination in batch: {0:?}")]
    DuplicateDestination(PathBuf),

    #[error("Invalid concurrency limit: {0}")]
    InvalidConcurrency(usize),

    #[error("Invalid instruction #{index}: {message}")]
    InvalidInstruction { index: usize, message: String },

    #[error("Not enough disk space at {path:?}: available={available} required={required}")]
    InsufficientDiskSpace {
        path: PathBuf,
        available: u64,
        required: u64,
    },

    // ── Control ─────────────────────────────────────────
    #[error("Cancelled")]
    Cancelled,

    // ── JSON ────────────────────────────────────────────
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ── Generic ─────────────────────────────────────────
    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the crate.
pub type FetchResult<T> = Result<T, FetchError>;

/// Failure classes reported per item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransientNetwork,
    SizeMismatch,
    ChecksumMismatch,
    Extraction,
    Filesystem,
    Cancelled,
    Internal,
}

/// Cloneable, serializable form of a per-item error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

impl FetchError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FetchError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            // A request reqwest refuses to build fails the same way every time.
            FetchError::Http(e) if e.is_builder() => FailureKind::Internal,
            FetchError::Http(_) | FetchError::DownloadFailed { .. } => FailureKind::TransientNetwork,
            FetchError::SizeMismatch { .. } => FailureKind::SizeMismatch,
            FetchError::ChecksumMismatch { .. } => FailureKind::ChecksumMismatch,
            FetchError::Zip(_) | FetchError::Extraction { .. } => FailureKind::Extraction,
            FetchError::Io { .. } | FetchError::InsufficientDiskSpace { .. } => {
                FailureKind::Filesystem
            }
            FetchError::Cancelled => FailureKind::Cancelled,
            FetchError::DuplicateDestination(_)
            | FetchError::InvalidConcurrency(_)
            | FetchError::InvalidInstruction { .. }
            | FetchError::Json(_)
            | FetchError::Other(_) => FailureKind::Internal,
        }
    }

    /// Only transient network failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind() == FailureKind::TransientNetwork
    }

    pub fn to_reason(&self) -> FailureReason {
        FailureReason {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(source: std::io::Error) -> Self {
        FetchError::Io {
            path: PathBuf::new(),
            source,
        }
    }
}

// ── Serialization for IPC consumers ─────────────────────
impl serde::Serialize for FetchError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
