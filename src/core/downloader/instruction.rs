use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::error::{FailureKind, FailureReason};

use super::verify::ExpectedDigest;

/// A single file to fetch, verify and optionally unpack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchInstruction {
    pub source_url: String,
    /// Absolute local path the verified bytes are committed to.
    pub destination: PathBuf,
    /// Reporting label only ("libraries", "assets", "mods" …).
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub expected_digest: Option<ExpectedDigest>,
    #[serde(default)]
    pub expected_size: Option<u64>,
    #[serde(default)]
    pub post_processing: Option<PostProcessing>,
}

/// What to do with a committed file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessing {
    pub extract: bool,
    /// Defaults to the destination's directory.
    pub extract_target: Option<PathBuf>,
    pub delete_source_after_extract: bool,
    /// Entry-name prefixes left out of the extraction (e.g. `META-INF/`).
    pub exclude: Vec<String>,
}

impl FetchInstruction {
    pub fn new(source_url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source_url: source_url.into(),
            destination: destination.into(),
            group: String::new(),
            expected_digest: None,
            expected_size: None,
            post_processing: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_digest(mut self, digest: ExpectedDigest) -> Self {
        self.expected_digest = Some(digest);
        self
    }

    pub fn with_sha1(self, hex: impl Into<String>) -> Self {
        self.with_digest(ExpectedDigest::sha1(hex))
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn with_post_processing(mut self, post: PostProcessing) -> Self {
        self.post_processing = Some(post);
        self
    }

    /// Unpack into `target` (or next to the archive when `None`).
    pub fn extract_to(self, target: Option<PathBuf>, delete_source: bool) -> Self {
        self.with_post_processing(PostProcessing {
            extract: true,
            extract_target: target,
            delete_source_after_extract: delete_source,
            exclude: Vec::new(),
        })
    }

    pub fn file_name(&self) -> String {
        self.destination
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub(crate) fn wants_extraction(&self) -> Option<&PostProcessing> {
        self.post_processing.as_ref().filter(|post| post.extract)
    }

    pub(crate) fn extract_dir(&self, post: &PostProcessing) -> PathBuf {
        post.extract_target.clone().unwrap_or_else(|| {
            self.destination
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default()
        })
    }
}

/// Terminal state of one instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchOutcome {
    Completed { bytes: u64 },
    /// Destination already held valid content; nothing was transferred.
    Skipped { bytes: u64 },
    Failed { reason: FailureReason },
}

impl FetchOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, FetchOutcome::Completed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, FetchOutcome::Skipped { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, FetchOutcome::Failed { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            FetchOutcome::Failed { reason } => Some(reason.kind),
            _ => None,
        }
    }

    pub(crate) fn cancelled() -> Self {
        FetchOutcome::Failed {
            reason: FailureReason {
                kind: FailureKind::Cancelled,
                message: "Cancelled".to_string(),
            },
        }
    }
}

/// Outcome of one instruction, reported in submission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemReport {
    pub index: usize,
    pub instruction: FetchInstruction,
    pub outcome: FetchOutcome,
    /// Network attempts made (0 for skipped or never-started items).
    pub attempts: u32,
}
