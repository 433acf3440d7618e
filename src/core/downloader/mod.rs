//! Content acquisition pipeline: fetch a flat batch of files, verify each against its
//! expected size/digest, commit atomically, optionally unpack, and report progress.
//!
//!   batch     : `Downloader` (batch controller), `BatchHandle`, `BatchResult`
//!   scheduler : fixed worker pool over a shared FIFO queue
//!   worker    : per-item fast path, transfer, retry, commit, post-processing
//!   progress  : lock-free counters + cadence-driven `BatchState` snapshots
//!   verify    : streaming digests
//!   extract   : archive extraction

pub mod batch;
pub mod extract;
pub mod instruction;
pub mod progress;
mod scheduler;
pub mod verify;
mod worker;

#[cfg(test)]
mod tests;

pub use batch::{BatchHandle, BatchResult, Downloader, GroupSummary};
pub use extract::{ArchiveExtractor, ZipExtractor};
pub use instruction::{FetchInstruction, FetchOutcome, ItemReport, PostProcessing};
pub use progress::BatchState;
pub use verify::{DigestAlgorithm, ExpectedDigest};
