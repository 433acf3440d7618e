pub mod core;

use tracing_subscriber::EnvFilter;

pub use crate::core::config::DownloadConfig;
pub use crate::core::downloader::{
    ArchiveExtractor, BatchHandle, BatchResult, BatchState, DigestAlgorithm, Downloader,
    ExpectedDigest, FetchInstruction, FetchOutcome, GroupSummary, ItemReport, PostProcessing,
    ZipExtractor,
};
pub use crate::core::error::{FailureKind, FailureReason, FetchError, FetchResult};
pub use crate::core::http::build_http_client;

/// Install a formatted `tracing` subscriber filtered by `RUST_LOG`.
///
/// Falls back to `info,interface_fetch=debug`. Does nothing if a global subscriber
/// is already set.
pub fn init_tracing() {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,interface_fetch=debug")),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("interface-fetch logging initialised");
    }
}
