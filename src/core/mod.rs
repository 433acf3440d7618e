// ─── InterfaceOficial Fetch Core ───
// Content acquisition for the launcher: client jars, libraries, assets, mods.
//
// Architecture:
//   core/
//     config.rs    DownloadConfig (defaults, clamping, JSON settings file)
//     error.rs     FetchError + failure taxonomy shared by every stage
//     http.rs      reqwest client builder
//     downloader/  Batch controller, worker pool, fetch worker, progress,
//                  checksum verifier and archive extractor

pub mod config;
pub mod downloader;
pub mod error;
pub mod http;
