//! Batch scenarios against a mock HTTP server.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::extract::zip_bytes;
use super::*;
use crate::core::config::DownloadConfig;
use crate::core::error::{FailureKind, FetchError, FetchResult};

const MB: usize = 1024 * 1024;

fn test_config() -> DownloadConfig {
    DownloadConfig {
        max_attempts: 3,
        retry_base_delay: Duration::from_millis(5),
        retry_max_delay: Duration::from_millis(20),
        attempt_timeout: Duration::from_secs(10),
        progress_interval: Duration::from_millis(20),
        check_disk_space: false,
        ..DownloadConfig::default()
    }
}

fn downloader() -> Downloader {
    Downloader::new(test_config()).unwrap()
}

fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

fn body(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

async fn serve(server: &MockServer, route: &str, data: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(data))
        .mount(server)
        .await;
}

async fn serve_delayed(server: &MockServer, route: &str, data: Vec<u8>, delay: Duration) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(data)
                .set_delay(delay),
        )
        .mount(server)
        .await;
}

/// Plain HTTP server that sends the headers and `sent` of `declared` body bytes,
/// then stalls with the connection open.
async fn stalling_server(declared: usize, sent: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = [0_u8; 4096];
                let _ = socket.read(&mut request).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {declared}\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                );
                if socket.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                let _ = socket.write_all(&vec![7_u8; sent]).await;
                let _ = socket.flush().await;
                tokio::time::sleep(Duration::from_secs(30)).await;
            });
        }
    });
    format!("http://{addr}")
}

fn verified(server: &MockServer, route: &str, dest: PathBuf, data: &[u8]) -> FetchInstruction {
    FetchInstruction::new(format!("{}{}", server.uri(), route), dest)
        .with_sha1(sha1_hex(data))
        .with_size(data.len() as u64)
}

fn part_files(dir: &Path) -> Vec<PathBuf> {
    walk(dir)
        .into_iter()
        .filter(|p| p.extension().map_or(false, |ext| ext == "part"))
        .collect()
}

fn walk(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                out.extend(walk(&path));
            } else {
                out.push(path);
            }
        }
    }
    out
}

fn temp_root() -> TempDir {
    tempfile::tempdir().unwrap()
}

#[tokio::test]
async fn three_items_complete_under_concurrency_two() {
    let server = MockServer::start().await;
    let dir = temp_root();
    let sizes = [10 * MB, 5 * MB, MB];
    let mut items = Vec::new();
    let mut bodies = Vec::new();
    for (i, size) in sizes.iter().enumerate() {
        let data = body(*size, i as u8);
        let route = format!("/libraries/lib-{i}.jar");
        serve(&server, &route, data.clone()).await;
        items.push(
            verified(&server, &route, dir.path().join(format!("libraries/lib-{i}.jar")), &data)
                .with_group("libraries"),
        );
        bodies.push(data);
    }

    let result = downloader().run(items, 2).await.unwrap();

    assert!(result.outcomes().all(FetchOutcome::is_completed));
    assert_eq!(result.state.completed_items, 3);
    assert_eq!(result.state.failed_items, 0);
    assert_eq!(result.state.downloaded_bytes, (16 * MB) as u64);
    assert_eq!(result.state.total_bytes, (16 * MB) as u64);
    assert!(result.peak_active_workers <= 2);
    for (i, data) in bodies.iter().enumerate() {
        let written = std::fs::read(dir.path().join(format!("libraries/lib-{i}.jar"))).unwrap();
        assert_eq!(&written, data);
    }
    assert!(part_files(dir.path()).is_empty());
}

#[tokio::test]
async fn server_error_exhausts_retries_without_failing_siblings() {
    let server = MockServer::start().await;
    let dir = temp_root();
    Mock::given(method("GET"))
        .and(path("/broken.jar"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;
    let good = body(4096, 7);
    serve(&server, "/good.jar", good.clone()).await;

    let items = vec![
        FetchInstruction::new(format!("{}/broken.jar", server.uri()), dir.path().join("broken.jar")),
        verified(&server, "/good.jar", dir.path().join("good.jar"), &good),
    ];
    let result = downloader().run(items, 2).await.unwrap();

    let broken = &result.items[0];
    assert_eq!(broken.outcome.failure_kind(), Some(FailureKind::TransientNetwork));
    assert_eq!(broken.attempts, 3);
    assert!(result.items[1].outcome.is_completed());
    assert_eq!(result.retries, 2);
    assert_eq!(result.state.failed_items, 1);
    assert!(!dir.path().join("broken.jar").exists());
}

#[tokio::test]
async fn short_body_is_a_size_mismatch_and_is_not_retried() {
    let server = MockServer::start().await;
    let dir = temp_root();
    Mock::given(method("GET"))
        .and(path("/truncated.jar"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1_u8; 80]))
        .expect(1)
        .mount(&server)
        .await;

    let dest = dir.path().join("truncated.jar");
    std::fs::write(&dest, b"old").unwrap();

    let item = FetchInstruction::new(format!("{}/truncated.jar", server.uri()), dest.clone())
        .with_size(100);
    let result = downloader().run(vec![item], 1).await.unwrap();

    assert_eq!(
        result.items[0].outcome.failure_kind(),
        Some(FailureKind::SizeMismatch)
    );
    assert_eq!(result.items[0].attempts, 1);
    assert_eq!(std::fs::read(&dest).unwrap(), b"old");
    assert!(part_files(dir.path()).is_empty());
}

#[tokio::test]
async fn oversized_body_aborts_as_size_mismatch() {
    let server = MockServer::start().await;
    let dir = temp_root();
    serve(&server, "/big.jar", vec![0_u8; 4096]).await;

    let item = FetchInstruction::new(format!("{}/big.jar", server.uri()), dir.path().join("big.jar"))
        .with_size(100);
    let result = downloader().run(vec![item], 1).await.unwrap();

    assert_eq!(
        result.items[0].outcome.failure_kind(),
        Some(FailureKind::SizeMismatch)
    );
    assert!(!dir.path().join("big.jar").exists());
}

#[tokio::test]
async fn checksum_mismatch_never_completes() {
    let server = MockServer::start().await;
    let dir = temp_root();
    Mock::given(method("GET"))
        .and(path("/tampered.jar"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let dest = dir.path().join("mods/tampered.jar");
    let item = FetchInstruction::new(format!("{}/tampered.jar", server.uri()), dest.clone())
        .with_sha1(sha1_hex(b"original"));
    let result = downloader().run(vec![item], 1).await.unwrap();

    assert_eq!(
        result.items[0].outcome.failure_kind(),
        Some(FailureKind::ChecksumMismatch)
    );
    assert!(!dest.exists());
    assert!(part_files(dir.path()).is_empty());
}

#[tokio::test]
async fn duplicate_destinations_reject_the_batch_before_any_request() {
    let server = MockServer::start().await;
    let dir = temp_root();
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dest = dir.path().join("assets/objects/ab/abcdef");
    let items = vec![
        FetchInstruction::new(format!("{}/a", server.uri()), dest.clone()),
        FetchInstruction::new(format!("{}/b", server.uri()), dest),
    ];

    let err = downloader().submit_batch(items, 2).err().unwrap();
    assert!(matches!(err, FetchError::DuplicateDestination(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn zero_concurrency_is_rejected() {
    let dir = temp_root();
    let item = FetchInstruction::new("https://cdn.example.com/a.jar", dir.path().join("a.jar"));
    let err = downloader().run(vec![item], 0).await.unwrap_err();
    assert!(matches!(err, FetchError::InvalidConcurrency(0)));
}

#[tokio::test]
async fn empty_batch_settles_immediately() {
    let result = downloader().run(Vec::new(), 4).await.unwrap();
    assert!(result.items.is_empty());
    assert!(result.state.is_settled());
    assert!(result.is_complete_success());
}

#[tokio::test]
async fn second_run_skips_everything_without_network() {
    let server = MockServer::start().await;
    let dir = temp_root();
    let mut items = Vec::new();
    for i in 0..3 {
        let data = body(2048 + i, i as u8);
        let route = format!("/assets/{i}");
        serve(&server, &route, data.clone()).await;
        items.push(verified(&server, &route, dir.path().join(format!("assets/{i}")), &data));
    }
    let downloader = downloader();

    let first = downloader.run(items.clone(), 2).await.unwrap();
    assert!(first.outcomes().all(FetchOutcome::is_completed));
    let requests_after_first = server.received_requests().await.unwrap().len();
    assert_eq!(requests_after_first, 3);

    let second = downloader.run(items, 2).await.unwrap();
    assert!(second.outcomes().all(FetchOutcome::is_skipped));
    assert_eq!(second.state.skipped_items, 3);
    assert_eq!(second.state.downloaded_bytes, second.state.total_bytes);
    assert!(second.items.iter().all(|item| item.attempts == 0));
    assert_eq!(server.received_requests().await.unwrap().len(), requests_after_first);
}

#[tokio::test]
async fn stale_file_on_disk_is_replaced() {
    let server = MockServer::start().await;
    let dir = temp_root();
    let data = body(1000, 3);
    serve(&server, "/client.jar", data.clone()).await;

    let dest = dir.path().join("client.jar");
    std::fs::write(&dest, b"stale").unwrap();

    let result = downloader()
        .run(vec![verified(&server, "/client.jar", dest.clone(), &data)], 1)
        .await
        .unwrap();

    assert!(result.items[0].outcome.is_completed());
    assert_eq!(std::fs::read(&dest).unwrap(), data);
}

#[tokio::test]
async fn unknown_sizes_fold_into_total_on_completion() {
    let server = MockServer::start().await;
    let dir = temp_root();
    let data = body(3000, 9);
    serve(&server, "/mods/unsized.jar", data.clone()).await;

    let item = FetchInstruction::new(
        format!("{}/mods/unsized.jar", server.uri()),
        dir.path().join("mods/unsized.jar"),
    );
    let result = downloader().run(vec![item], 1).await.unwrap();

    assert_eq!(result.items[0].outcome, FetchOutcome::Completed { bytes: 3000 });
    assert_eq!(result.state.total_bytes, 3000);
    assert_eq!(result.state.downloaded_bytes, 3000);
}

#[tokio::test]
async fn concurrency_limit_is_never_exceeded() {
    let server = MockServer::start().await;
    let dir = temp_root();
    let mut items = Vec::new();
    for i in 0..8 {
        let data = body(512, i as u8);
        let route = format!("/mods/{i}.jar");
        serve_delayed(&server, &route, data.clone(), Duration::from_millis(80)).await;
        items.push(verified(&server, &route, dir.path().join(format!("mods/{i}.jar")), &data));
    }

    let handle = downloader().submit_batch(items, 3).unwrap();
    let mut progress = handle.subscribe();
    let watcher = tokio::spawn(async move {
        let mut max_active = 0;
        while progress.changed().await.is_ok() {
            max_active = max_active.max(progress.borrow_and_update().active_workers);
        }
        max_active
    });

    let result = handle.wait().await.unwrap();
    let observed = watcher.await.unwrap();

    assert!(result.outcomes().all(FetchOutcome::is_completed));
    assert!(result.peak_active_workers <= 3);
    assert!(result.peak_active_workers >= 1);
    assert!(observed <= 3);
}

#[tokio::test]
async fn progress_snapshots_never_go_backwards() {
    let server = MockServer::start().await;
    let dir = temp_root();
    let mut items = Vec::new();
    for i in 0..6 {
        let data = body(256 * 1024, i as u8);
        let route = format!("/assets/{i}");
        serve_delayed(&server, &route, data.clone(), Duration::from_millis(30 * i as u64)).await;
        items.push(verified(&server, &route, dir.path().join(format!("assets/{i}")), &data));
    }

    let handle = downloader().submit_batch(items, 2).unwrap();
    let mut progress = handle.subscribe();
    let collector = tokio::spawn(async move {
        let mut seen = vec![progress.borrow_and_update().clone()];
        while progress.changed().await.is_ok() {
            seen.push(progress.borrow_and_update().clone());
        }
        seen
    });

    let result = handle.wait().await.unwrap();
    let snapshots = collector.await.unwrap();

    assert!(snapshots.len() >= 2);
    for pair in snapshots.windows(2) {
        assert!(pair[1].downloaded_bytes >= pair[0].downloaded_bytes);
        assert!(pair[1].settled_items() >= pair[0].settled_items());
        assert!(pair[1].settled_items() <= pair[1].total_items);
    }
    let last = snapshots.last().unwrap();
    assert!(last.is_settled());
    assert_eq!(last, &result.state);
    assert_eq!(result.state.downloaded_bytes, 6 * 256 * 1024);
}

#[tokio::test]
async fn cancellation_before_response_leaves_nothing() {
    let server = MockServer::start().await;
    let dir = temp_root();
    let mut items = Vec::new();
    for i in 0..5 {
        let data = body(64 * 1024, i as u8);
        let route = format!("/slow/{i}");
        serve_delayed(&server, &route, data.clone(), Duration::from_secs(5)).await;
        items.push(verified(&server, &route, dir.path().join(format!("slow/{i}.jar")), &data));
    }
    let destinations: Vec<PathBuf> = items.iter().map(|i| i.destination.clone()).collect();

    let handle = downloader().submit_batch(items, 2).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    handle.cancel();
    assert!(handle.is_cancelled());

    let result = tokio::time::timeout(Duration::from_secs(3), handle.wait())
        .await
        .expect("cancelled batch settles promptly")
        .unwrap();

    assert!(result.state.cancelled);
    assert!(result.state.is_settled());
    assert!(result
        .outcomes()
        .all(|o| o.failure_kind() == Some(FailureKind::Cancelled)));
    for dest in destinations {
        assert!(!dest.exists(), "{dest:?} must not exist");
    }
    assert!(part_files(dir.path()).is_empty());
}

#[tokio::test]
async fn archive_is_extracted_and_removed() {
    let server = MockServer::start().await;
    let dir = temp_root();
    let archive = zip_bytes(&[
        ("overrides/config/sodium.json", b"{}"),
        ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0"),
    ]);
    serve(&server, "/pack.zip", archive.clone()).await;

    let dest = dir.path().join("downloads/pack.zip");
    let target = dir.path().join("instance");
    let item = verified(&server, "/pack.zip", dest.clone(), &archive)
        .with_group("modpacks")
        .with_post_processing(PostProcessing {
            extract: true,
            extract_target: Some(target.clone()),
            delete_source_after_extract: true,
            exclude: vec!["META-INF/".to_string()],
        });

    let result = downloader().run(vec![item], 1).await.unwrap();

    assert!(result.items[0].outcome.is_completed());
    assert!(target.join("overrides/config/sodium.json").is_file());
    assert!(!target.join("META-INF").exists());
    assert!(!dest.exists());
}

#[tokio::test]
async fn extraction_failure_is_reported_after_commit() {
    let server = MockServer::start().await;
    let dir = temp_root();
    let data = b"definitely not a zip".to_vec();
    serve(&server, "/natives.jar", data.clone()).await;

    let dest = dir.path().join("natives.jar");
    let item = verified(&server, "/natives.jar", dest.clone(), &data).extract_to(None, true);
    let result = downloader().run(vec![item], 1).await.unwrap();

    assert_eq!(
        result.items[0].outcome.failure_kind(),
        Some(FailureKind::Extraction)
    );
    assert_eq!(result.items[0].attempts, 1);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
}

#[derive(Default, Clone)]
struct RecordingExtractor {
    calls: Arc<Mutex<Vec<(PathBuf, PathBuf, Vec<String>)>>>,
}

#[async_trait]
impl ArchiveExtractor for RecordingExtractor {
    async fn extract(
        &self,
        archive: &Path,
        target: &Path,
        exclude: &[String],
    ) -> FetchResult<usize> {
        self.calls
            .lock()
            .unwrap()
            .push((archive.to_path_buf(), target.to_path_buf(), exclude.to_vec()));
        Ok(0)
    }
}

#[tokio::test]
async fn injected_extractor_receives_defaults() {
    let server = MockServer::start().await;
    let dir = temp_root();
    let data = body(100, 1);
    serve(&server, "/lwjgl-natives.jar", data.clone()).await;

    let extractor = RecordingExtractor::default();
    let downloader = downloader().with_extractor(extractor.clone());
    let dest = dir.path().join("libraries/lwjgl-natives.jar");
    let item = verified(&server, "/lwjgl-natives.jar", dest.clone(), &data).with_post_processing(
        PostProcessing {
            extract: true,
            exclude: vec!["META-INF/".to_string()],
            ..PostProcessing::default()
        },
    );

    let result = downloader.run(vec![item], 1).await.unwrap();

    assert!(result.items[0].outcome.is_completed());
    let calls = extractor.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, dest);
    assert_eq!(calls[0].1, dir.path().join("libraries"));
    assert_eq!(calls[0].2, vec!["META-INF/".to_string()]);
    assert!(dest.exists());
}

#[tokio::test]
async fn cancellation_mid_stream_removes_partial_file() {
    let base = stalling_server(1_000_000, 50_000).await;
    let dir = temp_root();
    let dest = dir.path().join("libraries/big.jar");
    let item = FetchInstruction::new(format!("{base}/big.jar"), dest.clone()).with_size(1_000_000);

    let handle = downloader().submit_batch(vec![item], 1).unwrap();
    let mut progress = handle.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        progress.wait_for(|state| state.downloaded_bytes > 0),
    )
    .await
    .expect("body starts streaming")
    .unwrap();
    assert_eq!(part_files(dir.path()).len(), 1);

    handle.cancel();
    let result = tokio::time::timeout(Duration::from_secs(3), handle.wait())
        .await
        .expect("cancelled batch settles promptly")
        .unwrap();

    assert_eq!(
        result.items[0].outcome.failure_kind(),
        Some(FailureKind::Cancelled)
    );
    assert_eq!(result.items[0].attempts, 1);
    assert!(result.state.downloaded_bytes > 0);
    assert!(part_files(dir.path()).is_empty());
    assert!(!dest.exists());
}

#[tokio::test]
async fn attempt_timeout_is_retried_as_transient() {
    let server = MockServer::start().await;
    let dir = temp_root();
    Mock::given(method("GET"))
        .and(path("/slow.jar"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .expect(3)
        .mount(&server)
        .await;

    let config = DownloadConfig {
        attempt_timeout: Duration::from_millis(100),
        ..test_config()
    };
    let item = FetchInstruction::new(
        format!("{}/slow.jar", server.uri()),
        dir.path().join("slow.jar"),
    );
    let result = Downloader::new(config)
        .unwrap()
        .run(vec![item], 1)
        .await
        .unwrap();

    assert_eq!(
        result.items[0].outcome.failure_kind(),
        Some(FailureKind::TransientNetwork)
    );
    assert_eq!(result.items[0].attempts, 3);
    assert_eq!(result.retries, 2);
    assert!(part_files(dir.path()).is_empty());
}

#[tokio::test]
async fn transient_failure_then_success_completes() {
    let server = MockServer::start().await;
    let dir = temp_root();
    let data = body(2048, 5);
    Mock::given(method("GET"))
        .and(path("/flaky.jar"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    serve(&server, "/flaky.jar", data.clone()).await;

    let dest = dir.path().join("flaky.jar");
    let result = downloader()
        .run(vec![verified(&server, "/flaky.jar", dest.clone(), &data)], 1)
        .await
        .unwrap();

    assert!(result.items[0].outcome.is_completed());
    assert_eq!(result.items[0].attempts, 2);
    assert_eq!(result.retries, 1);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
}

#[tokio::test]
async fn unsupported_scheme_is_rejected_before_any_transfer() {
    let dir = temp_root();
    let item = FetchInstruction::new("ftp://cdn.example.com/a.jar", dir.path().join("a.jar"));
    let err = downloader().submit_batch(vec![item], 1).err().unwrap();
    assert!(matches!(err, FetchError::InvalidInstruction { index: 0, .. }));
}

#[tokio::test]
async fn huge_declared_sizes_do_not_overflow() {
    let server = MockServer::start().await;
    let dir = temp_root();
    serve(&server, "/a.jar", vec![1_u8; 16]).await;
    serve(&server, "/b.jar", vec![2_u8; 16]).await;

    let half = u64::MAX / 2 + 1;
    let items = vec![
        FetchInstruction::new(format!("{}/a.jar", server.uri()), dir.path().join("a.jar"))
            .with_size(half),
        FetchInstruction::new(format!("{}/b.jar", server.uri()), dir.path().join("b.jar"))
            .with_size(half),
    ];
    let result = downloader().run(items, 1).await.unwrap();

    assert_eq!(result.state.total_bytes, u64::MAX);
    assert!(result
        .outcomes()
        .all(|o| o.failure_kind() == Some(FailureKind::SizeMismatch)));
}
