mod support;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use filetime::FileTime;

use stream_cache_proxy::engine::active::{ActiveDownloads, DownloadState, ProgressReceiver};
use stream_cache_proxy::engine::downloader::{DownloadTicket, Downloader};
use stream_cache_proxy::engine::evictor::Evictor;
use stream_cache_proxy::engine::stats::StatsCollector;
use stream_cache_proxy::engine::store::CacheStore;
use stream_cache_proxy::error::CacheError;
use stream_cache_proxy::source::traits::ObjectMeta;

use support::FakeSource;

struct Harness {
    downloader: Arc<Downloader>,
    store: CacheStore,
    active: ActiveDownloads,
    stats: Arc<StatsCollector>,
}

fn harness(source: Arc<FakeSource>, dir: &std::path::Path) -> Harness {
    let store = CacheStore::new(dir).unwrap();
    let active = ActiveDownloads::new();
    let stats = Arc::new(StatsCollector::new());
    let evictor = Arc::new(Evictor::new(
        store.clone(),
        active.clone(),
        1024 * 1024,
        stats.clone(),
    ));
    let downloader = Arc::new(Downloader::new(
        source,
        store.clone(),
        active.clone(),
        evictor,
        stats.clone(),
    ));
    Harness {
        downloader,
        store,
        active,
        stats,
    }
}

impl Harness {
    async fn start(&self, id: &str, size: u64) -> (ProgressReceiver, bool) {
        let ticket = self.downloader.ensure_downloading(id, &meta(size)).await.unwrap();
        in_flight(ticket)
    }
}

fn meta(size: u64) -> ObjectMeta {
    ObjectMeta {
        size,
        content_type: "video/mp4".to_string(),
    }
}

/// Wait for the download behind `progress` to leave the downloading state.
async fn finished(mut progress: ProgressReceiver) -> DownloadState {
    let state = tokio::time::timeout(
        Duration::from_secs(5),
        progress.wait_for(|p| p.state != DownloadState::Downloading),
    )
    .await
    .expect("download did not finish")
    .expect("progress sender dropped")
    .state;
    state
}

fn in_flight(ticket: DownloadTicket) -> (ProgressReceiver, bool) {
    match ticket {
        DownloadTicket::InFlight { progress, started } => (progress, started),
        DownloadTicket::Complete => panic!("expected an in-flight download"),
    }
}

#[tokio::test]
async fn test_concurrent_requests_share_one_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeSource::gated(10));
    source.insert("movie", support::content(100));
    let h = harness(source.clone(), dir.path());

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let downloader = h.downloader.clone();
        tasks.push(tokio::spawn(async move {
            downloader.ensure_downloading("movie", &meta(100)).await
        }));
    }
    let mut receivers = Vec::new();
    let mut started = 0;
    for task in tasks {
        let (progress, was_started) = in_flight(task.await.unwrap().unwrap());
        if was_started {
            started += 1;
        }
        receivers.push(progress);
    }
    assert_eq!(started, 1);
    assert!(h.active.contains("movie"));

    source.release(100);
    for progress in receivers {
        assert_eq!(finished(progress).await, DownloadState::Complete);
    }
    assert_eq!(source.fetches(), 1);
    assert!(!h.active.contains("movie"));
    assert_eq!(
        std::fs::read(h.store.path_for("movie")).unwrap(),
        support::content(100)
    );
    assert_eq!(h.stats.snapshot(0).downloads_completed, 1);
}

#[tokio::test]
async fn test_complete_object_is_not_refetched() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeSource::new(7));
    source.insert("clip", support::content(50));
    let h = harness(source.clone(), dir.path());

    let (progress, started) = h.start("clip", 50).await;
    assert!(started);
    assert_eq!(finished(progress).await, DownloadState::Complete);

    let long_ago = FileTime::from_unix_time(1000, 0);
    filetime::set_file_mtime(h.store.path_for("clip"), long_ago).unwrap();
    let ticket = h.downloader.ensure_downloading("clip", &meta(50)).await.unwrap();
    assert!(matches!(ticket, DownloadTicket::Complete));
    assert_eq!(source.fetches(), 1);

    let accessed = h.store.stat_object("clip").unwrap().unwrap().last_access;
    let secs = accessed.duration_since(UNIX_EPOCH).unwrap().as_secs();
    assert!(secs > 1000);
    assert!(accessed <= SystemTime::now() + Duration::from_secs(1));
}

#[tokio::test]
async fn test_failed_fetch_leaves_no_file_and_retry_starts_over() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeSource::new(10));
    source.insert("flaky", support::content(100));
    source.fail_after("flaky", 30);
    let h = harness(source.clone(), dir.path());

    let (progress, _) = h.start("flaky", 100).await;
    assert_eq!(finished(progress).await, DownloadState::Failed);
    assert!(h.store.stat_object("flaky").unwrap().is_none());
    assert!(!h.active.contains("flaky"));
    assert_eq!(h.stats.snapshot(0).downloads_failed, 1);

    source.clear_failure("flaky");
    let (progress, started) = h.start("flaky", 100).await;
    assert!(started);
    assert_eq!(finished(progress).await, DownloadState::Complete);
    assert_eq!(source.fetches(), 2);
    assert_eq!(
        std::fs::read(h.store.path_for("flaky")).unwrap(),
        support::content(100)
    );
}

#[tokio::test]
async fn test_short_stream_is_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeSource::new(16));
    source.insert("short", support::content(40));
    let h = harness(source.clone(), dir.path());

    // Declared bigger than what the remote delivers.
    let (progress, _) = h.start("short", 50).await;
    assert_eq!(finished(progress).await, DownloadState::Failed);
    assert!(h.store.stat_object("short").unwrap().is_none());
}

#[tokio::test]
async fn test_oversized_stream_is_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeSource::new(16));
    source.insert("long", support::content(40));
    let h = harness(source.clone(), dir.path());

    let (progress, _) = h.start("long", 30).await;
    assert_eq!(finished(progress).await, DownloadState::Failed);
    assert!(h.store.stat_object("long").unwrap().is_none());
    assert!(!h.active.contains("long"));
}

#[tokio::test]
async fn test_progress_follows_bytes_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeSource::gated(10));
    source.insert("slow", support::content(40));
    let h = harness(source.clone(), dir.path());

    let (mut progress, _) = h.start("slow", 40).await;
    source.release(2);
    let reached = progress.wait_for(|p| p.written >= 20);
    let written = tokio::time::timeout(Duration::from_secs(5), reached)
        .await
        .unwrap()
        .unwrap()
        .written;
    assert_eq!(written, 20);
    // Announced bytes are always readable.
    assert!(h.store.bytes_on_disk("slow").unwrap() >= 20);

    source.release(2);
    assert_eq!(finished(progress).await, DownloadState::Complete);
}

#[tokio::test]
async fn test_shutdown_cancels_and_refuses_new_fetches() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FakeSource::gated(10));
    source.insert("stuck", support::content(100));
    let h = harness(source.clone(), dir.path());

    let (progress, _) = h.start("stuck", 100).await;
    h.downloader.shutdown();
    assert_eq!(finished(progress).await, DownloadState::Failed);
    assert!(h.store.stat_object("stuck").unwrap().is_none());

    let err = h
        .downloader
        .ensure_downloading("stuck", &meta(100))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::RemoteUnavailable(_)));
}
