//! End-to-end runs of the downloader against an in-memory transport.

mod common;

use common::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;
use vodloader::downloader::{
    DownloadOptions, DownloadState, PlaylistSource, ProgressEvent, RetryPolicy, ThrottleRate,
    TrimWindow, VodDownloader,
};
use vodloader::utils::{TransportError, VodError};

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

fn master_source() -> PlaylistSource {
    PlaylistSource::Url(Url::parse(&url("master.m3u8")).expect("url"))
}

fn media_source(text: String) -> PlaylistSource {
    PlaylistSource::Inline {
        text,
        base_url: Some(Url::parse(&url("source/index-dvr.m3u8")).expect("url")),
    }
}

fn options(temp: &TempDir, playlist: PlaylistSource, output: &str) -> DownloadOptions {
    let mut options = DownloadOptions::new(playlist, temp.path().join("out").join(output));
    options.temp_dir = temp.path().join("scratch");
    options.retry = fast_retry();
    options
}

async fn run(
    options: DownloadOptions,
    transport: Arc<MockTransport>,
) -> (Result<std::path::PathBuf, VodError>, Vec<ProgressEvent>, DownloadState) {
    let downloader = VodDownloader::new(options, transport);
    let (tx, mut rx) = mpsc::channel(1024);
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });
    let result = downloader.download(tx, CancellationToken::new()).await;
    let events = collector.await.expect("collector");
    (result, events, downloader.state())
}

fn statuses(events: &[ProgressEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Status { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

// ============================================================
// FULL RUNS
// ============================================================

#[tokio::test]
async fn media_playlist_downloads_in_order() {
    let temp = TempDir::new().expect("temp dir");
    let transport = Arc::new(MockTransport::new());
    let parts = serve_rendition(&transport, "source", &[10.0, 10.0, 10.0, 4.5], 1);
    // Later segments finish first
    transport.set_delay(&url("source/0.ts"), Duration::from_millis(60));
    transport.set_delay(&url("source/1.ts"), Duration::from_millis(30));

    let opts = options(&temp, media_source(media_playlist(&[10.0, 10.0, 10.0, 4.5])), "video.mp4");
    let (result, events, state) = run(opts, transport.clone()).await;

    let path = result.expect("download succeeds");
    assert_eq!(path, temp.path().join("out").join("video.mp4"));
    assert_eq!(std::fs::read(&path).expect("output"), concat(&parts));
    assert!(matches!(state, DownloadState::Done(_)));
    assert_eq!(dir_entries(&temp.path().join("scratch")), 0);

    let statuses = statuses(&events);
    assert!(statuses.contains(&"Downloading 100% [2/4]".to_string()));
    assert!(statuses.contains(&"Combining Parts [3/4]".to_string()));
    assert!(statuses.contains(&"Finalizing Video [4/4]".to_string()));
}

#[tokio::test]
async fn percent_is_monotonic_within_each_stage() {
    let temp = TempDir::new().expect("temp dir");
    let transport = Arc::new(MockTransport::new());
    let durations = [2.0; 12];
    serve_rendition(&transport, "source", &durations, 0);

    let mut opts = options(&temp, media_source(media_playlist(&durations)), "video.ts");
    opts.concurrency = 5;
    let (result, events, _) = run(opts, transport).await;
    result.expect("download succeeds");

    let mut last = 0u8;
    for event in &events {
        match event {
            ProgressEvent::Status { same_line: false, .. } => last = 0,
            ProgressEvent::Percent(p) => {
                assert!(*p >= last, "percent went from {} to {}", last, p);
                assert!(*p <= 100);
                last = *p;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn every_completed_segment_reports_percent() {
    let temp = TempDir::new().expect("temp dir");
    let transport = Arc::new(MockTransport::new());
    let durations = [2.0; 300];
    serve_rendition(&transport, "source", &durations, 0);

    let mut opts = options(&temp, media_source(media_playlist(&durations)), "video.ts");
    opts.concurrency = 8;
    let (result, events, _) = run(opts, transport).await;
    result.expect("download succeeds");

    let start = events
        .iter()
        .position(|e| matches!(e, ProgressEvent::Status { message, .. } if message == "Downloading [2/4]"))
        .expect("download stage");
    let end = events
        .iter()
        .position(|e| matches!(e, ProgressEvent::Status { message, .. } if message == "Combining Parts [3/4]"))
        .expect("combine stage");

    let download_percents: Vec<u8> = events[start..end]
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Percent(p) => Some(*p),
            _ => None,
        })
        .collect();
    // Stage start reports 0, then one value per completed part
    assert!(download_percents.len() >= 300, "got {}", download_percents.len());
    assert!(download_percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(download_percents.last(), Some(&100));
}

#[tokio::test]
async fn master_playlist_selects_requested_rendition() {
    let temp = TempDir::new().expect("temp dir");
    let transport = Arc::new(MockTransport::new());
    transport.text(&url("master.m3u8"), MASTER);
    serve_rendition(&transport, "chunked", &[10.0, 10.0], 10);
    let parts = serve_rendition(&transport, "720p60", &[10.0, 10.0], 20);

    let mut opts = options(&temp, master_source(), "video");
    opts.quality = Some("720P60".to_string());
    let (result, _, state) = run(opts, transport.clone()).await;

    let path = result.expect("download succeeds");
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("mp4"));
    assert_eq!(std::fs::read(&path).expect("output"), concat(&parts));
    assert_eq!(transport.request_count(&url("chunked/0.ts")), 0);
    assert_eq!(transport.request_count(&url("720p60/0.ts")), 1);
    assert!(matches!(state, DownloadState::Done(_)));
}

#[tokio::test]
async fn master_playlist_defaults_to_best_quality() {
    let temp = TempDir::new().expect("temp dir");
    let transport = Arc::new(MockTransport::new());
    transport.text(&url("master.m3u8"), MASTER);
    let parts = serve_rendition(&transport, "chunked", &[6.0, 6.0], 30);

    let (result, _, _) = run(options(&temp, master_source(), "best.mp4"), transport).await;

    assert_eq!(
        std::fs::read(result.expect("download succeeds")).expect("output"),
        concat(&parts)
    );
}

#[tokio::test]
async fn audio_only_gets_m4a_extension() {
    let temp = TempDir::new().expect("temp dir");
    let transport = Arc::new(MockTransport::new());
    transport.text(&url("master.m3u8"), MASTER);
    serve_rendition(&transport, "audio_only", &[10.0], 40);

    let mut opts = options(&temp, master_source(), "audio");
    opts.quality = Some("Audio Only".to_string());
    let (result, _, _) = run(opts, transport).await;

    let path = result.expect("download succeeds");
    assert_eq!(path, temp.path().join("out").join("audio.m4a"));
}

#[tokio::test]
async fn unknown_quality_fails_validation() {
    let temp = TempDir::new().expect("temp dir");
    let transport = Arc::new(MockTransport::new());
    transport.text(&url("master.m3u8"), MASTER);

    let mut opts = options(&temp, master_source(), "video.mp4");
    opts.quality = Some("4k".to_string());
    let (result, _, state) = run(opts, transport).await;

    assert!(matches!(result, Err(VodError::Validation(_))));
    assert!(matches!(state, DownloadState::Failed(_)));
}

// ============================================================
// TRIMMING
// ============================================================

#[tokio::test]
async fn trim_fetches_only_covering_segments() {
    let temp = TempDir::new().expect("temp dir");
    let transport = Arc::new(MockTransport::new());
    let durations = [10.0; 10];
    let parts = serve_rendition(&transport, "source", &durations, 50);

    let mut opts = options(&temp, media_source(media_playlist(&durations)), "clip.mp4");
    opts.trim = TrimWindow::new(Some(25.0), Some(75.0));
    let (result, events, _) = run(opts, transport.clone()).await;

    let path = result.expect("download succeeds");
    for i in 0..10 {
        let expected = usize::from((2..=7).contains(&i));
        assert_eq!(
            transport.request_count(&url(&format!("source/{}.ts", i))),
            expected,
            "segment {}",
            i
        );
    }
    // No muxer configured: output is cut at segment boundaries
    assert_eq!(std::fs::read(&path).expect("output"), concat(&parts[2..8]));
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::Log(msg) if msg.contains("segment boundaries"))));
}

#[tokio::test]
async fn trim_past_end_fails_before_fetching() {
    let temp = TempDir::new().expect("temp dir");
    let transport = Arc::new(MockTransport::new());
    let durations = [10.0; 3];
    serve_rendition(&transport, "source", &durations, 0);

    let mut opts = options(&temp, media_source(media_playlist(&durations)), "clip.mp4");
    opts.trim = TrimWindow::new(Some(30.0), None);
    let (result, _, _) = run(opts, transport.clone()).await;

    assert!(matches!(result, Err(VodError::Validation(_))));
    assert_eq!(transport.total_requests(), 0);
}

// ============================================================
// FAILURES AND RETRIES
// ============================================================

#[tokio::test]
async fn transient_failures_are_retried() {
    let temp = TempDir::new().expect("temp dir");
    let transport = Arc::new(MockTransport::new());
    let durations = [5.0; 3];
    let parts = serve_rendition(&transport, "source", &durations, 0);
    transport.fail_first(
        &url("source/1.ts"),
        vec![TransportError::Status(503), TransportError::Timeout],
    );

    let opts = options(&temp, media_source(media_playlist(&durations)), "video.ts");
    let (result, _, _) = run(opts, transport.clone()).await;

    let path = result.expect("download succeeds");
    assert_eq!(std::fs::read(path).expect("output"), concat(&parts));
    assert_eq!(transport.request_count(&url("source/1.ts")), 3);
}

#[tokio::test]
async fn corrupt_part_exhausts_retries() {
    let temp = TempDir::new().expect("temp dir");
    let transport = Arc::new(MockTransport::new());
    let durations = [5.0; 2];
    serve_rendition(&transport, "source", &durations, 0);
    // Not a whole number of TS packets
    transport.body(&url("source/0.ts"), vec![0x47; 100]);

    let opts = options(&temp, media_source(media_playlist(&durations)), "video.ts");
    let (result, _, _) = run(opts, transport.clone()).await;

    match result {
        Err(VodError::Network(err)) => {
            assert_eq!(err.attempts, 4);
            assert!(matches!(err.source, TransportError::Corrupt(_)));
        }
        other => panic!("expected corrupt part failure, got {:?}", other),
    }
}

#[tokio::test]
async fn permanent_failure_aborts_and_cleans_up() {
    let temp = TempDir::new().expect("temp dir");
    let transport = Arc::new(MockTransport::new());
    let durations = [5.0; 6];
    serve_rendition(&transport, "source", &durations, 0);
    transport.error(&url("source/3.ts"), TransportError::Status(404));

    let mut opts = options(&temp, media_source(media_playlist(&durations)), "video.mp4");
    opts.concurrency = 2;
    let (result, _, state) = run(opts, transport.clone()).await;

    match result {
        Err(VodError::Network(err)) => {
            assert_eq!(err.attempts, 1);
            assert_eq!(err.source, TransportError::Status(404));
            assert!(err.url.ends_with("source/3.ts"));
        }
        other => panic!("expected network error, got {:?}", other),
    }
    assert_eq!(transport.request_count(&url("source/3.ts")), 1);
    assert!(matches!(state, DownloadState::Failed(_)));
    assert!(!temp.path().join("out").join("video.mp4").exists());
    assert_eq!(dir_entries(&temp.path().join("scratch")), 0);
}

#[tokio::test]
async fn missing_part_reports_http_404() {
    let temp = TempDir::new().expect("temp dir");
    let transport = Arc::new(MockTransport::new());
    let durations = [5.0; 3];
    serve_rendition(&transport, "source", &durations[..2], 0);

    let opts = options(&temp, media_source(media_playlist(&durations)), "video.mp4");
    let (result, _, _) = run(opts, transport.clone()).await;

    match result {
        Err(VodError::Network(err)) => {
            assert_eq!(err.source, TransportError::Status(404));
            assert_eq!(err.attempts, 1);
            assert!(err.url.ends_with("source/2.ts"));
        }
        other => panic!("expected network error, got {:?}", other),
    }
    assert_eq!(transport.request_count(&url("source/2.ts")), 1);
}

#[tokio::test]
async fn muted_part_falls_back() {
    let temp = TempDir::new().expect("temp dir");
    let transport = Arc::new(MockTransport::new());
    let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXTINF:10.000,\n0.ts\n#EXTINF:10.000,\n1-unmuted.ts\n#EXT-X-ENDLIST\n";
    let first = ts_part(1, 1);
    let muted = ts_part(2, 1);
    transport.body(&url("source/0.ts"), first.clone());
    transport.error(&url("source/1-unmuted.ts"), TransportError::Status(403));
    transport.body(&url("source/1-muted.ts"), muted.clone());

    let opts = options(&temp, media_source(playlist.to_string()), "video.ts");
    let (result, _, _) = run(opts, transport.clone()).await;

    let path = result.expect("download succeeds");
    assert_eq!(std::fs::read(path).expect("output"), concat(&[first, muted]));
    assert_eq!(transport.request_count(&url("source/1-unmuted.ts")), 1);
    assert_eq!(transport.request_count(&url("source/1-muted.ts")), 1);
}

#[tokio::test]
async fn restricted_playlist_is_rejected() {
    let temp = TempDir::new().expect("temp dir");
    let transport = Arc::new(MockTransport::new());
    transport.text(
        &url("master.m3u8"),
        r#"[{"error":"Manifest is restricted","error_code":"vod_manifest_restricted"}]"#,
    );

    let (result, _, _) = run(options(&temp, master_source(), "video.mp4"), transport).await;

    match result {
        Err(VodError::Validation(msg)) => assert!(msg.contains("restricted")),
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[tokio::test]
async fn malformed_playlist_reports_line() {
    let temp = TempDir::new().expect("temp dir");
    let transport = Arc::new(MockTransport::new());
    let playlist = "#EXTM3U\n#EXTINF:ten,\n0.ts\n".to_string();

    let (result, _, _) = run(options(&temp, media_source(playlist), "video.mp4"), transport).await;

    match result {
        Err(VodError::Parse(err)) => assert_eq!(err.line, 2),
        other => panic!("expected parse error, got {:?}", other),
    }
}

#[tokio::test]
async fn invalid_options_fail_without_requests() {
    let temp = TempDir::new().expect("temp dir");
    let transport = Arc::new(MockTransport::new());

    let mut opts = options(&temp, master_source(), "video.mp4");
    opts.concurrency = 0;
    let (result, _, state) = run(opts, transport.clone()).await;

    assert!(matches!(result, Err(VodError::Validation(_))));
    assert!(matches!(state, DownloadState::Failed(_)));
    assert_eq!(transport.total_requests(), 0);
}

// ============================================================
// THROTTLING
// ============================================================

#[tokio::test]
async fn throttled_run_respects_aggregate_rate() {
    let temp = TempDir::new().expect("temp dir");
    let transport = Arc::new(MockTransport::new());
    let durations = [10.0; 4];
    // 88 packets is just over one 16 KiB throttle slice per part
    let parts: Vec<Vec<u8>> = (0..4u8).map(|i| ts_part(i, 88)).collect();
    for (i, part) in parts.iter().enumerate() {
        transport.chunked(&url(&format!("source/{}.ts", i)), part.clone(), 4096);
    }
    let total: usize = parts.iter().map(Vec::len).sum();
    let rate = 64 * 1024u64;

    let mut opts = options(&temp, media_source(media_playlist(&durations)), "video.ts");
    opts.concurrency = 4;
    opts.throttle = ThrottleRate::BytesPerSec(rate);
    let started = Instant::now();
    let (result, _, _) = run(opts, transport).await;
    let elapsed = started.elapsed();

    let path = result.expect("download succeeds");
    assert_eq!(std::fs::read(&path).expect("output"), concat(&parts));

    // All parts share one budget; allow one part's worth of slack
    let floor = Duration::from_secs_f64((total - parts[0].len()) as f64 / rate as f64);
    assert!(elapsed >= floor, "finished in {:?}, expected at least {:?}", elapsed, floor);
}

// ============================================================
// CONCURRENCY
// ============================================================

#[tokio::test]
async fn concurrency_is_bounded() {
    let temp = TempDir::new().expect("temp dir");
    let transport = Arc::new(MockTransport::new().with_delay(Duration::from_millis(20)));
    let durations = [2.0; 16];
    serve_rendition(&transport, "source", &durations, 0);

    let mut opts = options(&temp, media_source(media_playlist(&durations)), "video.ts");
    opts.concurrency = 3;
    let (result, _, _) = run(opts, transport.clone()).await;

    result.expect("download succeeds");
    assert!(transport.max_concurrent() <= 3);
    assert!(transport.max_concurrent() >= 2);
}

#[tokio::test]
async fn state_changes_are_observable() {
    let temp = TempDir::new().expect("temp dir");
    let transport = Arc::new(MockTransport::new());
    serve_rendition(&transport, "source", &[4.0], 0);

    let downloader = VodDownloader::new(
        options(&temp, media_source(media_playlist(&[4.0])), "video.ts"),
        transport,
    );
    let mut rx = downloader.subscribe();
    assert_eq!(*rx.borrow(), DownloadState::Idle);

    let (tx, _progress_rx) = mpsc::channel(1024);
    let watcher = tokio::spawn(async move {
        let mut seen = Vec::new();
        while rx.changed().await.is_ok() {
            let state = rx.borrow().clone();
            let terminal = state.is_terminal();
            seen.push(state);
            if terminal {
                break;
            }
        }
        seen
    });

    downloader
        .download(tx, CancellationToken::new())
        .await
        .expect("download succeeds");
    let seen = watcher.await.expect("watcher");
    assert!(matches!(seen.last(), Some(DownloadState::Done(_))));
}
