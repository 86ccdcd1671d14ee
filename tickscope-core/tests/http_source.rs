//! Live polling of HTTP capture sources against an in-process server.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tickscope_core::cache::FrameCache;
use tickscope_core::config::{CacheConfig, IngestConfig};
use tickscope_core::ingest::{LiveEvent, LiveStream, PollOutcome, PollSchedule, SourceReader};
use tickscope_core::{CaptureSource, SourceOrigin};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct Served {
    body: Arc<Mutex<Vec<u8>>>,
    /// Answer every request with the full body and `200`
    ignore_range: bool,
}

impl Served {
    fn set(&self, text: &str) {
        *self.body.lock().unwrap() = text.as_bytes().to_vec();
    }

    fn append(&self, text: &str) {
        self.body.lock().unwrap().extend_from_slice(text.as_bytes());
    }
}

fn range_start(headers: &HeaderMap) -> Option<usize> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    value.strip_prefix("bytes=")?.strip_suffix('-')?.parse().ok()
}

async fn serve_capture(State(served): State<Served>, headers: HeaderMap) -> Response {
    let body = served.body.lock().unwrap().clone();
    let len = body.len();
    let start = match range_start(&headers) {
        Some(start) if !served.ignore_range => start,
        _ => return (StatusCode::OK, body).into_response(),
    };
    if start >= len {
        return (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{}", len))],
        )
            .into_response();
    }
    (
        StatusCode::PARTIAL_CONTENT,
        [(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, len - 1, len))],
        body[start..].to_vec(),
    )
        .into_response()
}

async fn spawn_server(served: Served) -> String {
    let app = Router::new()
        .route("/capture.jsonl", get(serve_capture))
        .with_state(served);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/capture.jsonl", addr)
}

fn frame_line(tick: u64) -> String {
    format!(r#"{{"tick":{},"entities":{{"e":{{"c":{{"v":{}}}}}}}}}"#, tick, tick) + "\n"
}

fn http_stream(url: &str) -> (LiveStream, mpsc::UnboundedReceiver<LiveEvent>) {
    let config = IngestConfig::default();
    let source = CaptureSource::new("remote", url, SourceOrigin::Live);
    let (tx, rx) = mpsc::unbounded_channel();
    let stream = LiveStream::new(
        &source,
        PollSchedule::from_config(&config, Some(Duration::from_millis(10))),
        SourceReader::new(&config).unwrap(),
        Arc::new(FrameCache::new(&CacheConfig::default())),
        tx,
    );
    (stream, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<LiveEvent>) -> (Vec<u64>, usize) {
    let mut ticks = Vec::new();
    let mut resets = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            LiveEvent::Frames { frames, .. } => ticks.extend(frames.iter().map(|f| f.tick)),
            LiveEvent::Reset { .. } => resets += 1,
            _ => {}
        }
    }
    (ticks, resets)
}

#[tokio::test]
async fn test_range_polling_follows_growth() {
    let served = Served::default();
    served.set(&(frame_line(1) + &frame_line(2)));
    let url = spawn_server(served.clone()).await;
    let (mut stream, mut rx) = http_stream(&url);
    let cancel = CancellationToken::new();

    // The newest tick is held until a later one arrives
    let outcome = stream.poll_once(&cancel).await.unwrap();
    assert_eq!(outcome, PollOutcome::Progress { frames: 1, capped: false });
    assert_eq!(drain(&mut rx).0, vec![1]);

    // 416 at the current end: nothing new
    assert_eq!(stream.poll_once(&cancel).await.unwrap(), PollOutcome::Idle);

    served.append(&frame_line(3));
    stream.poll_once(&cancel).await.unwrap();
    assert_eq!(drain(&mut rx).0, vec![2]);
    assert_eq!(
        stream.state().byte_offset as usize,
        served.body.lock().unwrap().len()
    );
}

#[tokio::test]
async fn test_range_polling_detects_truncation() {
    let served = Served::default();
    served.set(&(frame_line(7) + &frame_line(8) + &frame_line(9)));
    let url = spawn_server(served.clone()).await;
    let (mut stream, mut rx) = http_stream(&url);
    let cancel = CancellationToken::new();

    stream.poll_once(&cancel).await.unwrap();
    assert_eq!(drain(&mut rx).0, vec![7, 8]);

    served.set(&(frame_line(1) + &frame_line(2)));
    assert_eq!(stream.poll_once(&cancel).await.unwrap(), PollOutcome::Truncated);
    stream.poll_once(&cancel).await.unwrap();
    let (ticks, resets) = drain(&mut rx);
    assert_eq!(resets, 1);
    assert_eq!(ticks, vec![1]);
}

#[tokio::test]
async fn test_server_without_range_support() {
    let served = Served {
        ignore_range: true,
        ..Default::default()
    };
    served.set(&frame_line(1));
    let url = spawn_server(served.clone()).await;
    let (mut stream, mut rx) = http_stream(&url);
    let cancel = CancellationToken::new();

    stream.poll_once(&cancel).await.unwrap();
    served.append(&(frame_line(2) + &frame_line(3)));
    stream.poll_once(&cancel).await.unwrap();
    // The already-read prefix is skipped, not re-emitted
    assert_eq!(drain(&mut rx).0, vec![1, 2]);
}

#[tokio::test]
async fn test_probe_reports_size_and_missing_source() {
    let served = Served::default();
    served.set(&frame_line(1));
    let url = spawn_server(served.clone()).await;
    let reader = SourceReader::new(&IngestConfig::default()).unwrap();

    let size = reader
        .probe(&tickscope_core::Locator::parse(&url))
        .await
        .unwrap();
    assert_eq!(size, Some(frame_line(1).len() as u64));

    let missing = url.replace("capture.jsonl", "absent.jsonl");
    assert!(reader
        .probe(&tickscope_core::Locator::parse(&missing))
        .await
        .is_err());
}
