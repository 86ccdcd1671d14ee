//! End-to-end tests through the store: upload, derive, query, restore.
//!
//! Captures come from `tests/fixtures/`; every test gets its own data
//! directory.

use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tickscope_core::control::{Envelope, Outbound, RegisterRequest, Registration};
use tickscope_core::{JobInfo, JobStatus, SeriesRequest, SourceRequest, Store};
use tokio::sync::mpsc;

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn open_store(dir: &TempDir) -> Store {
    tickscope_core::logging::init_test();
    Store::open_in(dir.path()).unwrap()
}

fn fixture_bytes(name: &str) -> Vec<u8> {
    std::fs::read(fixture_path(name)).unwrap()
}

async fn wait_ended(store: &Store, capture_id: &str) {
    for _ in 0..500 {
        if store.registry().entry(capture_id).is_some_and(|e| e.ended) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("capture {} never ended", capture_id);
}

async fn wait_job(store: &Store, output: &str) -> JobInfo {
    for _ in 0..500 {
        if let Some(info) = store.jobs().get(output).await {
            if info.status.is_terminal() {
                return info;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job for {} never finished", output);
}

async fn command(store: &Store, envelope: Envelope) -> Envelope {
    let reply = store.handle_server_command(&envelope).await;
    assert_ne!(reply.kind, "error", "{} failed: {:?}", envelope.kind, reply.get("error"));
    reply
}

fn metric(capture_id: &str, path: &[&str]) -> Value {
    json!({ "capture_id": capture_id, "path": path })
}

async fn values(store: &Store, capture_id: &str, path: &str) -> Vec<Option<f64>> {
    let request = SeriesRequest {
        capture_id: capture_id.to_string(),
        paths: vec![path.to_string()],
        path: None,
        prefer_cache: true,
    };
    let batch = store.series(&request).await.unwrap();
    batch.series[0].points.iter().map(|p| p.value).collect()
}

/// Upload fixtures and wait until each has been read.
async fn upload_all(store: &Store, names: &[&str]) -> Vec<String> {
    let mut ids = Vec::new();
    for name in names {
        let outcome = store
            .upload_capture(&fixture_bytes(name), Some(name))
            .await
            .unwrap();
        wait_ended(store, &outcome.capture_id).await;
        ids.push(outcome.capture_id);
    }
    ids
}

async fn run_diff(second_input: &str) -> Vec<Option<f64>> {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let ids = upload_all(&store, &["probe-a.jsonl", second_input]).await;

    command(
        &store,
        Envelope::new("define_group")
            .with("id", "g")
            .with("name", "spread")
            .with(
                "input_metrics",
                json!([
                    metric(&ids[0], &["probe", "signal", "x"]),
                    metric(&ids[1], &["probe", "signal", "x"]),
                ]),
            ),
    )
    .await;
    let reply = command(
        &store,
        Envelope::new("derive_start")
            .with("group_id", "g")
            .with("kind", "diff"),
    )
    .await;
    let output = reply.get("job").unwrap()["output_capture_id"]
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(output, "derived-g-diff");

    let info = wait_job(&store, &output).await;
    assert_eq!(info.status, JobStatus::Completed);
    assert_eq!(info.ticks_emitted, 3);

    let out = values(&store, &output, "derived.spread.diff").await;
    store.shutdown().await;
    out
}

// ============================================
// Uploads
// ============================================

#[tokio::test]
async fn test_upload_dedups_identical_bytes() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let bytes = fixture_bytes("probe-a.jsonl");

    let first = store.upload_capture(&bytes, Some("Probe A")).await.unwrap();
    assert!(!first.deduplicated);
    let second = store.upload_capture(&bytes, None).await.unwrap();
    assert!(second.deduplicated);
    assert_eq!(second.capture_id, first.capture_id);

    assert_eq!(store.list_captures().len(), 1);
    let files = std::fs::read_dir(store.config().uploads_dir()).unwrap().count();
    assert_eq!(files, 1);

    wait_ended(&store, &first.capture_id).await;
    let entry = store.registry().entry(&first.capture_id).unwrap();
    // The corrupt line is skipped
    assert_eq!(entry.frame_count, 3);
    assert_eq!(entry.last_tick, Some(3));
    assert_eq!(entry.source.display_name, "Probe A");
    store.shutdown().await;
}

#[tokio::test]
async fn test_final_line_without_newline_is_read() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let summary = store
        .load_capture(SourceRequest {
            locator: fixture_path("ramp.jsonl").to_string_lossy().into_owned(),
            capture_id: Some("ramp".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(summary.source.capture_id, "ramp");
    wait_ended(&store, "ramp").await;

    let ys = values(&store, "ramp", "body.pos.y").await;
    assert_eq!(ys, vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0), Some(5.0)]);
    store.shutdown().await;
}

#[tokio::test]
async fn test_load_missing_source_fails_immediately() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let result = store
        .load_capture(SourceRequest {
            locator: dir.path().join("absent.jsonl").to_string_lossy().into_owned(),
            ..Default::default()
        })
        .await;
    assert!(matches!(
        result,
        Err(tickscope_core::Error::SourceUnavailable { .. })
    ));
    assert!(store.list_captures().is_empty());
    store.shutdown().await;
}

// ============================================
// Derivations
// ============================================

#[tokio::test]
async fn test_diff_derivation() {
    assert_eq!(
        run_diff("probe-b.jsonl").await,
        vec![Some(1.0), Some(2.0), Some(4.0)]
    );
}

#[tokio::test]
async fn test_diff_derivation_with_null_input() {
    assert_eq!(
        run_diff("probe-b-gap.jsonl").await,
        vec![Some(1.0), None, Some(4.0)]
    );
}

#[tokio::test]
async fn test_moving_average_derivation() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let ids = upload_all(&store, &["ramp.jsonl"]).await;

    command(
        &store,
        Envelope::new("define_group")
            .with("id", "smooth")
            .with("name", "smooth")
            .with("input_metrics", json!([metric(&ids[0], &["body", "pos", "y"])])),
    )
    .await;
    let reply = command(
        &store,
        Envelope::new("derive_start")
            .with("group_id", "smooth")
            .with("kind", "moving_average")
            .with("window", 3)
            .with("output_capture_id", "smooth-out"),
    )
    .await;
    assert_eq!(reply.kind, "derive_start_result");

    let info = wait_job(&store, "smooth-out").await;
    assert_eq!(info.status, JobStatus::Completed);
    assert_eq!(
        values(&store, "smooth-out", "derived.smooth.moving_average").await,
        vec![Some(1.0), Some(1.5), Some(2.0), Some(3.0), Some(4.0)]
    );

    // The output is an ordinary capture backed by a JSONL file
    let source = store.registry().get("smooth-out").unwrap();
    let written = std::fs::read_to_string(&source.locator).unwrap();
    assert_eq!(written.lines().count(), 5);
    store.shutdown().await;
}

#[tokio::test]
async fn test_plugin_derivation_and_rejection() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let ids = upload_all(&store, &["ramp.jsonl"]).await;

    let doubled = store
        .plugins()
        .upload(br#"{"id":"double","name":"Double","outputs":[{"key":"twice","expr":"in0 * 2"}]}"#)
        .unwrap();
    assert!(doubled.valid);
    let broken = store
        .plugins()
        .upload(br#"{"id":"broken","name":"Broken","outputs":[{"key":"inf","expr":"in0 / 0"}]}"#)
        .unwrap();
    assert!(!broken.valid);

    let listed = command(&store, Envelope::new("list_plugins")).await;
    assert_eq!(listed.get("plugins").unwrap().as_array().unwrap().len(), 2);

    command(
        &store,
        Envelope::new("define_group")
            .with("id", "p")
            .with("name", "scaled")
            .with("plugin_id", "double")
            .with("input_metrics", json!([metric(&ids[0], &["body", "pos", "y"])])),
    )
    .await;
    command(
        &store,
        Envelope::new("derive_start")
            .with("group_id", "p")
            .with("kind", "plugin"),
    )
    .await;
    let info = wait_job(&store, "derived-p-plugin").await;
    assert_eq!(info.status, JobStatus::Completed);
    assert_eq!(
        values(&store, "derived-p-plugin", "derived.scaled.twice").await,
        vec![Some(2.0), Some(4.0), Some(6.0), Some(8.0), Some(10.0)]
    );

    let rejected = store
        .handle_server_command(
            &Envelope::new("derive_start")
                .with("group_id", "p")
                .with("kind", "plugin")
                .with("plugin_id", "broken")
                .with_request_id(Some("r1".to_string())),
        )
        .await;
    assert_eq!(rejected.kind, "error");
    assert_eq!(rejected.request_id.as_deref(), Some("r1"));
    let message = rejected.get_str("error").unwrap();
    assert!(message.contains(broken.validation_error.as_deref().unwrap()));
    store.shutdown().await;
}

// ============================================
// Control channel
// ============================================

#[tokio::test]
async fn test_display_sees_capture_lifecycle() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let request =
        RegisterRequest::from_envelope(&Envelope::new("register").with("role", "display")).unwrap();
    assert!(matches!(
        store.channel().register(request, tx),
        Registration::Accepted(_)
    ));

    let ids = upload_all(&store, &["probe-a.jsonl"]).await;

    let mut kinds = Vec::new();
    while let Ok(Outbound::Text(text)) = rx.try_recv() {
        let envelope = Envelope::parse(&text).unwrap();
        if envelope.kind == "capture_tick" {
            assert_eq!(envelope.get("tick"), Some(&json!(3)));
        }
        if envelope.kind.starts_with("capture_") {
            assert_eq!(envelope.capture_id(), Some(ids[0].as_str()));
        }
        kinds.push(envelope.kind);
    }
    assert_eq!(kinds.first().map(String::as_str), Some("registered"));
    assert_eq!(kinds[1], "capture_init");
    assert!(kinds.contains(&"capture_components".to_string()));
    assert!(kinds.contains(&"capture_tick".to_string()));
    assert_eq!(kinds.last().map(String::as_str), Some("capture_end"));
    store.shutdown().await;
}

#[tokio::test]
async fn test_get_series_command() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let ids = upload_all(&store, &["probe-a.jsonl"]).await;

    let reply = command(
        &store,
        Envelope::new("get_series")
            .with("capture_id", &ids[0])
            .with("path", "probe.signal.x"),
    )
    .await;
    assert_eq!(reply.kind, "get_series_result");
    assert_eq!(reply.get("partial"), Some(&json!(false)));
    let points = reply.get("series").unwrap()[0]["points"].as_array().unwrap().clone();
    assert_eq!(points.len(), 3);
    assert_eq!(points[2], json!({ "tick": 3, "value": 3.0 }));

    let missing = store
        .handle_server_command(&Envelope::new("get_series").with("capture_id", "nope").with("path", "a.b"))
        .await;
    assert_eq!(missing.kind, "error");
    store.shutdown().await;
}

// ============================================
// Removal and restore
// ============================================

#[tokio::test]
async fn test_remove_capture_drops_upload() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let bytes = fixture_bytes("probe-a.jsonl");
    let ids = upload_all(&store, &["probe-a.jsonl"]).await;

    let reply = command(
        &store,
        Envelope::new("remove_capture").with("capture_id", &ids[0]),
    )
    .await;
    assert_eq!(reply.get("removed"), Some(&json!(true)));
    assert!(store.list_captures().is_empty());
    assert!(!store.cache().contains(&ids[0]));
    assert_eq!(std::fs::read_dir(store.config().uploads_dir()).unwrap().count(), 0);

    let again = store.upload_capture(&bytes, None).await.unwrap();
    assert!(!again.deduplicated);
    store.shutdown().await;
}

#[tokio::test]
async fn test_clear_state_removes_derived_outputs() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let ids = upload_all(&store, &["ramp.jsonl"]).await;
    command(
        &store,
        Envelope::new("define_group")
            .with("id", "m")
            .with("name", "m")
            .with("input_metrics", json!([metric(&ids[0], &["body", "pos", "y"])])),
    )
    .await;
    command(
        &store,
        Envelope::new("derive_start")
            .with("group_id", "m")
            .with("kind", "moving_average"),
    )
    .await;
    wait_job(&store, "derived-m-moving_average").await;
    assert_eq!(store.list_captures().len(), 2);

    command(&store, Envelope::new("clear_state")).await;
    assert!(store.list_captures().is_empty());
    assert!(store.jobs().groups().is_empty());
    assert_eq!(std::fs::read_dir(store.config().derived_dir()).unwrap().count(), 0);
    assert_eq!(std::fs::read_dir(store.config().uploads_dir()).unwrap().count(), 0);
    store.shutdown().await;
}

#[tokio::test]
async fn test_live_source_rearmed_after_restart() {
    let dir = TempDir::new().unwrap();
    let capture = dir.path().join("live.jsonl");
    std::fs::write(&capture, "{\"tick\":1,\"entities\":{\"e\":{\"c\":{\"v\":1}}}}\n").unwrap();

    {
        let store = open_store(&dir);
        let reply = command(
            &store,
            Envelope::new("live_start")
                .with("locator", capture.to_string_lossy())
                .with("capture_id", "live"),
        )
        .await;
        assert_eq!(reply.get("capture").unwrap()["live"], json!(true));
        // Shutdown is not a user stop: the source stays flagged live
        store.shutdown().await;
    }

    let store = open_store(&dir);
    let restored = store.registry().get("live").unwrap();
    assert!(restored.live);
    assert!(!store.registry().is_growing("live"));

    store.on_display_registered().await;
    let streams = command(&store, Envelope::new("live_list")).await;
    assert_eq!(streams.get("streams").unwrap().as_array().unwrap().len(), 1);

    let stopped = command(&store, Envelope::new("live_stop").with("capture_id", "live")).await;
    assert_eq!(stopped.get("stopped"), Some(&json!(true)));
    assert!(!store.registry().get("live").unwrap().live);
    store.shutdown().await;
}
