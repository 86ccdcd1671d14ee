//! The server's shared state.
//!
//! [`Store`] owns every component and is the single entry point for the
//! HTTP routes and the control channel's server commands.
//!
//! ```text
//!              ┌──────────────────┐   LiveEvent    ┌──────────┐
//! upload/load ─▶ LiveStreamManager ├───────────────▶   pump   ├──▶ CaptureRegistry
//! live_start   └────────┬─────────┘                └────┬─────┘
//!                       ▼                               ▼
//!                  FrameCache ◀── DerivationJobs ──▶ ControlChannel
//! ```
//!
//! Uploaded and loaded captures are read by a one-shot stream; live sources
//! are followed until idle. Either way the pump turns stream events into
//! registry progress and control channel messages, in the order the stream
//! produced them.

use crate::cache::{CacheStats, FrameCache};
use crate::config::Config;
use crate::control::{
    capture_append, capture_components, capture_end, capture_init, capture_tick, ChannelStatus,
    ControlChannel, Envelope,
};
use crate::db::{Database, UploadRecord};
use crate::derive::{DerivationJobs, JobRequest};
use crate::error::{Error, Result};
use crate::ingest::{EndReason, FollowMode, LiveEvent, LiveStreamInfo, LiveStreamManager, SourceReader};
use crate::plugin::PluginRegistry;
use crate::query::{self, SeriesBatch};
use crate::registry::{CaptureRegistry, CaptureSummary};
use crate::types::{
    content_hash, CaptureSource, DerivationGroup, Locator, SourceOrigin, StreamMode,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Length of the hash prefix in upload capture ids.
const UPLOAD_ID_PREFIX_LEN: usize = 12;

/// A source to read: `{ locator, capture_id?, name?, mode?, poll_interval_ms? }`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceRequest {
    pub locator: String,
    #[serde(default)]
    pub capture_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mode: Option<StreamMode>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

/// Series request. `path` is shorthand for a single entry of `paths`.
#[derive(Debug, Clone, Deserialize)]
pub struct SeriesRequest {
    #[serde(default)]
    pub capture_id: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_prefer_cache")]
    pub prefer_cache: bool,
}

fn default_prefer_cache() -> bool {
    true
}

impl SeriesRequest {
    fn all_paths(&self) -> Vec<String> {
        self.path
            .iter()
            .chain(self.paths.iter())
            .cloned()
            .collect()
    }
}

/// Result of an upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub capture_id: String,
    pub content_hash: String,
    pub size_bytes: u64,
    /// Identical bytes were uploaded before; nothing new was written
    pub deduplicated: bool,
}

/// Process-wide health report.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub captures: usize,
    pub live_streams: usize,
    pub jobs: usize,
    pub channel: ChannelStatus,
    pub cache: CacheStats,
}

pub struct Store {
    config: Config,
    db: Arc<Database>,
    reader: SourceReader,
    registry: Arc<CaptureRegistry>,
    cache: Arc<FrameCache>,
    channel: Arc<ControlChannel>,
    live: Arc<LiveStreamManager>,
    jobs: DerivationJobs,
    plugins: Arc<PluginRegistry>,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Store {
    /// Open persisted state and start the event pump.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        for dir in [config.uploads_dir(), config.plugins_dir(), config.derived_dir()] {
            std::fs::create_dir_all(&dir)?;
        }

        let db = Arc::new(Database::open(&config.database_path())?);
        db.migrate()?;

        let registry = Arc::new(CaptureRegistry::new(Arc::clone(&db)));
        registry.restore()?;
        let plugins = Arc::new(PluginRegistry::new(config.plugins_dir(), Arc::clone(&db)));
        plugins.restore()?;

        let reader = SourceReader::new(&config.ingest)?;
        let cache = Arc::new(FrameCache::new(&config.cache));
        let channel = Arc::new(ControlChannel::new(&config.control));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let live = Arc::new(LiveStreamManager::new(
            config.ingest.clone(),
            reader.clone(),
            Arc::clone(&cache),
            events_tx,
        ));
        let jobs = DerivationJobs::new(
            &config.derive,
            config.derived_dir(),
            reader.clone(),
            Arc::clone(&registry),
            Arc::clone(&cache),
            Arc::clone(&channel),
            Arc::clone(&plugins),
        );

        let cancel = CancellationToken::new();
        let pump = Pump {
            registry: Arc::clone(&registry),
            channel: Arc::clone(&channel),
            live: Arc::clone(&live),
        };
        let pump = tokio::spawn(pump.run(events_rx, cancel.child_token()));

        tracing::info!(data_dir = %config.data_dir().display(), "Store opened");
        Ok(Self {
            config,
            db,
            reader,
            registry,
            cache,
            channel,
            live,
            jobs,
            plugins,
            cancel,
            pump: Mutex::new(Some(pump)),
        })
    }

    /// Open a store whose state lives entirely under `dir`.
    pub fn open_in(dir: &Path) -> Result<Self> {
        Self::open(Config::with_data_dir(dir))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &CaptureRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &FrameCache {
        &self.cache
    }

    pub fn channel(&self) -> &ControlChannel {
        &self.channel
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub fn jobs(&self) -> &DerivationJobs {
        &self.jobs
    }

    // ============================================
    // Captures
    // ============================================

    pub fn list_captures(&self) -> Vec<CaptureSummary> {
        self.registry.list()
    }

    fn summary(&self, capture_id: &str) -> Result<CaptureSummary> {
        self.registry
            .entry(capture_id)
            .map(|e| CaptureSummary::from(&e))
            .ok_or_else(|| Error::CaptureNotFound(capture_id.to_string()))
    }

    /// Store an uploaded capture file and read it.
    ///
    /// Identical bytes map to the capture created by the first upload.
    pub async fn upload_capture(&self, bytes: &[u8], name: Option<&str>) -> Result<UploadOutcome> {
        if bytes.is_empty() {
            return Err(Error::InvalidRequest("upload is empty".to_string()));
        }
        let hash = content_hash(bytes);
        if let Some(existing) = self.db.get_upload(&hash)? {
            if let Some(source) = self.registry.get(&existing.capture_id) {
                if !self.cache.contains(&source.capture_id) && !self.live.is_running(&source.capture_id).await {
                    self.live.start(&source, FollowMode::OneShot).await;
                }
                tracing::debug!(capture_id = %existing.capture_id, "Upload matched stored content");
                return Ok(UploadOutcome {
                    capture_id: existing.capture_id,
                    content_hash: hash,
                    size_bytes: existing.size_bytes,
                    deduplicated: true,
                });
            }
        }

        let capture_id = format!("upload-{}", &hash[..UPLOAD_ID_PREFIX_LEN]);
        self.ensure_not_derived_output(&capture_id).await?;
        let file_name = format!("{}.jsonl", hash);
        let path = self.config.uploads_dir().join(&file_name);
        tokio::fs::write(&path, bytes).await?;

        let mut source = CaptureSource::new(&capture_id, &path.to_string_lossy(), SourceOrigin::Upload);
        if let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) {
            source.display_name = name.to_string();
        }
        self.registry.register(source.clone())?;
        self.db.insert_upload(&UploadRecord {
            content_hash: hash.clone(),
            file_name,
            size_bytes: bytes.len() as u64,
            capture_id: capture_id.clone(),
            uploaded_at: Utc::now(),
        })?;
        self.live.start(&source, FollowMode::OneShot).await;
        tracing::info!(capture_id = %capture_id, bytes = bytes.len(), "Capture uploaded");

        Ok(UploadOutcome {
            capture_id,
            content_hash: hash,
            size_bytes: bytes.len() as u64,
            deduplicated: false,
        })
    }

    /// Check that a source is readable, then read it once.
    pub async fn load_capture(&self, request: SourceRequest) -> Result<CaptureSummary> {
        let locator = parse_locator(&request.locator)?;
        self.reader.probe(&locator).await?;
        let source = build_source(&request, &locator, locator.origin());
        self.ensure_not_derived_output(&source.capture_id).await?;
        self.registry.register(source.clone())?;
        self.live.start(&source, FollowMode::OneShot).await;
        tracing::info!(capture_id = %source.capture_id, locator = %source.locator, "Capture loaded");
        self.summary(&source.capture_id)
    }

    /// Follow a growing source until it goes idle.
    ///
    /// The source is flagged live so it is re-armed after a restart.
    pub async fn start_live(&self, request: SourceRequest) -> Result<CaptureSummary> {
        let locator = parse_locator(&request.locator)?;
        let mut source = build_source(&request, &locator, SourceOrigin::Live);
        source.live = true;
        self.ensure_not_derived_output(&source.capture_id).await?;
        self.registry.register(source.clone())?;
        let generation = self.live.start(&source, FollowMode::Follow).await;
        tracing::info!(capture_id = %source.capture_id, generation, "Live stream requested");
        self.summary(&source.capture_id)
    }

    /// Stop following a source. False if no stream was running.
    pub async fn stop_live(&self, capture_id: &str) -> Result<bool> {
        if self.registry.contains(capture_id) {
            self.registry.set_live(capture_id, false)?;
        }
        Ok(self.live.stop(capture_id).await)
    }

    pub async fn list_live(&self) -> Vec<LiveStreamInfo> {
        self.live.list().await
    }

    async fn ensure_not_derived_output(&self, capture_id: &str) -> Result<()> {
        if self.jobs.is_running(capture_id).await {
            return Err(Error::InvalidRequest(format!(
                "capture {} is being written by a derivation job",
                capture_id
            )));
        }
        Ok(())
    }

    /// Forget a capture: streams, jobs, cached frames, buffered messages,
    /// stored uploads, and derived output files.
    pub async fn remove_capture(&self, capture_id: &str) -> Result<bool> {
        self.live.stop(capture_id).await;
        self.jobs.remove(capture_id).await;
        let removed = self.registry.remove(capture_id)?;
        self.cache.remove(capture_id);
        self.channel.forget_capture(capture_id);
        self.delete_capture_files(capture_id, removed.as_ref())?;
        if removed.is_some() {
            tracing::info!(capture_id, "Capture removed");
        }
        Ok(removed.is_some())
    }

    /// Drop every capture, job, and group. Plugins are kept.
    pub async fn clear_state(&self) -> Result<()> {
        self.live.stop_all().await;
        self.jobs.clear().await;
        let captures = self.registry.list();
        for summary in &captures {
            self.delete_capture_files(&summary.source.capture_id, Some(&summary.source))?;
        }
        self.registry.clear()?;
        self.cache.clear();
        self.channel.clear();
        tracing::info!(captures = captures.len(), "State cleared");
        Ok(())
    }

    fn delete_capture_files(&self, capture_id: &str, source: Option<&CaptureSource>) -> Result<()> {
        for upload in self.db.delete_uploads_for_capture(capture_id)? {
            remove_file_quietly(&self.config.uploads_dir().join(&upload.file_name))?;
        }
        if let Some(source) = source.filter(|s| s.origin == SourceOrigin::Derived) {
            remove_file_quietly(Path::new(&source.locator))?;
        }
        Ok(())
    }

    // ============================================
    // Queries and plugins
    // ============================================

    pub async fn series(&self, request: &SeriesRequest) -> Result<SeriesBatch> {
        let cancel = self.cancel.child_token();
        query::series(
            &self.registry,
            &self.cache,
            &self.reader,
            &request.capture_id,
            &request.all_paths(),
            request.prefer_cache,
            &cancel,
        )
        .await
    }

    pub async fn status(&self) -> StoreStatus {
        StoreStatus {
            captures: self.registry.list().len(),
            live_streams: self.live.list().await.iter().filter(|s| s.running).count(),
            jobs: self.jobs.list().await.len(),
            channel: self.channel.status(),
            cache: self.cache.stats(),
        }
    }

    // ============================================
    // Control channel
    // ============================================

    /// Re-arm persisted sources after a display registers.
    ///
    /// Live sources that are not running are followed again; restored
    /// captures with nothing cached are read once so the display sees them.
    pub async fn on_display_registered(&self) {
        for source in self.registry.persisted_live_sources() {
            let id = source.capture_id.as_str();
            if self.is_being_written(id).await {
                continue;
            }
            tracing::info!(capture_id = id, "Re-arming live stream");
            self.live.start(&source, FollowMode::Follow).await;
        }

        for summary in self.registry.list() {
            let source = summary.source;
            let id = source.capture_id.as_str();
            if source.live || self.cache.contains(id) || self.is_being_written(id).await {
                continue;
            }
            tracing::debug!(capture_id = id, "Reading restored capture");
            self.live.start(&source, FollowMode::OneShot).await;
        }
    }

    async fn is_being_written(&self, capture_id: &str) -> bool {
        self.live.is_running(capture_id).await || self.jobs.is_running(capture_id).await
    }

    /// Answer a server command with `<type>_result` or an error envelope.
    pub async fn handle_server_command(&self, command: &Envelope) -> Envelope {
        match self.run_command(command).await {
            Ok(result) => Envelope::result(command, result),
            Err(e) => {
                tracing::debug!(command = %command.kind, error = %e, "Server command failed");
                Envelope::error(e.to_string(), command.request_id.clone())
            }
        }
    }

    async fn run_command(&self, command: &Envelope) -> Result<Value> {
        let value = match command.kind.as_str() {
            "live_start" => json!({ "capture": self.start_live(command.body_as()?).await? }),
            "live_stop" => {
                let capture_id = command.require_str("capture_id")?;
                json!({ "capture_id": capture_id, "stopped": self.stop_live(capture_id).await? })
            }
            "live_list" => json!({ "streams": self.list_live().await }),
            "list_captures" => json!({ "captures": self.list_captures() }),
            "remove_capture" => {
                let capture_id = command.require_str("capture_id")?;
                json!({ "capture_id": capture_id, "removed": self.remove_capture(capture_id).await? })
            }
            "clear_state" => {
                self.clear_state().await?;
                json!({ "cleared": true })
            }
            "define_group" => {
                let group: DerivationGroup = match command.get("group") {
                    Some(group) => serde_json::from_value(group.clone())
                        .map_err(|e| Error::InvalidRequest(format!("define_group: {}", e)))?,
                    None => command.body_as()?,
                };
                json!({ "group": self.jobs.define_group(group)? })
            }
            "derive_start" => {
                let request: JobRequest = command.body_as()?;
                json!({ "job": self.jobs.start(request).await? })
            }
            "derive_stop" => {
                let output = command.require_str("output_capture_id")?;
                json!({ "output_capture_id": output, "stopped": self.jobs.stop(output).await })
            }
            "derive_list" => json!({
                "jobs": self.jobs.list().await,
                "groups": self.jobs.groups(),
            }),
            "list_plugins" => json!({ "plugins": self.plugins.list()? }),
            "get_series" => {
                let request: SeriesRequest = command.body_as()?;
                if request.capture_id.is_empty() {
                    return Err(Error::InvalidRequest("get_series requires 'capture_id'".to_string()));
                }
                serde_json::to_value(self.series(&request).await?)?
            }
            other => {
                return Err(Error::InvalidRequest(format!("not a server command: {}", other)));
            }
        };
        Ok(value)
    }

    /// Stop the pump first so shutdown-induced stream ends do not clear
    /// persisted live flags, then stop every stream and job.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                tracing::warn!(error = %e, "Event pump did not shut down cleanly");
            }
        }
        self.live.stop_all().await;
        self.jobs.stop_all().await;
        tracing::info!("Store shut down");
    }
}

fn parse_locator(raw: &str) -> Result<Locator> {
    if raw.trim().is_empty() {
        return Err(Error::InvalidRequest("locator is required".to_string()));
    }
    Ok(Locator::parse(raw))
}

fn build_source(request: &SourceRequest, locator: &Locator, origin: SourceOrigin) -> CaptureSource {
    let capture_id = request
        .capture_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(new_capture_id);
    let mut source = CaptureSource::new(&capture_id, &locator.to_string(), origin);
    if let Some(name) = request.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        source.display_name = name.to_string();
    }
    if let Some(mode) = request.mode {
        source.stream_mode = mode;
    }
    source.poll_interval_ms = request.poll_interval_ms;
    source
}

fn new_capture_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("cap-{}", &id[..12])
}

fn remove_file_quietly(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Turns live stream events into registry progress and channel messages.
struct Pump {
    registry: Arc<CaptureRegistry>,
    channel: Arc<ControlChannel>,
    live: Arc<LiveStreamManager>,
}

impl Pump {
    async fn run(self, mut events: UnboundedReceiver<LiveEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(event) => self.handle(event).await,
                None => break,
            }
        }
        tracing::debug!("Event pump stopped");
    }

    async fn handle(&self, event: LiveEvent) {
        match event {
            LiveEvent::Started { capture_id, .. } | LiveEvent::Reset { capture_id } => {
                let Some(source) = self.registry.get(&capture_id) else {
                    return;
                };
                self.registry.reset_progress(&capture_id);
                self.channel.publish(&capture_init(&source, true));
            }
            LiveEvent::Frames {
                capture_id,
                frames,
                mode,
                last_tick,
            } => {
                if !self.registry.contains(&capture_id) {
                    return;
                }
                self.registry
                    .advance(&capture_id, last_tick, frames.len() as u64);
                match mode {
                    StreamMode::Full => self.channel.publish(&capture_append(&capture_id, &frames)),
                    StreamMode::Lite => {
                        if let Some(tick) = last_tick {
                            self.channel.publish(&capture_tick(&capture_id, tick));
                        }
                    }
                }
            }
            LiveEvent::Components { capture_id, nodes } => {
                if !self.registry.contains(&capture_id) {
                    return;
                }
                let envelope = capture_components(&capture_id, &nodes);
                self.registry.set_components(&capture_id, nodes);
                self.channel.publish(&envelope);
            }
            LiveEvent::Ended {
                capture_id,
                generation,
                reason,
                last_tick,
                frame_count,
            } => {
                match self.live.generation(&capture_id).await {
                    // A newer run already replaced this one
                    Some(current) if current != generation => return,
                    Some(_) => self.live.forget(&capture_id, generation).await,
                    None => {}
                }
                if !self.registry.contains(&capture_id) {
                    return;
                }
                self.registry.mark_ended(&capture_id, reason.as_str());
                if matches!(reason, EndReason::Idle | EndReason::Error(_)) {
                    if let Err(e) = self.registry.set_live(&capture_id, false) {
                        tracing::warn!(capture_id = %capture_id, error = %e, "Failed to clear live flag");
                    }
                }
                let mut end = capture_end(&capture_id, reason.as_str(), last_tick);
                if let EndReason::Error(message) = &reason {
                    end.set("error", message);
                }
                tracing::debug!(capture_id = %capture_id, frames = frame_count, reason = reason.as_str(), "Capture stream ended");
                self.channel.publish(&end);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_source_defaults() {
        let request = SourceRequest {
            locator: " /tmp/run.jsonl ".to_string(),
            ..Default::default()
        };
        let source = build_source(&request, &parse_locator(&request.locator).unwrap(), SourceOrigin::File);
        assert!(source.capture_id.starts_with("cap-"));
        assert_eq!(source.locator, "/tmp/run.jsonl");
        assert_eq!(source.display_name, "run.jsonl");
        assert_eq!(source.stream_mode, StreamMode::default());

        let named = SourceRequest {
            locator: "/tmp/run.jsonl".to_string(),
            capture_id: Some("run".to_string()),
            name: Some("Run 1".to_string()),
            mode: Some(StreamMode::Lite),
            poll_interval_ms: Some(100),
        };
        let source = build_source(&named, &parse_locator(&named.locator).unwrap(), SourceOrigin::Live);
        assert_eq!(source.capture_id, "run");
        assert_eq!(source.display_name, "Run 1");
        assert_eq!(source.stream_mode, StreamMode::Lite);
        assert_eq!(source.poll_interval_ms, Some(100));
    }

    #[test]
    fn test_series_request_paths() {
        let request: SeriesRequest =
            serde_json::from_value(json!({ "capture_id": "a", "path": "e.c.x", "paths": ["e.c.y"] }))
                .unwrap();
        assert!(request.prefer_cache);
        assert_eq!(request.all_paths(), vec!["e.c.x", "e.c.y"]);
    }

    #[test]
    fn test_parse_locator_rejects_blank() {
        assert!(matches!(parse_locator("  "), Err(Error::InvalidRequest(_))));
        assert_eq!(
            parse_locator("https://host/run.jsonl").unwrap(),
            Locator::Http("https://host/run.jsonl".to_string())
        );
    }
}
