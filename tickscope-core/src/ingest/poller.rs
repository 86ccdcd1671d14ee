//! Live stream polling.
//!
//! Each live capture gets one [`LiveStream`] task. A poll reads whatever was
//! appended since the last byte offset, assembles frames, feeds the frame
//! cache, and reports to the store through [`LiveEvent`]s. A source that
//! stops growing for longer than the idle limit ends the stream.
//!
//! ```text
//!   start ──► polling ──(no new bytes)──► idle ──(limit)──► ended: idle
//!                ▲  │                      │
//!                │  └──(truncated)──► reset│
//!                └─────────(bytes)─────────┘
//! ```

use super::lines::{finish_remainder, read_lines};
use super::parser::{ComponentTree, FrameAssembler};
use super::source::SourceReader;
use crate::cache::FrameCache;
use crate::config::IngestConfig;
use crate::error::{Error, Result};
use crate::types::{CaptureRecord, CaptureSource, ComponentNode, Locator, StreamMode};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Why a live stream ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "message", rename_all = "snake_case")]
pub enum EndReason {
    /// One-shot read reached the end of the source
    Complete,
    /// No new bytes for longer than the idle limit
    Idle,
    /// Stopped on request
    Stopped,
    /// The source failed
    Error(String),
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Complete => "complete",
            EndReason::Idle => "idle",
            EndReason::Stopped => "stopped",
            EndReason::Error(_) => "error",
        }
    }
}

/// Notifications from live streams to the store.
#[derive(Debug, Clone)]
pub enum LiveEvent {
    /// A run began reading from offset zero
    Started { capture_id: String, generation: u64 },
    /// The source was truncated; consumers must drop prior history
    Reset { capture_id: String },
    /// Newly parsed frames, in tick order as read
    Frames {
        capture_id: String,
        frames: Vec<CaptureRecord>,
        mode: StreamMode,
        last_tick: Option<u64>,
    },
    /// The component tree changed
    Components {
        capture_id: String,
        nodes: Vec<ComponentNode>,
    },
    /// Terminal notification, sent exactly once per run
    Ended {
        capture_id: String,
        generation: u64,
        reason: EndReason,
        last_tick: Option<u64>,
        frame_count: u64,
    },
}

/// Whether a stream follows a growing source or reads it once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowMode {
    Follow,
    OneShot,
}

/// Per-stream progress.
#[derive(Debug, Clone, Serialize)]
pub struct LiveStreamState {
    pub capture_id: String,
    pub locator: String,
    pub poll_interval_ms: u64,
    pub byte_offset: u64,
    #[serde(skip)]
    pub partial_line_remainder: Vec<u8>,
    pub last_tick: Option<u64>,
    pub frame_count: u64,
    #[serde(skip)]
    pub idle_since: Option<Instant>,
    pub last_error: Option<String>,
}

impl LiveStreamState {
    fn new(capture_id: &str, locator: &str, poll_interval: Duration) -> Self {
        Self {
            capture_id: capture_id.to_string(),
            locator: locator.to_string(),
            poll_interval_ms: poll_interval.as_millis() as u64,
            byte_offset: 0,
            partial_line_remainder: Vec::new(),
            last_tick: None,
            frame_count: 0,
            idle_since: None,
            last_error: None,
        }
    }
}

/// Result of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// New bytes were read
    Progress { frames: usize, capped: bool },
    /// Nothing new
    Idle,
    /// The source shrank; state was reset to offset zero
    Truncated,
    /// A recoverable file error; patience applies
    RecoverableError,
}

/// Timing for one stream.
#[derive(Debug, Clone, Copy)]
pub struct PollSchedule {
    pub poll_interval: Duration,
    pub fast_poll: Duration,
    pub idle_limit: Duration,
    pub error_limit: Duration,
    pub max_lines: usize,
}

impl PollSchedule {
    pub fn from_config(config: &IngestConfig, poll_interval: Option<Duration>) -> Self {
        let poll_interval =
            poll_interval.unwrap_or_else(|| Duration::from_millis(config.poll_interval_ms));
        let idle_limit = config.idle_limit(poll_interval);
        Self {
            poll_interval,
            fast_poll: Duration::from_millis(config.fast_poll_ms).min(poll_interval),
            idle_limit,
            error_limit: idle_limit * config.error_patience_multiplier.max(1),
            max_lines: config.max_lines_per_poll,
        }
    }
}

/// One polled capture.
pub struct LiveStream {
    state: Arc<Mutex<LiveStreamState>>,
    locator: Locator,
    generation: u64,
    mode: StreamMode,
    follow: FollowMode,
    schedule: PollSchedule,
    reader: SourceReader,
    cache: Arc<FrameCache>,
    events: UnboundedSender<LiveEvent>,
    assembler: FrameAssembler,
    tree: ComponentTree,
}

impl LiveStream {
    pub fn new(
        source: &CaptureSource,
        schedule: PollSchedule,
        reader: SourceReader,
        cache: Arc<FrameCache>,
        events: UnboundedSender<LiveEvent>,
    ) -> Self {
        let state = LiveStreamState::new(&source.capture_id, &source.locator, schedule.poll_interval);
        Self {
            state: Arc::new(Mutex::new(state)),
            locator: Locator::parse(&source.locator),
            generation: 0,
            mode: source.stream_mode,
            follow: FollowMode::Follow,
            schedule,
            reader,
            cache,
            events,
            assembler: FrameAssembler::new(),
            tree: ComponentTree::new(),
        }
    }

    pub fn with_follow(mut self, follow: FollowMode) -> Self {
        self.follow = follow;
        self
    }

    fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Snapshot of the stream's progress.
    pub fn state(&self) -> LiveStreamState {
        lock(&self.state).clone()
    }

    fn shared_state(&self) -> Arc<Mutex<LiveStreamState>> {
        Arc::clone(&self.state)
    }

    fn capture_id(&self) -> String {
        lock(&self.state).capture_id.clone()
    }

    /// Read whatever is new since the last poll.
    pub async fn poll_once(&mut self, cancel: &CancellationToken) -> Result<PollOutcome> {
        let (offset, leftover) = {
            let mut state = lock(&self.state);
            (state.byte_offset, std::mem::take(&mut state.partial_line_remainder))
        };

        let mut read = match self.reader.open_from(&self.locator, offset).await {
            Ok(read) => read,
            Err(e) if e.is_recoverable_source() => {
                let mut state = lock(&self.state);
                state.partial_line_remainder = leftover;
                state.last_error = Some(e.to_string());
                state.idle_since.get_or_insert_with(Instant::now);
                tracing::debug!(capture_id = %state.capture_id, error = %e, "Source not readable yet");
                return Ok(PollOutcome::RecoverableError);
            }
            Err(e) => {
                lock(&self.state).partial_line_remainder = leftover;
                return Err(e);
            }
        };

        if read.truncated {
            self.reset_epoch();
            return Ok(PollOutcome::Truncated);
        }

        let mut frames = Vec::new();
        let saved = self.assembler.clone();
        let assembler = &mut self.assembler;
        let summary = match read_lines(
            &mut read.stream,
            leftover.clone(),
            Some(self.schedule.max_lines),
            cancel,
            |line| frames.extend(assembler.push_line(line)),
        )
        .await
        {
            Ok(summary) => summary,
            Err(e) => {
                // Nothing committed: the next poll repeats this range
                self.assembler = saved;
                lock(&self.state).partial_line_remainder = leftover;
                return Err(e);
            }
        };

        if read.stream.ended_short() {
            self.reset_epoch();
            return Ok(PollOutcome::Truncated);
        }

        // The newest tick stays in the assembler: more lines for it may follow
        let capture_id = self.capture_id();
        let frame_count = frames.len();
        let progressed = summary.bytes_read > 0 || summary.capped || !frames.is_empty();
        {
            let mut state = lock(&self.state);
            state.byte_offset += summary.bytes_read;
            state.partial_line_remainder = summary.remainder;
            state.last_error = None;
            if progressed {
                state.idle_since = None;
            } else {
                state.idle_since.get_or_insert_with(Instant::now);
            }
        }

        if !progressed {
            return Ok(PollOutcome::Idle);
        }

        self.deliver(&capture_id, frames);
        Ok(PollOutcome::Progress {
            frames: frame_count,
            capped: summary.capped,
        })
    }

    /// Cache frames and notify the store.
    fn deliver(&mut self, capture_id: &str, frames: Vec<CaptureRecord>) {
        if frames.is_empty() {
            return;
        }

        let mut tree_changed = false;
        for frame in &frames {
            tree_changed |= self.tree.observe(frame);
            self.cache.insert(capture_id, frame.clone());
        }

        let last_tick = {
            let mut state = lock(&self.state);
            for frame in &frames {
                state.last_tick = Some(state.last_tick.map_or(frame.tick, |t| t.max(frame.tick)));
            }
            state.frame_count += frames.len() as u64;
            state.last_tick
        };

        if tree_changed {
            let _ = self.events.send(LiveEvent::Components {
                capture_id: capture_id.to_string(),
                nodes: self.tree.nodes().to_vec(),
            });
        }
        let _ = self.events.send(LiveEvent::Frames {
            capture_id: capture_id.to_string(),
            frames,
            mode: self.mode,
            last_tick,
        });
    }

    /// Drop all progress after truncation and tell downstream to start over.
    fn reset_epoch(&mut self) {
        let capture_id = {
            let mut state = lock(&self.state);
            tracing::info!(
                capture_id = %state.capture_id,
                offset = state.byte_offset,
                "Source truncated, starting a new epoch"
            );
            state.byte_offset = 0;
            state.partial_line_remainder.clear();
            state.last_tick = None;
            state.frame_count = 0;
            state.idle_since = None;
            state.capture_id.clone()
        };
        self.assembler.clear();
        self.tree.clear();
        self.cache.reset(&capture_id);
        let _ = self.events.send(LiveEvent::Reset { capture_id });
    }

    /// Deliver the frame still held in the assembler.
    fn flush_pending(&mut self) {
        let frames: Vec<CaptureRecord> = self.assembler.flush().into_iter().collect();
        let capture_id = self.capture_id();
        self.deliver(&capture_id, frames);
    }

    /// Flush a final line written without a newline and any pending frame.
    fn finish(&mut self) {
        let remainder = std::mem::take(&mut lock(&self.state).partial_line_remainder);
        let mut frames = Vec::new();
        let assembler = &mut self.assembler;
        finish_remainder(&remainder, |line| frames.extend(assembler.push_line(line)));
        frames.extend(self.assembler.flush());
        let capture_id = self.capture_id();
        self.deliver(&capture_id, frames);
    }

    /// Poll until idle, stopped, or failed. Sends exactly one `Ended` event.
    pub async fn run(mut self, cancel: CancellationToken) -> EndReason {
        let capture_id = self.capture_id();
        tracing::info!(
            capture_id = %capture_id,
            locator = %self.locator,
            interval_ms = self.schedule.poll_interval.as_millis() as u64,
            "Live stream started"
        );

        let _ = self.events.send(LiveEvent::Started {
            capture_id: capture_id.clone(),
            generation: self.generation,
        });

        let mut delay = Duration::ZERO;
        let reason = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break EndReason::Stopped,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.poll_once(&cancel).await {
                Ok(PollOutcome::Progress { .. }) | Ok(PollOutcome::Truncated) => {
                    delay = self.schedule.fast_poll;
                }
                Ok(PollOutcome::Idle) => {
                    if self.follow == FollowMode::OneShot {
                        break EndReason::Complete;
                    }
                    if self.idle_for() >= self.schedule.idle_limit {
                        break EndReason::Idle;
                    }
                    delay = self.schedule.poll_interval;
                }
                Ok(PollOutcome::RecoverableError) => {
                    if self.follow == FollowMode::OneShot
                        || self.idle_for() >= self.schedule.error_limit
                    {
                        let message = lock(&self.state)
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "source unavailable".to_string());
                        break EndReason::Error(message);
                    }
                    delay = self.schedule.poll_interval;
                }
                Err(Error::Cancelled) => break EndReason::Stopped,
                Err(e) => {
                    tracing::warn!(capture_id = %capture_id, error = %e, "Live stream failed");
                    lock(&self.state).last_error = Some(e.to_string());
                    break EndReason::Error(e.to_string());
                }
            }
        };

        match reason {
            EndReason::Idle | EndReason::Complete => self.finish(),
            _ => self.flush_pending(),
        }

        let (last_tick, frame_count) = {
            let state = lock(&self.state);
            (state.last_tick, state.frame_count)
        };
        tracing::info!(
            capture_id = %capture_id,
            reason = reason.as_str(),
            frames = frame_count,
            "Live stream ended"
        );
        let _ = self.events.send(LiveEvent::Ended {
            capture_id,
            generation: self.generation,
            reason: reason.clone(),
            last_tick,
            frame_count,
        });
        reason
    }

    fn idle_for(&self) -> Duration {
        lock(&self.state)
            .idle_since
            .map(|since| since.elapsed())
            .unwrap_or_default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct LiveHandle {
    generation: u64,
    cancel: CancellationToken,
    state: Arc<Mutex<LiveStreamState>>,
    follow: FollowMode,
    task: JoinHandle<EndReason>,
}

/// Status of one running stream, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct LiveStreamInfo {
    #[serde(flatten)]
    pub state: LiveStreamState,
    pub follow: FollowMode,
    pub running: bool,
}

/// Owns one polling task per capture.
pub struct LiveStreamManager {
    config: IngestConfig,
    reader: SourceReader,
    cache: Arc<FrameCache>,
    events: UnboundedSender<LiveEvent>,
    streams: tokio::sync::Mutex<HashMap<String, LiveHandle>>,
    next_generation: AtomicU64,
}

impl LiveStreamManager {
    pub fn new(
        config: IngestConfig,
        reader: SourceReader,
        cache: Arc<FrameCache>,
        events: UnboundedSender<LiveEvent>,
    ) -> Self {
        Self {
            config,
            reader,
            cache,
            events,
            streams: tokio::sync::Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Start polling `source`, replacing any stream already running for it.
    ///
    /// The capture's cache is reset: a (re)started stream reads from offset zero.
    /// Returns the run's generation number.
    pub async fn start(&self, source: &CaptureSource, follow: FollowMode) -> u64 {
        let mut streams = self.streams.lock().await;
        if let Some(prior) = streams.remove(&source.capture_id) {
            Self::shutdown(prior).await;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let schedule = PollSchedule::from_config(
            &self.config,
            source.poll_interval_ms.map(Duration::from_millis),
        );
        let stream = LiveStream::new(
            source,
            schedule,
            self.reader.clone(),
            Arc::clone(&self.cache),
            self.events.clone(),
        )
        .with_follow(follow)
        .with_generation(generation);

        self.cache.reset(&source.capture_id);
        let cancel = CancellationToken::new();
        let state = stream.shared_state();
        let task = tokio::spawn(stream.run(cancel.clone()));

        streams.insert(
            source.capture_id.clone(),
            LiveHandle {
                generation,
                cancel,
                state,
                follow,
                task,
            },
        );
        generation
    }

    /// Stop the stream for `capture_id`. Returns false if none was running.
    pub async fn stop(&self, capture_id: &str) -> bool {
        let handle = self.streams.lock().await.remove(capture_id);
        match handle {
            Some(handle) => {
                Self::shutdown(handle).await;
                true
            }
            None => false,
        }
    }

    /// Stop every stream.
    pub async fn stop_all(&self) {
        let handles: Vec<LiveHandle> = {
            let mut streams = self.streams.lock().await;
            streams.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            Self::shutdown(handle).await;
        }
    }

    async fn shutdown(handle: LiveHandle) {
        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            tracing::warn!(error = %e, "Live stream task did not shut down cleanly");
        }
    }

    /// Drop the handle of a run that ended on its own.
    ///
    /// Ignored when a newer run already replaced it.
    pub async fn forget(&self, capture_id: &str, generation: u64) {
        let mut streams = self.streams.lock().await;
        if streams
            .get(capture_id)
            .is_some_and(|h| h.generation == generation)
        {
            streams.remove(capture_id);
        }
    }

    /// Generation of the run currently registered for `capture_id`.
    pub async fn generation(&self, capture_id: &str) -> Option<u64> {
        self.streams.lock().await.get(capture_id).map(|h| h.generation)
    }

    pub async fn is_running(&self, capture_id: &str) -> bool {
        self.streams
            .lock()
            .await
            .get(capture_id)
            .is_some_and(|h| !h.task.is_finished())
    }

    pub async fn list(&self) -> Vec<LiveStreamInfo> {
        let streams = self.streams.lock().await;
        let mut out: Vec<LiveStreamInfo> = streams
            .values()
            .map(|h| LiveStreamInfo {
                state: lock(&h.state).clone(),
                follow: h.follow,
                running: !h.task.is_finished(),
            })
            .collect();
        out.sort_by(|a, b| a.state.capture_id.cmp(&b.state.capture_id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::types::SourceOrigin;
    use std::io::Write;
    use tokio::sync::mpsc;

    fn frame_line(tick: u64) -> String {
        format!(r#"{{"tick":{},"entities":{{"e":{{"c":{{"v":{}}}}}}}}}"#, tick, tick) + "\n"
    }

    fn stream_for(
        path: &std::path::Path,
        mode: StreamMode,
    ) -> (LiveStream, mpsc::UnboundedReceiver<LiveEvent>, Arc<FrameCache>) {
        let config = IngestConfig::default();
        let mut source = CaptureSource::new("cap", &path.to_string_lossy(), SourceOrigin::Live);
        source.stream_mode = mode;
        let cache = Arc::new(FrameCache::new(&CacheConfig::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = LiveStream::new(
            &source,
            PollSchedule::from_config(&config, Some(Duration::from_millis(10))),
            SourceReader::new(&config).unwrap(),
            Arc::clone(&cache),
            tx,
        );
        (stream, rx, cache)
    }

    fn drain_ticks(rx: &mut mpsc::UnboundedReceiver<LiveEvent>) -> Vec<u64> {
        let mut ticks = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let LiveEvent::Frames { frames, .. } = event {
                ticks.extend(frames.iter().map(|f| f.tick));
            }
        }
        ticks
    }

    #[tokio::test]
    async fn test_repoll_without_new_bytes_emits_nothing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all((frame_line(1) + &frame_line(2)).as_bytes()).unwrap();
        file.flush().unwrap();

        let (mut stream, mut rx, _cache) = stream_for(file.path(), StreamMode::Full);
        let cancel = CancellationToken::new();

        // Tick 2 is held until a later tick shows it is complete
        let outcome = stream.poll_once(&cancel).await.unwrap();
        assert_eq!(outcome, PollOutcome::Progress { frames: 1, capped: false });
        assert_eq!(drain_ticks(&mut rx), vec![1]);

        assert_eq!(stream.poll_once(&cancel).await.unwrap(), PollOutcome::Idle);
        assert!(drain_ticks(&mut rx).is_empty());

        file.write_all(frame_line(3).as_bytes()).unwrap();
        file.flush().unwrap();
        stream.poll_once(&cancel).await.unwrap();
        assert_eq!(drain_ticks(&mut rx), vec![2]);
        assert_eq!(stream.state().frame_count, 2);
    }

    #[tokio::test]
    async fn test_partial_line_waits_for_newline() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let line = frame_line(1);
        let (head, tail) = line.split_at(10);
        file.write_all(head.as_bytes()).unwrap();
        file.flush().unwrap();

        let (mut stream, mut rx, _cache) = stream_for(file.path(), StreamMode::Full);
        let cancel = CancellationToken::new();
        stream.poll_once(&cancel).await.unwrap();
        assert!(drain_ticks(&mut rx).is_empty());
        assert_eq!(stream.state().partial_line_remainder.len(), 10);

        file.write_all((tail.to_string() + &frame_line(2)).as_bytes()).unwrap();
        file.flush().unwrap();
        stream.poll_once(&cancel).await.unwrap();
        assert_eq!(drain_ticks(&mut rx), vec![1]);
    }

    #[tokio::test]
    async fn test_truncation_resets_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cap.jsonl");
        std::fs::write(&path, frame_line(5) + &frame_line(6) + &frame_line(7)).unwrap();

        let (mut stream, mut rx, cache) = stream_for(&path, StreamMode::Full);
        let cancel = CancellationToken::new();
        stream.poll_once(&cancel).await.unwrap();
        assert_eq!(drain_ticks(&mut rx), vec![5, 6]);

        std::fs::write(&path, frame_line(1) + &frame_line(2)).unwrap();
        assert_eq!(stream.poll_once(&cancel).await.unwrap(), PollOutcome::Truncated);
        assert!(matches!(rx.try_recv(), Ok(LiveEvent::Reset { .. })));
        assert!(cache.snapshot("cap").map_or(true, |s| s.frames.is_empty()));

        stream.poll_once(&cancel).await.unwrap();
        let mut resets = 0;
        let mut ticks = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                LiveEvent::Reset { .. } => resets += 1,
                LiveEvent::Frames { frames, .. } => ticks.extend(frames.iter().map(|f| f.tick)),
                _ => {}
            }
        }
        assert_eq!(resets, 0);
        assert_eq!(ticks, vec![1]);
    }

    #[tokio::test]
    async fn test_tick_split_across_polls_is_one_frame() {
        let record = |tick: u64, component: &str| {
            format!(
                r#"{{"tick":{},"entityId":"e","componentId":"{}","value":{}}}"#,
                tick, component, tick
            ) + "\n"
        };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(record(1, "a").as_bytes()).unwrap();
        file.flush().unwrap();

        let (mut stream, mut rx, _cache) = stream_for(file.path(), StreamMode::Full);
        let cancel = CancellationToken::new();
        stream.poll_once(&cancel).await.unwrap();
        assert!(drain_ticks(&mut rx).is_empty());

        file.write_all((record(1, "b") + &record(2, "a")).as_bytes()).unwrap();
        file.flush().unwrap();
        stream.poll_once(&cancel).await.unwrap();

        let mut frames = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let LiveEvent::Frames { frames: batch, .. } = event {
                frames.extend(batch);
            }
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].tick, 1);
        assert_eq!(frames[0].entities["e"].len(), 2);
    }

    #[tokio::test]
    async fn test_stop_delivers_held_frame() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all((frame_line(1) + &frame_line(2)).as_bytes()).unwrap();
        file.flush().unwrap();

        let (stream, mut rx, _cache) = stream_for(file.path(), StreamMode::Full);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(stream.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        assert_eq!(task.await.unwrap(), EndReason::Stopped);
        assert_eq!(drain_ticks(&mut rx), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_run_ends_idle_exactly_once() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(frame_line(1).as_bytes()).unwrap();
        file.flush().unwrap();

        let (mut stream, mut rx, _cache) = stream_for(file.path(), StreamMode::Lite);
        stream.schedule.idle_limit = Duration::from_millis(30);
        let reason = stream.run(CancellationToken::new()).await;
        assert_eq!(reason, EndReason::Idle);

        let mut ended = 0;
        while let Ok(event) = rx.try_recv() {
            if let LiveEvent::Ended { reason, last_tick, .. } = event {
                ended += 1;
                assert_eq!(reason, EndReason::Idle);
                assert_eq!(last_tick, Some(1));
            }
        }
        assert_eq!(ended, 1);
    }

    #[tokio::test]
    async fn test_missing_file_fails_after_patience() {
        let dir = tempfile::tempdir().unwrap();
        let (mut stream, _rx, _cache) = stream_for(&dir.path().join("never.jsonl"), StreamMode::Full);
        stream.schedule.error_limit = Duration::from_millis(20);
        match stream.run(CancellationToken::new()).await {
            EndReason::Error(message) => assert!(!message.is_empty()),
            other => panic!("expected error end, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_manager_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.jsonl");
        std::fs::write(&path, frame_line(1)).unwrap();

        let cache = Arc::new(FrameCache::new(&CacheConfig::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = IngestConfig::default();
        let manager = LiveStreamManager::new(
            config.clone(),
            SourceReader::new(&config).unwrap(),
            cache,
            tx,
        );
        let source = CaptureSource::new("live", &path.to_string_lossy(), SourceOrigin::Live);

        manager.start(&source, FollowMode::Follow).await;
        assert!(manager.is_running("live").await);
        assert!(manager.stop("live").await);
        assert!(!manager.stop("live").await);
        assert!(manager.list().await.is_empty());

        let mut ended = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let LiveEvent::Ended { reason, .. } = event {
                ended.push(reason);
            }
        }
        assert_eq!(ended, vec![EndReason::Stopped]);
    }
}
