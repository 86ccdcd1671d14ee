//! Derivation jobs.
//!
//! A job reads each input metric with its own [`InputReader`] task, joins
//! them by tick in an [`Aligner`], runs the transform, and writes the result
//! as a new capture: a JSONL file under the derived directory, registered
//! like any other source, cached, and published on the control channel.
//!
//! At most one job writes a given output capture. Starting a job for an
//! output that already has one running cancels the old job and waits for it
//! to finish before the new one opens the file.

use super::align::{AlignedRow, Aligner};
use super::input::{InputEvent, InputReader, InputSpec, WriterProbe};
use super::transform::{DiffTransform, MovingAverage, Transform};
use crate::cache::FrameCache;
use crate::config::DeriveConfig;
use crate::control::{capture_append, capture_components, capture_end, capture_init, ControlChannel};
use crate::error::{Error, Result};
use crate::ingest::SourceReader;
use crate::plugin::PluginRegistry;
use crate::registry::CaptureRegistry;
use crate::types::{
    CaptureRecord, CaptureSource, DerivationGroup, JobInfo, JobKind, JobStatus, Locator,
    SourceOrigin,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Entity id every derived frame is written under.
pub const DERIVED_ENTITY: &str = "derived";

const INPUT_CHANNEL_DEPTH: usize = 64;

/// Request to start a job.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    pub group_id: String,
    #[serde(flatten)]
    pub kind: JobKind,
    #[serde(default)]
    pub output_capture_id: Option<String>,
}

struct JobHandle {
    info: Arc<Mutex<JobInfo>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Group definitions and running jobs.
pub struct DerivationJobs {
    config: DeriveConfig,
    derived_dir: PathBuf,
    inputs: InputReader,
    registry: Arc<CaptureRegistry>,
    cache: Arc<FrameCache>,
    channel: Arc<ControlChannel>,
    plugins: Arc<PluginRegistry>,
    groups: Mutex<BTreeMap<String, DerivationGroup>>,
    jobs: tokio::sync::Mutex<HashMap<String, JobHandle>>,
}

impl DerivationJobs {
    pub fn new(
        config: &DeriveConfig,
        derived_dir: impl Into<PathBuf>,
        reader: SourceReader,
        registry: Arc<CaptureRegistry>,
        cache: Arc<FrameCache>,
        channel: Arc<ControlChannel>,
        plugins: Arc<PluginRegistry>,
    ) -> Self {
        let probe_registry = Arc::clone(&registry);
        let probe: WriterProbe = Arc::new(move |capture_id: &str| probe_registry.is_growing(capture_id));
        let inputs = InputReader::new(
            reader,
            config.batch_lines,
            Duration::from_millis(config.input_poll_ms),
            probe,
        );
        Self {
            config: config.clone(),
            derived_dir: derived_dir.into(),
            inputs,
            registry,
            cache,
            channel,
            plugins,
            groups: Mutex::new(BTreeMap::new()),
            jobs: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    // ============================================
    // Groups
    // ============================================

    /// Add or replace a group definition.
    pub fn define_group(&self, group: DerivationGroup) -> Result<DerivationGroup> {
        group.validate().map_err(Error::InvalidRequest)?;
        if let Some(first) = group.derived_metrics.first() {
            if group
                .derived_metrics
                .iter()
                .any(|m| m.capture_id != first.capture_id)
            {
                return Err(Error::InvalidRequest(
                    "derived metrics must all belong to one output capture".to_string(),
                ));
            }
        }
        tracing::info!(
            group_id = %group.id,
            inputs = group.input_metrics.len(),
            "Defined derivation group"
        );
        lock(&self.groups).insert(group.id.clone(), group.clone());
        Ok(group)
    }

    pub fn group(&self, group_id: &str) -> Option<DerivationGroup> {
        lock(&self.groups).get(group_id).cloned()
    }

    pub fn groups(&self) -> Vec<DerivationGroup> {
        lock(&self.groups).values().cloned().collect()
    }

    // ============================================
    // Jobs
    // ============================================

    /// Start a job, superseding any job already writing the same output.
    pub async fn start(&self, request: JobRequest) -> Result<JobInfo> {
        let group = self.group(&request.group_id).ok_or_else(|| {
            Error::InvalidRequest(format!("unknown derivation group: {}", request.group_id))
        })?;

        let output_id = request
            .output_capture_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| group.derived_metrics.first().map(|m| m.capture_id.clone()))
            .unwrap_or_else(|| format!("derived-{}-{}", group.id, request.kind.as_str()));
        if group.input_metrics.iter().any(|m| m.capture_id == output_id) {
            return Err(Error::InvalidRequest(format!(
                "output capture {} is also an input",
                output_id
            )));
        }
        if group.derived_metrics.iter().any(|m| m.capture_id != output_id) {
            return Err(Error::InvalidRequest(format!(
                "group {} derives into a different capture than {}",
                group.id, output_id
            )));
        }
        if let Some(existing) = self.registry.get(&output_id) {
            if existing.origin != SourceOrigin::Derived {
                return Err(Error::InvalidRequest(format!(
                    "capture {} exists and is not a derived capture",
                    output_id
                )));
            }
        }

        let specs = group
            .input_metrics
            .iter()
            .enumerate()
            .map(|(index, metric)| {
                let source = self
                    .registry
                    .get(&metric.capture_id)
                    .ok_or_else(|| Error::CaptureNotFound(metric.capture_id.clone()))?;
                Ok(InputSpec {
                    index,
                    metric: metric.clone(),
                    locator: Locator::parse(&source.locator),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let transform = self.build_transform(&request.kind, &group, specs.len())?;

        let mut jobs = self.jobs.lock().await;
        if let Some(mut prior) = jobs.remove(&output_id) {
            if !prior.task.is_finished() {
                tracing::info!(output = %output_id, "Superseding running derivation job");
            }
            halt(&mut prior).await;
        }

        let output_path = output_path(&self.derived_dir, &output_id);
        let mut output = CaptureSource::new(
            &output_id,
            &output_path.to_string_lossy(),
            SourceOrigin::Derived,
        );
        output.display_name = group.name.clone();
        // Registered before the task starts so chained jobs see it growing
        self.registry.register(output.clone())?;

        let info = JobInfo {
            job_id: uuid::Uuid::new_v4().to_string(),
            kind: request.kind.clone(),
            group_id: group.id.clone(),
            output_capture_id: output_id.clone(),
            status: JobStatus::Running,
            error: None,
            ticks_emitted: 0,
            started_at: Utc::now(),
            finished_at: None,
        };
        let shared = Arc::new(Mutex::new(info.clone()));

        let run = JobRun {
            group,
            output,
            output_path,
            specs,
            transform,
            inputs: self.inputs.clone(),
            registry: Arc::clone(&self.registry),
            cache: Arc::clone(&self.cache),
            channel: Arc::clone(&self.channel),
            info: Arc::clone(&shared),
            last_tick: None,
        };
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run.run(cancel.clone()));

        tracing::info!(
            job_id = %info.job_id,
            kind = info.kind.as_str(),
            output = %output_id,
            "Started derivation job"
        );
        jobs.insert(
            output_id,
            JobHandle {
                info: shared,
                cancel,
                task,
            },
        );
        Ok(info)
    }

    fn build_transform(
        &self,
        kind: &JobKind,
        group: &DerivationGroup,
        inputs: usize,
    ) -> Result<Box<dyn Transform>> {
        let key = group
            .derived_metrics
            .first()
            .and_then(|m| m.path.last().cloned());
        match kind {
            JobKind::Diff => {
                if inputs != 2 {
                    return Err(Error::InvalidRequest(format!(
                        "diff takes exactly 2 input metrics, group has {}",
                        inputs
                    )));
                }
                let key = key.unwrap_or_else(|| DiffTransform::DEFAULT_KEY.to_string());
                Ok(Box::new(DiffTransform::new(key)))
            }
            JobKind::MovingAverage { window } => {
                if inputs != 1 {
                    return Err(Error::InvalidRequest(format!(
                        "moving_average takes exactly 1 input metric, group has {}",
                        inputs
                    )));
                }
                let window = if *window == 0 {
                    self.config.default_window
                } else {
                    *window
                };
                let key = key.unwrap_or_else(|| MovingAverage::DEFAULT_KEY.to_string());
                Ok(Box::new(MovingAverage::new(window, key)))
            }
            JobKind::Plugin { plugin_id } => {
                let plugin_id = if plugin_id.is_empty() {
                    group.plugin_id.clone().ok_or_else(|| {
                        Error::InvalidRequest("plugin job needs a plugin_id".to_string())
                    })?
                } else {
                    plugin_id.clone()
                };
                Ok(Box::new(self.plugins.instantiate(&plugin_id, inputs)?))
            }
        }
    }

    /// Cancel the job writing `output_id` and wait for it. False if none was running.
    pub async fn stop(&self, output_id: &str) -> bool {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(output_id) {
            Some(handle) if !handle.task.is_finished() => {
                halt(handle).await;
                true
            }
            _ => false,
        }
    }

    /// Stop and forget the job for a removed output capture.
    pub async fn remove(&self, output_id: &str) {
        let handle = self.jobs.lock().await.remove(output_id);
        if let Some(mut handle) = handle {
            halt(&mut handle).await;
        }
    }

    /// Stop every job and drop all jobs and groups.
    pub async fn clear(&self) {
        let handles: Vec<JobHandle> = self.jobs.lock().await.drain().map(|(_, h)| h).collect();
        for mut handle in handles {
            halt(&mut handle).await;
        }
        lock(&self.groups).clear();
    }

    pub async fn stop_all(&self) {
        let mut jobs = self.jobs.lock().await;
        for handle in jobs.values_mut() {
            halt(handle).await;
        }
    }

    pub async fn get(&self, output_id: &str) -> Option<JobInfo> {
        self.jobs
            .lock()
            .await
            .get(output_id)
            .map(|h| lock(&h.info).clone())
    }

    /// Every job, oldest first.
    pub async fn list(&self) -> Vec<JobInfo> {
        let jobs = self.jobs.lock().await;
        let mut out: Vec<JobInfo> = jobs.values().map(|h| lock(&h.info).clone()).collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }

    /// True while a job is writing `output_id`.
    pub async fn is_running(&self, output_id: &str) -> bool {
        self.jobs
            .lock()
            .await
            .get(output_id)
            .is_some_and(|h| !h.task.is_finished())
    }
}

async fn halt(handle: &mut JobHandle) {
    handle.cancel.cancel();
    if handle.task.is_finished() {
        return;
    }
    if let Err(e) = (&mut handle.task).await {
        tracing::warn!(error = %e, "Derivation task did not shut down cleanly");
    }
}

/// Output ids become file names; anything outside `[A-Za-z0-9._-]` is replaced.
fn file_stem(output_id: &str) -> String {
    output_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Everything one job owns while it runs.
struct JobRun {
    group: DerivationGroup,
    output: CaptureSource,
    output_path: PathBuf,
    specs: Vec<InputSpec>,
    transform: Box<dyn Transform>,
    inputs: InputReader,
    registry: Arc<CaptureRegistry>,
    cache: Arc<FrameCache>,
    channel: Arc<ControlChannel>,
    info: Arc<Mutex<JobInfo>>,
    last_tick: Option<u64>,
}

impl JobRun {
    async fn run(mut self, cancel: CancellationToken) {
        let result = self.execute(&cancel).await;
        let output_id = self.output.capture_id.clone();

        let (status, reason, error) = match result {
            Ok(()) => (JobStatus::Completed, "complete", None),
            Err(e) if e.is_cancelled() => (JobStatus::Stopped, "stopped", None),
            Err(e) => (JobStatus::Failed, "error", Some(e.to_string())),
        };

        self.registry.mark_ended(&output_id, reason);
        self.channel
            .publish(&capture_end(&output_id, reason, self.last_tick));

        let mut info = lock(&self.info);
        info.status = status;
        info.error = error.clone();
        info.finished_at = Some(Utc::now());
        match error {
            Some(error) => tracing::warn!(
                job_id = %info.job_id,
                output = %output_id,
                error = %error,
                "Derivation job failed"
            ),
            None => tracing::info!(
                job_id = %info.job_id,
                output = %output_id,
                status = status.as_str(),
                ticks = info.ticks_emitted,
                "Derivation job finished"
            ),
        }
    }

    async fn execute(&mut self, cancel: &CancellationToken) -> Result<()> {
        // Announced first so a failure below still ends a known capture
        let output_id = self.output.capture_id.clone();
        self.cache.reset(&output_id);
        self.channel.publish(&capture_init(&self.output, true));

        if let Some(parent) = self.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&self.output_path).await?;
        let mut writer = BufWriter::new(file);

        let (tx, mut rx) = mpsc::channel(INPUT_CHANNEL_DEPTH);
        // Input readers stop when the job returns, whichever way
        let input_cancel = cancel.child_token();
        let _stop_inputs = input_cancel.clone().drop_guard();
        for spec in &self.specs {
            self.inputs
                .spawn(spec.clone(), input_cancel.clone(), tx.clone());
        }
        drop(tx);

        let mut aligner = Aligner::new(self.specs.len());
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                event = rx.recv() => event,
            };
            match event {
                Some(InputEvent::Points { input, points }) => {
                    for (tick, value) in points {
                        aligner.push(input, tick, value);
                    }
                }
                Some(InputEvent::Done { input }) => aligner.finish(input),
                Some(InputEvent::Failed { input, message }) => {
                    let metric = self
                        .specs
                        .get(input)
                        .map(|s| s.metric.to_string())
                        .unwrap_or_default();
                    return Err(Error::Derivation(format!(
                        "input {} failed: {}",
                        metric, message
                    )));
                }
                None => break,
            }

            let rows = aligner.drain_ready();
            if !rows.is_empty() {
                self.emit(rows, &mut writer).await?;
            }
            if aligner.is_finished() {
                break;
            }
        }

        if aligner.late_points() > 0 {
            tracing::debug!(output = %output_id, late = aligner.late_points(), "Dropped late input points");
        }
        writer.flush().await?;
        Ok(())
    }

    async fn emit(&mut self, rows: Vec<AlignedRow>, writer: &mut BufWriter<tokio::fs::File>) -> Result<()> {
        let output_id = self.output.capture_id.clone();
        let mut frames = Vec::with_capacity(rows.len());
        for row in rows {
            let values = self.transform.update(row.tick, &row.values);
            let mut body = Map::new();
            for (key, value) in self.transform.output_keys().iter().zip(values) {
                body.insert(key.clone(), value.map_or(Value::Null, Value::from));
            }
            let mut frame = CaptureRecord::new(row.tick);
            frame.set(DERIVED_ENTITY, &self.group.name, Value::Object(body));

            writer
                .write_all(serde_json::to_string(&frame)?.as_bytes())
                .await?;
            writer.write_all(b"\n").await?;
            frames.push(frame);
        }
        writer.flush().await?;

        for frame in &frames {
            self.cache.insert(&output_id, frame.clone());
        }
        if self.registry.observe_frames(&output_id, &frames) {
            let nodes = self.registry.components(&output_id);
            self.channel.publish(&capture_components(&output_id, &nodes));
        }
        self.channel.publish(&capture_append(&output_id, &frames));

        self.last_tick = frames.last().map(|f| f.tick).or(self.last_tick);
        lock(&self.info).ticks_emitted += frames.len() as u64;
        Ok(())
    }
}

/// Path of the output file for `output_id` under `derived_dir`.
pub fn output_path(derived_dir: &Path, output_id: &str) -> PathBuf {
    derived_dir.join(format!("{}.jsonl", file_stem(output_id)))
}
