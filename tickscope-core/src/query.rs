//! Series queries.
//!
//! Answered from the frame cache when it can, otherwise by re-scanning the
//! capture source. Every answer says whether it may be incomplete.

use crate::cache::FrameCache;
use crate::error::{Error, Result};
use crate::ingest::{scan_source, SourceReader};
use crate::registry::CaptureRegistry;
use crate::types::{CaptureRecord, Locator, MetricRef};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Where an answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesOrigin {
    Cache,
    Scan,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub tick: u64,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Series {
    pub path: String,
    pub points: Vec<SeriesPoint>,
}

/// Series for one capture.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesBatch {
    pub capture_id: String,
    pub series: Vec<Series>,
    pub origin: SeriesOrigin,
    /// The cache held a sample, or the capture is still growing
    pub partial: bool,
    /// Frames the cache had seen (for cache answers) or the scan read
    pub frame_count: u64,
}

/// Fetch one series per dotted path.
///
/// With `prefer_cache`, any cached history is returned as is, flagged
/// partial when sampled. Without it, a sampled cache falls back to a full
/// scan of the source.
pub async fn series(
    registry: &CaptureRegistry,
    cache: &FrameCache,
    reader: &SourceReader,
    capture_id: &str,
    paths: &[String],
    prefer_cache: bool,
    cancel: &CancellationToken,
) -> Result<SeriesBatch> {
    let source = registry
        .get(capture_id)
        .ok_or_else(|| Error::CaptureNotFound(capture_id.to_string()))?;
    let metrics = paths
        .iter()
        .map(|p| {
            MetricRef::parse_path(p)
                .map(|path| MetricRef {
                    capture_id: capture_id.to_string(),
                    path,
                })
                .ok_or_else(|| {
                    Error::InvalidRequest(format!("metric path needs entity and component: {}", p))
                })
        })
        .collect::<Result<Vec<_>>>()?;
    if metrics.is_empty() {
        return Err(Error::InvalidRequest("no metric paths requested".to_string()));
    }
    let growing = registry.is_growing(capture_id);

    if let Some(snapshot) = cache.snapshot(capture_id) {
        if prefer_cache || !snapshot.lossy {
            let mut collector = Collector::new(&metrics);
            for frame in &snapshot.frames {
                collector.push(frame);
            }
            tracing::debug!(
                capture_id,
                frames = snapshot.frames.len(),
                lossy = snapshot.lossy,
                "Series served from cache"
            );
            return Ok(collector.finish(
                capture_id,
                SeriesOrigin::Cache,
                snapshot.partial || growing,
                snapshot.frame_count,
            ));
        }
    }

    let locator = Locator::parse(&source.locator);
    let mut collector = Collector::new(&metrics);
    let summary = scan_source(reader, &locator, cancel, |frame| collector.push(&frame)).await?;
    tracing::debug!(capture_id, frames = summary.frames, "Series served from source scan");
    Ok(collector.finish(capture_id, SeriesOrigin::Scan, growing, summary.frames))
}

struct Collector<'a> {
    metrics: &'a [MetricRef],
    points: Vec<Vec<SeriesPoint>>,
}

impl<'a> Collector<'a> {
    fn new(metrics: &'a [MetricRef]) -> Self {
        Self {
            metrics,
            points: vec![Vec::new(); metrics.len()],
        }
    }

    fn push(&mut self, frame: &CaptureRecord) {
        for (metric, points) in self.metrics.iter().zip(self.points.iter_mut()) {
            points.push(SeriesPoint {
                tick: frame.tick,
                value: metric.extract(frame),
            });
        }
    }

    fn finish(
        self,
        capture_id: &str,
        origin: SeriesOrigin,
        partial: bool,
        frame_count: u64,
    ) -> SeriesBatch {
        SeriesBatch {
            capture_id: capture_id.to_string(),
            series: self
                .metrics
                .iter()
                .zip(self.points)
                .map(|(metric, points)| Series {
                    path: metric.dotted_path(),
                    points,
                })
                .collect(),
            origin,
            partial,
            frame_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use crate::db::Database;
    use crate::types::{CaptureSource, SourceOrigin};
    use std::io::Write;
    use std::sync::Arc;

    fn frame(tick: u64, v: f64) -> CaptureRecord {
        let mut f = CaptureRecord::new(tick);
        f.set("e", "c", serde_json::json!({ "v": v }));
        f
    }

    fn setup(ticks: u64) -> (tempfile::NamedTempFile, CaptureRegistry, SourceReader) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for t in 1..=ticks {
            writeln!(file, "{}", serde_json::to_string(&frame(t, t as f64)).unwrap()).unwrap();
        }
        file.flush().unwrap();
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let registry = CaptureRegistry::new(Arc::new(db));
        registry
            .register(CaptureSource::new(
                "cap",
                &file.path().to_string_lossy(),
                SourceOrigin::File,
            ))
            .unwrap();
        registry.mark_ended("cap", "complete");
        let reader = SourceReader::new(&IngestConfig::default()).unwrap();
        (file, registry, reader)
    }

    #[tokio::test]
    async fn test_scan_when_not_cached() {
        let (_file, registry, reader) = setup(4);
        let cache = FrameCache::with_budget(1 << 20, 64);
        let batch = series(
            &registry,
            &cache,
            &reader,
            "cap",
            &["e.c.v".to_string()],
            true,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(batch.origin, SeriesOrigin::Scan);
        assert!(!batch.partial);
        let values: Vec<Option<f64>> = batch.series[0].points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0)]);
    }

    #[tokio::test]
    async fn test_lossy_cache_falls_back_unless_preferred() {
        let (_file, registry, reader) = setup(200);
        // Small enough that the cache must sample
        let cache = FrameCache::with_budget(4_000, 8);
        for t in 1..=200 {
            cache.insert("cap", frame(t, t as f64));
        }
        let cancel = CancellationToken::new();
        let paths = ["e.c.v".to_string()];

        let cached = series(&registry, &cache, &reader, "cap", &paths, true, &cancel)
            .await
            .unwrap();
        assert_eq!(cached.origin, SeriesOrigin::Cache);
        assert!(cached.partial);
        assert!(cached.series[0].points.len() < 200);

        let full = series(&registry, &cache, &reader, "cap", &paths, false, &cancel)
            .await
            .unwrap();
        assert_eq!(full.origin, SeriesOrigin::Scan);
        assert_eq!(full.series[0].points.len(), 200);
    }

    #[tokio::test]
    async fn test_bad_requests() {
        let (_file, registry, reader) = setup(1);
        let cache = FrameCache::with_budget(1 << 20, 64);
        let cancel = CancellationToken::new();
        assert!(matches!(
            series(&registry, &cache, &reader, "nope", &["e.c".into()], true, &cancel).await,
            Err(Error::CaptureNotFound(_))
        ));
        assert!(matches!(
            series(&registry, &cache, &reader, "cap", &["e".into()], true, &cancel).await,
            Err(Error::InvalidRequest(_))
        ));
    }
}
