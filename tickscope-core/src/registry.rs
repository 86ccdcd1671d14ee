//! Capture source registry.
//!
//! Maps capture ids to their source, discovered component shape, and
//! progress. Sources are written through to the database so they survive a
//! restart; shape and progress are rebuilt by re-reading the source.

use crate::db::Database;
use crate::error::Result;
use crate::ingest::ComponentTree;
use crate::types::{CaptureRecord, CaptureSource, ComponentNode};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Everything known about one capture.
#[derive(Debug, Clone)]
pub struct CaptureEntry {
    pub source: CaptureSource,
    pub tree: ComponentTree,
    pub last_tick: Option<u64>,
    pub frame_count: u64,
    pub ended: bool,
    pub end_reason: Option<String>,
}

impl CaptureEntry {
    fn new(source: CaptureSource) -> Self {
        Self {
            source,
            tree: ComponentTree::new(),
            last_tick: None,
            frame_count: 0,
            ended: false,
            end_reason: None,
        }
    }
}

/// Listing row for one capture.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureSummary {
    #[serde(flatten)]
    pub source: CaptureSource,
    pub last_tick: Option<u64>,
    pub frame_count: u64,
    pub ended: bool,
    pub end_reason: Option<String>,
    pub component_count: usize,
}

impl From<&CaptureEntry> for CaptureSummary {
    fn from(entry: &CaptureEntry) -> Self {
        Self {
            source: entry.source.clone(),
            last_tick: entry.last_tick,
            frame_count: entry.frame_count,
            ended: entry.ended,
            end_reason: entry.end_reason.clone(),
            component_count: entry.tree.node_count(),
        }
    }
}

/// Registry of known captures, backed by the `capture_sources` table.
pub struct CaptureRegistry {
    db: Arc<Database>,
    entries: Mutex<HashMap<String, CaptureEntry>>,
}

impl CaptureRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CaptureEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load persisted sources. Returns how many were restored.
    pub fn restore(&self) -> Result<usize> {
        let sources = self.db.list_capture_sources()?;
        let count = sources.len();
        let mut entries = self.lock();
        for source in sources {
            // Nothing writes a restored capture until its stream is re-armed
            entries
                .entry(source.capture_id.clone())
                .or_insert_with(|| CaptureEntry {
                    ended: true,
                    ..CaptureEntry::new(source)
                });
        }
        tracing::info!(count, "Restored capture sources");
        Ok(count)
    }

    /// Add or replace a capture source. Replacing discards shape and progress.
    pub fn register(&self, source: CaptureSource) -> Result<()> {
        self.db.upsert_capture_source(&source)?;
        tracing::debug!(
            capture_id = %source.capture_id,
            locator = %source.locator,
            origin = source.origin.as_str(),
            "Registered capture source"
        );
        self.lock()
            .insert(source.capture_id.clone(), CaptureEntry::new(source));
        Ok(())
    }

    pub fn get(&self, capture_id: &str) -> Option<CaptureSource> {
        self.lock().get(capture_id).map(|e| e.source.clone())
    }

    pub fn entry(&self, capture_id: &str) -> Option<CaptureEntry> {
        self.lock().get(capture_id).cloned()
    }

    pub fn contains(&self, capture_id: &str) -> bool {
        self.lock().contains_key(capture_id)
    }

    /// All captures, oldest first.
    pub fn list(&self) -> Vec<CaptureSummary> {
        let entries = self.lock();
        let mut out: Vec<CaptureSummary> = entries.values().map(CaptureSummary::from).collect();
        out.sort_by(|a, b| {
            a.source
                .created_at
                .cmp(&b.source.created_at)
                .then_with(|| a.source.capture_id.cmp(&b.source.capture_id))
        });
        out
    }

    pub fn remove(&self, capture_id: &str) -> Result<Option<CaptureSource>> {
        self.db.delete_capture_source(capture_id)?;
        Ok(self.lock().remove(capture_id).map(|e| e.source))
    }

    pub fn clear(&self) -> Result<()> {
        self.db.clear_captures()?;
        self.lock().clear();
        Ok(())
    }

    /// Fold frames into shape and progress. Returns true if the shape changed.
    pub fn observe_frames(&self, capture_id: &str, frames: &[CaptureRecord]) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(capture_id) else {
            return false;
        };
        let mut changed = false;
        for frame in frames {
            changed |= entry.tree.observe(frame);
            entry.last_tick = Some(entry.last_tick.map_or(frame.tick, |t| t.max(frame.tick)));
        }
        entry.frame_count += frames.len() as u64;
        entry.ended = false;
        changed
    }

    /// Replace the component tree with one reported by a live stream.
    pub fn set_components(&self, capture_id: &str, nodes: Vec<ComponentNode>) {
        if let Some(entry) = self.lock().get_mut(capture_id) {
            entry.tree = ComponentTree::from_nodes(nodes);
        }
    }

    /// Record progress reported by a live stream.
    pub fn advance(&self, capture_id: &str, last_tick: Option<u64>, frames: u64) {
        if let Some(entry) = self.lock().get_mut(capture_id) {
            entry.last_tick = last_tick.or(entry.last_tick);
            entry.frame_count += frames;
            entry.ended = false;
        }
    }

    /// Forget shape and progress after truncation or restart.
    pub fn reset_progress(&self, capture_id: &str) {
        if let Some(entry) = self.lock().get_mut(capture_id) {
            entry.tree.clear();
            entry.last_tick = None;
            entry.frame_count = 0;
            entry.ended = false;
            entry.end_reason = None;
        }
    }

    pub fn mark_ended(&self, capture_id: &str, reason: &str) {
        if let Some(entry) = self.lock().get_mut(capture_id) {
            entry.ended = true;
            entry.end_reason = Some(reason.to_string());
        }
    }

    /// Set whether the source is re-armed as a live stream after restart.
    pub fn set_live(&self, capture_id: &str, live: bool) -> Result<()> {
        self.db.set_capture_live(capture_id, live)?;
        if let Some(entry) = self.lock().get_mut(capture_id) {
            entry.source.live = live;
        }
        Ok(())
    }

    /// Sources flagged live, oldest first.
    pub fn persisted_live_sources(&self) -> Vec<CaptureSource> {
        self.list()
            .into_iter()
            .map(|s| s.source)
            .filter(|s| s.live)
            .collect()
    }

    /// True while an ingest stream or derivation job is still writing the capture.
    pub fn is_growing(&self, capture_id: &str) -> bool {
        self.lock().get(capture_id).is_some_and(|e| !e.ended)
    }

    pub fn components(&self, capture_id: &str) -> Vec<ComponentNode> {
        self.lock()
            .get(capture_id)
            .map(|e| e.tree.nodes().to_vec())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceOrigin;
    use serde_json::json;

    fn registry() -> CaptureRegistry {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        CaptureRegistry::new(Arc::new(db))
    }

    #[test]
    fn test_register_restore_roundtrip() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.migrate().unwrap();

        let first = CaptureRegistry::new(Arc::clone(&db));
        let mut source = CaptureSource::new("run", "/data/run.jsonl", SourceOrigin::Live);
        source.live = true;
        first.register(source).unwrap();
        first
            .register(CaptureSource::new("up", "/data/up.jsonl", SourceOrigin::Upload))
            .unwrap();

        let second = CaptureRegistry::new(db);
        assert_eq!(second.restore().unwrap(), 2);
        assert!(second.contains("up"));
        assert!(!second.is_growing("run"));
        let live = second.persisted_live_sources();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].capture_id, "run");
    }

    #[test]
    fn test_progress_and_reset() {
        let registry = registry();
        registry
            .register(CaptureSource::new("c", "/x.jsonl", SourceOrigin::File))
            .unwrap();

        let mut frame = CaptureRecord::new(4);
        frame.set("e", "c", json!({"v": 1}));
        assert!(registry.observe_frames("c", &[frame.clone()]));
        assert!(!registry.observe_frames("c", &[frame]));

        let entry = registry.entry("c").unwrap();
        assert_eq!(entry.last_tick, Some(4));
        assert_eq!(entry.frame_count, 2);

        registry.mark_ended("c", "idle");
        assert!(registry.entry("c").unwrap().ended);

        registry.reset_progress("c");
        let entry = registry.entry("c").unwrap();
        assert!(entry.tree.is_empty());
        assert_eq!(entry.last_tick, None);
        assert!(!entry.ended);
    }

    #[test]
    fn test_remove_and_clear() {
        let registry = registry();
        registry
            .register(CaptureSource::new("a", "/a", SourceOrigin::File))
            .unwrap();
        registry
            .register(CaptureSource::new("b", "/b", SourceOrigin::File))
            .unwrap();

        assert!(registry.remove("a").unwrap().is_some());
        assert!(registry.remove("a").unwrap().is_none());
        registry.clear().unwrap();
        assert!(registry.list().is_empty());
    }
}
