//! Bounded per-capture frame cache.
//!
//! Each capture keeps two collections:
//!
//! - **samples**: every frame whose ordinal is a multiple of the stride
//! - **tail**: the most recent frames at full resolution
//!
//! All captures share one byte budget. A capture's allotment is
//! `budget / active captures`; when it shrinks, the stride doubles (the sample
//! set is re-filtered, never back-filled) and the tail is shortened until the
//! capture fits again.

use crate::config::CacheConfig;
use crate::types::CaptureRecord;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// A frame held by the cache.
#[derive(Debug, Clone)]
pub struct CachedFrame {
    pub frame: CaptureRecord,
    pub ordinal: u64,
    pub size: usize,
}

impl CachedFrame {
    fn new(frame: CaptureRecord, ordinal: u64) -> Self {
        let size = frame.approx_size();
        Self {
            frame,
            ordinal,
            size,
        }
    }
}

/// History of one capture as currently held.
#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    /// Union of samples and tail, deduplicated by tick, ascending
    pub frames: Vec<CaptureRecord>,
    /// Frames ever inserted for this capture (after same-tick merging)
    pub frame_count: u64,
    /// Some inserted frames are no longer held
    pub lossy: bool,
    /// The answer may be incomplete (lossy, or the source is still growing)
    pub partial: bool,
    pub stride: u64,
    pub tail_len: usize,
    pub sample_len: usize,
}

/// Usage of one capture's allotment.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureUsage {
    pub capture_id: String,
    pub bytes: usize,
    pub allotment: usize,
    pub stride: u64,
    pub samples: usize,
    pub tail: usize,
}

/// Cache-wide usage report.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub budget_bytes: usize,
    pub active_captures: usize,
    pub used_bytes: usize,
    pub captures: Vec<CaptureUsage>,
}

#[derive(Debug)]
struct CaptureCache {
    next_ordinal: u64,
    stride: u64,
    tail_cap: usize,
    allotment: usize,
    samples: Vec<CachedFrame>,
    tail: VecDeque<CachedFrame>,
    sample_bytes: usize,
    tail_bytes: usize,
    seen_bytes: u64,
}

impl CaptureCache {
    fn new(allotment: usize, max_tail: usize) -> Self {
        Self {
            next_ordinal: 0,
            stride: 1,
            tail_cap: max_tail.max(1),
            allotment,
            samples: Vec::new(),
            tail: VecDeque::new(),
            sample_bytes: 0,
            tail_bytes: 0,
            seen_bytes: 0,
        }
    }

    fn bytes(&self) -> usize {
        self.sample_bytes + self.tail_bytes
    }

    fn avg_frame_size(&self) -> usize {
        if self.next_ordinal == 0 {
            return 0;
        }
        (self.seen_bytes / self.next_ordinal).max(1) as usize
    }

    fn insert(&mut self, frame: CaptureRecord, max_tail: usize) {
        // Same tick as the newest frame: merge instead of adding a frame
        if let Some(newest) = self.tail.back_mut() {
            if newest.frame.tick == frame.tick {
                let ordinal = newest.ordinal;
                let old_size = newest.size;
                newest.frame.merge(frame);
                newest.size = newest.frame.approx_size();
                let new_size = newest.size;
                let merged = newest.frame.clone();
                self.tail_bytes = self.tail_bytes + new_size - old_size;
                self.seen_bytes = self.seen_bytes + new_size as u64 - old_size as u64;

                if let Some(sample) = self.samples.last_mut().filter(|s| s.ordinal == ordinal) {
                    self.sample_bytes = self.sample_bytes + new_size - sample.size;
                    sample.frame = merged;
                    sample.size = new_size;
                }
                self.enforce(max_tail);
                return;
            }
        }

        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        let cached = CachedFrame::new(frame, ordinal);
        self.seen_bytes += cached.size as u64;

        if ordinal % self.stride == 0 {
            self.sample_bytes += cached.size;
            self.samples.push(cached.clone());
        }
        self.tail_bytes += cached.size;
        self.tail.push_back(cached);
        self.enforce(max_tail);
    }

    /// Recompute the tail capacity from the allotment and shrink until within it.
    fn enforce(&mut self, max_tail: usize) {
        let avg = self.avg_frame_size();
        if avg > 0 {
            self.tail_cap = (self.allotment / 2 / avg).clamp(1, max_tail.max(1));
        }

        while self.tail.len() > self.tail_cap {
            self.pop_tail();
        }

        // Keep samples to about half the allotment so history stays spread out
        while self.samples.len() > 1 && self.sample_bytes > self.allotment / 2 {
            self.coarsen();
        }

        while self.bytes() > self.allotment {
            if self.samples.len() > 1 {
                self.coarsen();
            } else if self.tail.len() > 1 {
                self.pop_tail();
            } else if !self.samples.is_empty() {
                self.samples.clear();
                self.sample_bytes = 0;
            } else if !self.tail.is_empty() {
                self.pop_tail();
            } else {
                break;
            }
        }
    }

    fn pop_tail(&mut self) {
        if let Some(evicted) = self.tail.pop_front() {
            self.tail_bytes -= evicted.size;
        }
    }

    /// Double the stride and drop samples that no longer fall on it.
    fn coarsen(&mut self) {
        self.stride = self.stride.saturating_mul(2);
        let stride = self.stride;
        self.samples.retain(|s| s.ordinal % stride == 0);
        self.sample_bytes = self.samples.iter().map(|s| s.size).sum();
    }

    fn snapshot(&self) -> CacheSnapshot {
        let mut by_tick: BTreeMap<u64, &CachedFrame> = BTreeMap::new();
        for cached in self.samples.iter().chain(self.tail.iter()) {
            by_tick.insert(cached.frame.tick, cached);
        }

        let mut held: Vec<u64> = self
            .samples
            .iter()
            .chain(self.tail.iter())
            .map(|c| c.ordinal)
            .collect();
        held.sort_unstable();
        held.dedup();
        let lossy = (held.len() as u64) < self.next_ordinal;

        CacheSnapshot {
            frames: by_tick.into_values().map(|c| c.frame.clone()).collect(),
            frame_count: self.next_ordinal,
            lossy,
            partial: lossy,
            stride: self.stride,
            tail_len: self.tail.len(),
            sample_len: self.samples.len(),
        }
    }
}

#[derive(Debug)]
struct CacheInner {
    captures: HashMap<String, CaptureCache>,
}

/// Frame cache shared by all captures under one byte budget.
#[derive(Debug)]
pub struct FrameCache {
    budget: usize,
    max_tail: usize,
    inner: Mutex<CacheInner>,
}

impl FrameCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_budget(config.budget_bytes as usize, config.tail_frames)
    }

    pub fn with_budget(budget: usize, max_tail: usize) -> Self {
        Self {
            budget,
            max_tail: max_tail.max(1),
            inner: Mutex::new(CacheInner {
                captures: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert one frame, creating the capture's cache on first use.
    pub fn insert(&self, capture_id: &str, frame: CaptureRecord) {
        let mut inner = self.lock();
        if !inner.captures.contains_key(capture_id) {
            inner.captures.insert(
                capture_id.to_string(),
                CaptureCache::new(self.budget, self.max_tail),
            );
            self.rebalance(&mut inner);
        }
        if let Some(cache) = inner.captures.get_mut(capture_id) {
            cache.insert(frame, self.max_tail);
        }
    }

    /// Discard a capture's frames but keep it active.
    pub fn reset(&self, capture_id: &str) {
        let mut inner = self.lock();
        let created = inner
            .captures
            .insert(
                capture_id.to_string(),
                CaptureCache::new(self.budget, self.max_tail),
            )
            .is_none();
        self.rebalance(&mut inner);
        if created {
            tracing::debug!(capture_id, "Cache created on reset");
        }
    }

    /// Forget a capture entirely; the others get a larger share.
    pub fn remove(&self, capture_id: &str) -> bool {
        let mut inner = self.lock();
        let removed = inner.captures.remove(capture_id).is_some();
        if removed {
            self.rebalance(&mut inner);
        }
        removed
    }

    pub fn clear(&self) {
        self.lock().captures.clear();
    }

    pub fn contains(&self, capture_id: &str) -> bool {
        self.lock().captures.contains_key(capture_id)
    }

    /// Held history for a capture, or `None` if the capture is not cached.
    pub fn snapshot(&self, capture_id: &str) -> Option<CacheSnapshot> {
        self.lock().captures.get(capture_id).map(CaptureCache::snapshot)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let mut captures: Vec<CaptureUsage> = inner
            .captures
            .iter()
            .map(|(id, c)| CaptureUsage {
                capture_id: id.clone(),
                bytes: c.bytes(),
                allotment: c.allotment,
                stride: c.stride,
                samples: c.samples.len(),
                tail: c.tail.len(),
            })
            .collect();
        captures.sort_by(|a, b| a.capture_id.cmp(&b.capture_id));
        CacheStats {
            budget_bytes: self.budget,
            active_captures: inner.captures.len(),
            used_bytes: captures.iter().map(|c| c.bytes).sum(),
            captures,
        }
    }

    /// Hand every capture its share of the budget and shrink those now over it.
    ///
    /// Best effort per capture; nothing is assumed atomic across captures.
    fn rebalance(&self, inner: &mut CacheInner) {
        let active = inner.captures.len().max(1);
        let allotment = self.budget / active;
        for cache in inner.captures.values_mut() {
            cache.allotment = allotment;
            cache.enforce(self.max_tail);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(tick: u64) -> CaptureRecord {
        let mut record = CaptureRecord::new(tick);
        record.set("e", "c", json!({"v": tick, "pad": "xxxxxxxxxxxxxxxx"}));
        record
    }

    #[test]
    fn test_small_capture_is_complete() {
        let cache = FrameCache::with_budget(1 << 20, 64);
        for tick in 1..=10 {
            cache.insert("a", frame(tick));
        }
        let snap = cache.snapshot("a").unwrap();
        assert_eq!(snap.frames.len(), 10);
        assert!(!snap.lossy);
        assert_eq!(snap.stride, 1);
        let ticks: Vec<u64> = snap.frames.iter().map(|f| f.tick).collect();
        assert_eq!(ticks, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_same_tick_merges_into_newest() {
        let cache = FrameCache::with_budget(1 << 20, 64);
        cache.insert("a", frame(1));
        let mut extra = CaptureRecord::new(1);
        extra.set("other", "c", json!(5));
        cache.insert("a", extra);

        let snap = cache.snapshot("a").unwrap();
        assert_eq!(snap.frames.len(), 1);
        assert_eq!(snap.frame_count, 1);
        assert_eq!(snap.frames[0].entities.len(), 2);
    }

    #[test]
    fn test_budget_holds_across_add_and_remove() {
        let frame_size = frame(1).approx_size();
        let budget = frame_size * 40;
        let cache = FrameCache::with_budget(budget, 16);

        for tick in 1..=200 {
            cache.insert("a", frame(tick));
            if tick == 50 {
                cache.insert("b", frame(1));
            }
            if tick == 120 {
                cache.insert("c", frame(1));
            }
            if tick == 160 {
                cache.remove("b");
            }
            let stats = cache.stats();
            for usage in &stats.captures {
                assert!(
                    usage.bytes <= budget / stats.active_captures,
                    "{} over allotment at tick {}",
                    usage.capture_id,
                    tick
                );
            }
        }

        let snap = cache.snapshot("a").unwrap();
        assert!(snap.lossy);
        assert!(snap.stride > 1);
        let ticks: Vec<u64> = snap.frames.iter().map(|f| f.tick).collect();
        let mut sorted = ticks.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(ticks, sorted);
        assert_eq!(*ticks.last().unwrap(), 200);
    }

    #[test]
    fn test_stride_never_shrinks() {
        let frame_size = frame(1).approx_size();
        let cache = FrameCache::with_budget(frame_size * 20, 8);
        let mut last_stride = 1;
        for tick in 1..=300 {
            cache.insert("a", frame(tick));
            let stride = cache.snapshot("a").unwrap().stride;
            assert!(stride >= last_stride);
            last_stride = stride;
        }
        // Removing a competitor enlarges the allotment but never re-densifies samples
        cache.insert("b", frame(1));
        cache.remove("b");
        assert!(cache.snapshot("a").unwrap().stride >= last_stride);
    }

    #[test]
    fn test_reset_and_remove() {
        let cache = FrameCache::with_budget(1 << 20, 64);
        cache.insert("a", frame(1));
        cache.reset("a");
        assert!(cache.snapshot("a").unwrap().frames.is_empty());
        assert!(cache.remove("a"));
        assert!(cache.snapshot("a").is_none());
        assert!(!cache.remove("a"));
    }
}
