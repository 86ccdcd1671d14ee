//! Bounded buffers for messages held while no display is connected.
//!
//! Both buffers drop the oldest entries when full; producers never block.

use super::protocol::{capture_append, Envelope};
use crate::types::CaptureRecord;
use std::collections::{HashMap, VecDeque};

/// Fixed-capacity FIFO that evicts its oldest entry on overflow.
#[derive(Debug, Clone)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
    dropped: u64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Append an item, returning the evicted oldest one on overflow.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.dropped += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Remove and return everything, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[derive(Debug, Default)]
struct CaptureBuffer {
    /// Sequence number of first appearance, for replay order
    first_seen: u64,
    init: Option<Envelope>,
    components: Option<Envelope>,
    /// `(sequence, frame)` oldest first
    frames: VecDeque<(u64, CaptureRecord)>,
    last_tick: Option<u64>,
    end: Option<Envelope>,
}

/// Per-capture lifecycle buffers with a per-capture and a global frame cap.
#[derive(Debug)]
pub struct CaptureBuffers {
    per_capture_cap: usize,
    total_cap: usize,
    total_frames: usize,
    seq: u64,
    buffers: HashMap<String, CaptureBuffer>,
    dropped: u64,
}

impl CaptureBuffers {
    pub fn new(per_capture_cap: usize, total_cap: usize) -> Self {
        Self {
            per_capture_cap: per_capture_cap.max(1),
            total_cap: total_cap.max(1),
            total_frames: 0,
            seq: 0,
            buffers: HashMap::new(),
            dropped: 0,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Record one capture lifecycle message.
    pub fn record(&mut self, envelope: &Envelope) {
        let Some(capture_id) = envelope.capture_id().map(str::to_string) else {
            return;
        };
        let seq = self.next_seq();
        let buffer = self
            .buffers
            .entry(capture_id.clone())
            .or_insert_with(|| CaptureBuffer {
                first_seen: seq,
                ..CaptureBuffer::default()
            });

        match envelope.kind.as_str() {
            "capture_init" => {
                // A new init starts a new epoch for this capture
                self.total_frames -= buffer.frames.len();
                buffer.frames.clear();
                buffer.components = None;
                buffer.end = None;
                buffer.last_tick = None;
                buffer.init = Some(envelope.clone());
            }
            "capture_components" => buffer.components = Some(envelope.clone()),
            "capture_tick" => {
                if let Some(tick) = envelope.get("tick").and_then(|t| t.as_u64()) {
                    buffer.last_tick = Some(tick);
                }
            }
            "capture_end" => buffer.end = Some(envelope.clone()),
            "capture_append" => {
                let frames: Vec<CaptureRecord> = envelope
                    .get("frames")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                for frame in frames {
                    buffer.last_tick = Some(frame.tick);
                    self.seq += 1;
                    buffer.frames.push_back((self.seq, frame));
                    self.total_frames += 1;
                    if buffer.frames.len() > self.per_capture_cap {
                        buffer.frames.pop_front();
                        self.total_frames -= 1;
                        self.dropped += 1;
                    }
                }
            }
            _ => {}
        }

        while self.total_frames > self.total_cap {
            self.evict_oldest_frame();
        }
    }

    /// Drop the globally oldest buffered frame.
    fn evict_oldest_frame(&mut self) {
        let oldest = self
            .buffers
            .iter()
            .filter_map(|(id, b)| b.frames.front().map(|(seq, _)| (*seq, id.clone())))
            .min();
        match oldest.and_then(|(_, id)| self.buffers.get_mut(&id)) {
            Some(buffer) => {
                buffer.frames.pop_front();
                self.total_frames -= 1;
                self.dropped += 1;
            }
            None => self.total_frames = 0,
        }
    }

    pub fn contains(&self, capture_id: &str) -> bool {
        self.buffers.contains_key(capture_id)
    }

    pub fn frame_count(&self) -> usize {
        self.total_frames
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn remove(&mut self, capture_id: &str) {
        if let Some(buffer) = self.buffers.remove(capture_id) {
            self.total_frames -= buffer.frames.len();
        }
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
        self.total_frames = 0;
    }

    /// Take everything buffered as a replay sequence.
    ///
    /// Per capture, in order of first appearance: init, components, appends
    /// in chunks of `batch` frames (or the last tick when no frames survived),
    /// then end if the capture had ended. Returns the replayed capture ids too.
    pub fn drain(&mut self, batch: usize) -> (Vec<Envelope>, Vec<String>) {
        let mut buffers: Vec<(String, CaptureBuffer)> = self.buffers.drain().collect();
        buffers.sort_by_key(|(_, b)| b.first_seen);
        self.total_frames = 0;

        let mut out = Vec::new();
        let mut ids = Vec::with_capacity(buffers.len());
        for (capture_id, buffer) in buffers {
            out.extend(buffer.init);
            out.extend(buffer.components);
            let frames: Vec<CaptureRecord> = buffer.frames.into_iter().map(|(_, f)| f).collect();
            if frames.is_empty() {
                if let Some(tick) = buffer.last_tick {
                    out.push(super::protocol::capture_tick(&capture_id, tick));
                }
            }
            for chunk in frames.chunks(batch.max(1)) {
                out.push(capture_append(&capture_id, chunk));
            }
            out.extend(buffer.end);
            ids.push(capture_id);
        }
        (out, ids)
    }
}
