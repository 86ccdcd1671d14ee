//! Tick alignment across independently paced inputs.
//!
//! Each input reports `(tick, value)` points in ascending tick order. A tick
//! is released once every input that is still running has reported that
//! tick or a later one. Released rows cover every tick any input reported,
//! starting from the earliest one; an input that did not report a given
//! tick contributes null there.

use std::collections::{BTreeMap, BTreeSet};

/// One aligned output row.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedRow {
    pub tick: u64,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Default)]
struct Lane {
    pending: BTreeMap<u64, Option<f64>>,
    watermark: Option<u64>,
    done: bool,
}

/// Joins input streams by tick.
#[derive(Debug)]
pub struct Aligner {
    lanes: Vec<Lane>,
    last_released: Option<u64>,
    late_points: u64,
}

impl Aligner {
    pub fn new(inputs: usize) -> Self {
        Self {
            lanes: (0..inputs).map(|_| Lane::default()).collect(),
            last_released: None,
            late_points: 0,
        }
    }

    pub fn inputs(&self) -> usize {
        self.lanes.len()
    }

    /// Record a value. A repeated tick overwrites; ticks at or before the
    /// last released row are dropped.
    pub fn push(&mut self, input: usize, tick: u64, value: Option<f64>) {
        if self.last_released.is_some_and(|t| tick <= t) {
            self.late_points += 1;
            return;
        }
        let Some(lane) = self.lanes.get_mut(input) else {
            return;
        };
        lane.pending.insert(tick, value);
        lane.watermark = Some(lane.watermark.map_or(tick, |w| w.max(tick)));
    }

    /// Mark an input as exhausted; it no longer holds back release.
    pub fn finish(&mut self, input: usize) {
        if let Some(lane) = self.lanes.get_mut(input) {
            lane.done = true;
        }
    }

    /// Every input is exhausted.
    pub fn is_finished(&self) -> bool {
        self.lanes.iter().all(|l| l.done)
    }

    /// Points dropped because they arrived after their tick was released.
    pub fn late_points(&self) -> u64 {
        self.late_points
    }

    /// Highest tick that may be released now.
    fn release_limit(&self) -> Option<u64> {
        let mut limit: Option<u64> = None;
        for lane in self.lanes.iter().filter(|l| !l.done) {
            let watermark = lane.watermark?;
            limit = Some(limit.map_or(watermark, |l| l.min(watermark)));
        }
        match limit {
            Some(limit) => Some(limit),
            // All inputs done: release everything
            None => self.lanes.iter().filter_map(|l| l.watermark).max(),
        }
    }

    /// Take every row that is ready, in ascending tick order.
    pub fn drain_ready(&mut self) -> Vec<AlignedRow> {
        let Some(limit) = self.release_limit() else {
            return Vec::new();
        };

        let ticks: BTreeSet<u64> = self
            .lanes
            .iter()
            .flat_map(|l| l.pending.range(..=limit).map(|(t, _)| *t))
            .collect();
        if ticks.is_empty() {
            return Vec::new();
        }

        let rows: Vec<AlignedRow> = ticks
            .iter()
            .map(|tick| AlignedRow {
                tick: *tick,
                values: self
                    .lanes
                    .iter()
                    .map(|l| l.pending.get(tick).copied().flatten())
                    .collect(),
            })
            .collect();

        for lane in &mut self.lanes {
            match limit.checked_add(1) {
                Some(next) => lane.pending = lane.pending.split_off(&next),
                None => lane.pending.clear(),
            }
        }
        self.last_released = ticks.last().copied();
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticks(rows: &[AlignedRow]) -> Vec<u64> {
        rows.iter().map(|r| r.tick).collect()
    }

    #[test]
    fn test_waits_for_every_input() {
        let mut aligner = Aligner::new(2);
        aligner.push(0, 1, Some(1.0));
        aligner.push(0, 2, Some(2.0));
        assert!(aligner.drain_ready().is_empty());

        aligner.push(1, 1, Some(10.0));
        let rows = aligner.drain_ready();
        assert_eq!(
            rows,
            vec![AlignedRow {
                tick: 1,
                values: vec![Some(1.0), Some(10.0)]
            }]
        );
    }

    #[test]
    fn test_gap_before_first_common_tick_fills_with_null() {
        let mut aligner = Aligner::new(2);
        for t in 1..=4 {
            aligner.push(0, t, Some(t as f64));
        }
        aligner.push(1, 3, Some(30.0));

        let rows = aligner.drain_ready();
        assert_eq!(ticks(&rows), vec![1, 2, 3]);
        assert_eq!(rows[0].values, vec![Some(1.0), None]);
        assert_eq!(rows[2].values, vec![Some(3.0), Some(30.0)]);
    }

    #[test]
    fn test_finished_input_releases_rest() {
        let mut aligner = Aligner::new(2);
        aligner.push(0, 1, Some(1.0));
        aligner.push(1, 1, Some(1.0));
        aligner.push(0, 2, Some(2.0));
        aligner.push(0, 3, Some(3.0));
        assert_eq!(ticks(&aligner.drain_ready()), vec![1]);

        aligner.finish(1);
        assert_eq!(ticks(&aligner.drain_ready()), vec![2, 3]);
        aligner.finish(0);
        assert!(aligner.is_finished());
        assert!(aligner.drain_ready().is_empty());
    }

    #[test]
    fn test_late_points_are_dropped() {
        let mut aligner = Aligner::new(1);
        aligner.push(0, 5, Some(5.0));
        assert_eq!(ticks(&aligner.drain_ready()), vec![5]);
        aligner.push(0, 4, Some(4.0));
        assert_eq!(aligner.late_points(), 1);
        assert!(aligner.drain_ready().is_empty());
    }
}
