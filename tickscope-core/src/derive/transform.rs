//! Per-tick transforms.

use std::collections::VecDeque;

/// A stateful step function over aligned input values.
///
/// `update` is called once per output tick, in ascending tick order, with one
/// value per input (`None` for null or missing). It returns one value per
/// output key, in the order of [`Transform::output_keys`].
///
/// ## Example
///
/// ```rust,ignore
/// struct Sum { keys: Vec<String> }
///
/// impl Transform for Sum {
///     fn name(&self) -> &str { "sum" }
///     fn output_keys(&self) -> &[String] { &self.keys }
///     fn update(&mut self, _tick: u64, inputs: &[Option<f64>]) -> Vec<Option<f64>> {
///         vec![inputs.iter().copied().sum::<Option<f64>>()]
///     }
/// }
/// ```
pub trait Transform: Send {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Output keys, one per emitted value.
    fn output_keys(&self) -> &[String];

    /// Advance by one tick.
    fn update(&mut self, tick: u64, inputs: &[Option<f64>]) -> Vec<Option<f64>>;
}

/// `right - left`, null if either side is null.
pub struct DiffTransform {
    keys: Vec<String>,
}

impl DiffTransform {
    pub const DEFAULT_KEY: &'static str = "diff";

    pub fn new(key: impl Into<String>) -> Self {
        Self {
            keys: vec![key.into()],
        }
    }
}

impl Default for DiffTransform {
    fn default() -> Self {
        Self::new(Self::DEFAULT_KEY)
    }
}

impl Transform for DiffTransform {
    fn name(&self) -> &str {
        "diff"
    }

    fn output_keys(&self) -> &[String] {
        &self.keys
    }

    fn update(&mut self, _tick: u64, inputs: &[Option<f64>]) -> Vec<Option<f64>> {
        let left = inputs.first().copied().flatten();
        let right = inputs.get(1).copied().flatten();
        vec![match (left, right) {
            (Some(l), Some(r)) => Some(r - l),
            _ => None,
        }]
    }
}

/// Mean of the last `window` non-null values.
///
/// A null input emits null and does not enter the window. While the window
/// is filling, the mean is over the values seen so far.
pub struct MovingAverage {
    keys: Vec<String>,
    window: usize,
    values: VecDeque<f64>,
    sum: f64,
}

impl MovingAverage {
    pub const DEFAULT_KEY: &'static str = "moving_average";

    pub fn new(window: usize, key: impl Into<String>) -> Self {
        let window = window.max(1);
        Self {
            keys: vec![key.into()],
            window,
            values: VecDeque::with_capacity(window),
            sum: 0.0,
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }
}

impl Transform for MovingAverage {
    fn name(&self) -> &str {
        "moving_average"
    }

    fn output_keys(&self) -> &[String] {
        &self.keys
    }

    fn update(&mut self, _tick: u64, inputs: &[Option<f64>]) -> Vec<Option<f64>> {
        let Some(value) = inputs.first().copied().flatten() else {
            return vec![None];
        };
        self.values.push_back(value);
        self.sum += value;
        if self.values.len() > self.window {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
            }
        }
        vec![Some(self.sum / self.values.len() as f64)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(transform: &mut dyn Transform, rows: &[Vec<Option<f64>>]) -> Vec<Option<f64>> {
        rows.iter()
            .enumerate()
            .map(|(i, row)| transform.update(i as u64 + 1, row)[0])
            .collect()
    }

    #[test]
    fn test_diff_with_null() {
        let mut diff = DiffTransform::default();
        let out = run(
            &mut diff,
            &[
                vec![Some(1.0), Some(2.0)],
                vec![Some(2.0), None],
                vec![Some(3.0), Some(7.0)],
            ],
        );
        assert_eq!(out, vec![Some(1.0), None, Some(4.0)]);
    }

    #[test]
    fn test_moving_average_fills_from_start() {
        let mut avg = MovingAverage::new(3, "avg");
        let rows: Vec<Vec<Option<f64>>> = [1.0, 2.0, 3.0, 4.0, 5.0]
            .iter()
            .map(|v| vec![Some(*v)])
            .collect();
        assert_eq!(
            run(&mut avg, &rows),
            vec![Some(1.0), Some(1.5), Some(2.0), Some(3.0), Some(4.0)]
        );
    }

    #[test]
    fn test_moving_average_null_passes_through() {
        let mut avg = MovingAverage::new(2, "avg");
        let out = run(&mut avg, &[vec![Some(2.0)], vec![None], vec![Some(4.0)]]);
        assert_eq!(out, vec![Some(2.0), None, Some(3.0)]);
    }
}
