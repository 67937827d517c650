//! Streaming quantile summary
//!
//! The [`Summary`] approximates a fixed set of percentiles from an unbounded
//! observation stream without retaining samples, using the P² algorithm of
//! Jain & Chlamtac. Each target quantile runs five markers: the first five
//! observations are buffered and sorted into initial marker heights, after
//! which every observation costs O(1) marker bookkeeping.
//!
//! # Semantics
//!
//! * Before five observations every quantile estimate is NaN.
//! * After five observations marker heights are non-decreasing,
//!   `q0 <= q1 <= q2 <= q3 <= q4`.
//! * A [`SummarySnapshot`] clamps every estimate into `[min, max]` of the
//!   observed values and enforces non-decreasing order across the reported
//!   quantiles by pushing an out-of-order value up to its lower neighbor.
//!
//! Each estimator sits behind its own mutex so concurrent readers of
//! different quantiles of the same metric never serialize on one another.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::AtomicF64;

/// The quantiles every [`Summary`] tracks.
pub const TARGET_QUANTILES: [f64; 4] = [0.50, 0.90, 0.95, 0.99];

/// Estimates within this relative distance of the observed minimum snap to
/// the minimum, suppressing flicker on narrow distributions.
const MIN_DEADBAND_RELATIVE: f64 = 1e-6;

/// A five-marker P² estimator for a single target quantile.
#[derive(Debug)]
struct Markers {
    /// The target quantile in `(0, 1)`.
    quantile: f64,
    /// Marker heights, non-decreasing once initialized.
    heights: [f64; 5],
    /// Actual marker positions, 1-based observation ranks.
    positions: [f64; 5],
    /// Desired marker positions.
    desired: [f64; 5],
    /// Per-observation desired-position increments.
    increments: [f64; 5],
    /// Buffer for the first five observations.
    initial: [f64; 5],
    /// Observations seen so far.
    count: u64,
}

impl Markers {
    fn new(quantile: f64) -> Self {
        let p = quantile;
        Self {
            quantile,
            heights: [0.0; 5],
            positions: [1.0, 2.0, 3.0, 4.0, 5.0],
            desired: [1.0, 1.0 + 2.0 * p, 1.0 + 4.0 * p, 3.0 + 2.0 * p, 5.0],
            increments: [0.0, p / 2.0, p, (1.0 + p) / 2.0, 1.0],
            initial: [0.0; 5],
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        if self.count < 5 {
            self.initial[usize::try_from(self.count).expect("count below five")] = value;
            self.count += 1;
            if self.count == 5 {
                self.initial
                    .sort_by(|a, b| a.partial_cmp(b).expect("finite observations"));
                self.heights = self.initial;
            }
            return;
        }
        self.count += 1;

        // Locate the cell the new value falls into, extending the extreme
        // markers when the value lands outside them.
        let cell = if value < self.heights[0] {
            self.heights[0] = value;
            0
        } else if value >= self.heights[4] {
            self.heights[4] = value;
            3
        } else {
            // heights[cell] <= value < heights[cell + 1]
            let mut cell = 0;
            while cell < 3 && self.heights[cell + 1] <= value {
                cell += 1;
            }
            cell
        };

        for position in self.positions.iter_mut().skip(cell + 1) {
            *position += 1.0;
        }
        for (desired, increment) in self.desired.iter_mut().zip(&self.increments) {
            *desired += increment;
        }

        for i in 1..4 {
            let diff = self.desired[i] - self.positions[i];
            let right_gap = self.positions[i + 1] - self.positions[i];
            let left_gap = self.positions[i - 1] - self.positions[i];
            if (diff >= 1.0 && right_gap > 1.0) || (diff <= -1.0 && left_gap < -1.0) {
                let step = diff.signum();
                let candidate = self.parabolic(i, step);
                self.heights[i] = if self.heights[i - 1] < candidate
                    && candidate < self.heights[i + 1]
                {
                    candidate
                } else {
                    self.linear(i, step)
                };
                self.positions[i] += step;
            }
        }
    }

    /// Piecewise-parabolic prediction of marker `i` moved by `step` (±1).
    fn parabolic(&self, i: usize, step: f64) -> f64 {
        let q = &self.heights;
        let n = &self.positions;
        q[i] + step / (n[i + 1] - n[i - 1])
            * ((n[i] - n[i - 1] + step) * (q[i + 1] - q[i]) / (n[i + 1] - n[i])
                + (n[i + 1] - n[i] - step) * (q[i] - q[i - 1]) / (n[i] - n[i - 1]))
    }

    /// Linear fallback when the parabola would break marker ordering.
    fn linear(&self, i: usize, step: f64) -> f64 {
        let q = &self.heights;
        let n = &self.positions;
        let neighbor = if step > 0.0 { i + 1 } else { i - 1 };
        q[i] + step * (q[neighbor] - q[i]) / (n[neighbor] - n[i])
    }

    /// Read the estimate off the markers: interpolate marker heights at the
    /// desired rank `1 + p * (count - 1)`. Undefined -- NaN -- until five
    /// observations have arrived.
    fn estimate(&self) -> f64 {
        if self.count < 5 {
            return f64::NAN;
        }
        let rank = 1.0 + self.quantile * (self.count as f64 - 1.0);
        if rank <= self.positions[0] {
            return self.heights[0];
        }
        if rank >= self.positions[4] {
            return self.heights[4];
        }
        for i in 0..4 {
            if rank <= self.positions[i + 1] {
                let span = self.positions[i + 1] - self.positions[i];
                if span <= 0.0 {
                    return self.heights[i + 1];
                }
                let fraction = (rank - self.positions[i]) / span;
                return self.heights[i] + fraction * (self.heights[i + 1] - self.heights[i]);
            }
        }
        self.heights[4]
    }
}

/// A streaming quantile summary over one metric key.
#[derive(Debug)]
pub struct Summary {
    estimators: [Mutex<Markers>; 4],
    count: AtomicU64,
    sum: AtomicF64,
    min: AtomicF64,
    max: AtomicF64,
}

/// A point-in-time copy of a [`Summary`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummarySnapshot {
    /// Estimates for [`TARGET_QUANTILES`], in order: p50, p90, p95, p99.
    /// All NaN until five observations have been recorded.
    pub quantiles: [f64; 4],
    /// Total number of observations.
    pub count: u64,
    /// Sum of all observed values.
    pub sum: f64,
    /// Smallest observed value, NaN when empty.
    pub min: f64,
    /// Largest observed value, NaN when empty.
    pub max: f64,
}

impl Default for Summary {
    fn default() -> Self {
        Self::new()
    }
}

impl Summary {
    /// Create an empty `Summary` tracking [`TARGET_QUANTILES`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            estimators: TARGET_QUANTILES.map(|p| Mutex::new(Markers::new(p))),
            count: AtomicU64::new(0),
            sum: AtomicF64::new(0.0),
            min: AtomicF64::new(f64::INFINITY),
            max: AtomicF64::new(f64::NEG_INFINITY),
        }
    }

    /// Record one observation. Non-finite values are ignored, counted only
    /// by the caller's side-channel logging if it cares.
    pub fn observe(&self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.add(value);
        self.min.fetch_min(value);
        self.max.fetch_max(value);
        for estimator in &self.estimators {
            let mut markers = match estimator.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            markers.observe(value);
        }
    }

    /// Take a point-in-time copy, non-mutating on the source.
    ///
    /// Estimates are clamped into `[min, max]`, snapped to the minimum
    /// inside a small relative deadband, and forced non-decreasing across
    /// the reported quantiles.
    #[must_use]
    pub fn snapshot(&self) -> SummarySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum.load();
        let (min, max) = if count == 0 {
            (f64::NAN, f64::NAN)
        } else {
            (self.min.load(), self.max.load())
        };

        let mut quantiles = [f64::NAN; 4];
        for (slot, estimator) in quantiles.iter_mut().zip(&self.estimators) {
            let markers = match estimator.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *slot = markers.estimate();
        }

        if quantiles.iter().all(|q| q.is_finite()) {
            for q in &mut quantiles {
                *q = q.clamp(min, max);
                if (*q - min).abs() <= MIN_DEADBAND_RELATIVE * min.abs().max(1.0) {
                    *q = min;
                }
            }
            for i in 1..4 {
                if quantiles[i] < quantiles[i - 1] {
                    quantiles[i] = quantiles[i - 1];
                }
            }
        }

        SummarySnapshot {
            quantiles,
            count,
            sum,
            min,
            max,
        }
    }
}
