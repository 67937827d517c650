//! Fixed-boundary histogram aggregation
//!
//! A histogram is a set of ascending bucket boundaries with parallel
//! counters. Each boundary is an inclusive upper bound; values above the
//! last boundary land in an implicit overflow bucket. Observation is
//! lock-free: a binary search over the boundary slice and three atomic
//! increments.
//!
//! Invariant: the sum of all bucket counts equals the total observation
//! count. Each counter is only ever incremented so a snapshot taken
//! concurrently with writers is a causally consistent point-in-time copy.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::AtomicF64;

/// Errors produced by [`Histogram`] construction.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum Error {
    /// At least one bucket boundary is required.
    #[error("histogram requires at least one bucket boundary")]
    EmptyBoundaries,
    /// Boundaries must be finite and strictly increasing.
    #[error("histogram boundaries must be finite and strictly increasing at index {0}")]
    UnorderedBoundaries(usize),
}

/// A bucketed histogram with fixed boundaries.
#[derive(Debug)]
pub struct Histogram {
    /// Ascending inclusive upper bounds, one per explicit bucket.
    boundaries: Vec<f64>,
    /// One counter per boundary plus a trailing overflow bucket.
    counts: Vec<AtomicU64>,
    count: AtomicU64,
    sum: AtomicF64,
}

/// A point-in-time copy of a [`Histogram`].
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    /// Ascending inclusive upper bounds, one per explicit bucket.
    pub boundaries: Vec<f64>,
    /// Bucket counts, one per boundary plus a trailing overflow bucket.
    pub counts: Vec<u64>,
    /// Total number of observations.
    pub count: u64,
    /// Sum of all observed values.
    pub sum: f64,
}

impl Histogram {
    /// Create a new `Histogram` with the given ascending boundaries.
    ///
    /// # Errors
    ///
    /// Returns an error if `boundaries` is empty or not finite and strictly
    /// increasing.
    pub fn new(boundaries: Vec<f64>) -> Result<Self, Error> {
        if boundaries.is_empty() {
            return Err(Error::EmptyBoundaries);
        }
        for (idx, bound) in boundaries.iter().enumerate() {
            if !bound.is_finite() {
                return Err(Error::UnorderedBoundaries(idx));
            }
            if idx > 0 && boundaries[idx - 1] >= *bound {
                return Err(Error::UnorderedBoundaries(idx));
            }
        }
        let counts = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Ok(Self {
            boundaries,
            counts,
            count: AtomicU64::new(0),
            sum: AtomicF64::new(0.0),
        })
    }

    /// Record one observation.
    pub fn observe(&self, value: f64) {
        // First boundary >= value, else the overflow bucket.
        let idx = self.boundaries.partition_point(|bound| *bound < value);
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.add(value);
    }

    /// Take a point-in-time copy, non-mutating on the source.
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            boundaries: self.boundaries.clone(),
            counts: self
                .counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            count: self.count.load(Ordering::Relaxed),
            sum: self.sum.load(),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::{collection, prelude::*};

    use super::{Error, Histogram};

    #[test]
    fn construction_rejects_bad_boundaries() {
        assert!(matches!(
            Histogram::new(vec![]),
            Err(Error::EmptyBoundaries)
        ));
        assert!(matches!(
            Histogram::new(vec![1.0, 1.0]),
            Err(Error::UnorderedBoundaries(1))
        ));
        assert!(matches!(
            Histogram::new(vec![5.0, 1.0]),
            Err(Error::UnorderedBoundaries(1))
        ));
        assert!(matches!(
            Histogram::new(vec![1.0, f64::INFINITY]),
            Err(Error::UnorderedBoundaries(1))
        ));
    }

    #[test]
    fn boundaries_are_inclusive_upper_bounds() {
        let histogram = Histogram::new(vec![1.0, 5.0, 10.0]).expect("valid boundaries");
        histogram.observe(1.0); // lands in the first bucket, bound inclusive
        histogram.observe(1.1); // second bucket
        histogram.observe(10.0); // third bucket
        histogram.observe(10.1); // overflow

        let snap = histogram.snapshot();
        assert_eq!(snap.counts, vec![1, 1, 1, 1]);
        assert_eq!(snap.count, 4);
    }

    proptest! {
        // For any observation sequence the bucket counts conserve the total.
        #[test]
        fn bucket_counts_conserve_total(
            values in collection::vec(-1_000.0_f64..1_000.0, 0..500)
        ) {
            let histogram = Histogram::new(vec![-500.0, -100.0, 0.0, 100.0, 500.0])
                .expect("valid boundaries");
            for value in &values {
                histogram.observe(*value);
            }
            let snap = histogram.snapshot();
            let total: u64 = snap.counts.iter().sum();
            prop_assert_eq!(total, values.len() as u64);
            prop_assert_eq!(snap.count, values.len() as u64);

            let expected_sum: f64 = values.iter().sum();
            prop_assert!((snap.sum - expected_sum).abs() < 1e-6,
                "sum {} diverged from expected {expected_sum}", snap.sum);
        }
    }

    #[test]
    fn concurrent_observers_conserve_total() {
        use std::sync::Arc;

        let histogram =
            Arc::new(Histogram::new(vec![10.0, 100.0, 1_000.0]).expect("valid boundaries"));
        let mut handles = Vec::new();
        for worker in 0..4 {
            let histogram = Arc::clone(&histogram);
            handles.push(std::thread::spawn(move || {
                for i in 0..1_000 {
                    histogram.observe(f64::from(worker * 400 + (i % 1_200)));
                }
            }));
        }
        for handle in handles {
            handle.join().expect("worker panicked");
        }

        let snap = histogram.snapshot();
        assert_eq!(snap.count, 4_000);
        assert_eq!(snap.counts.iter().sum::<u64>(), 4_000);
    }
}
