//! Keyed aggregator registry
//!
//! The registry maps metric keys -- `name:kind` strings -- to aggregator
//! instances. Creation is idempotent: concurrent callers racing to create
//! the same key all observe the same instance, and the aggregator shape
//! chosen by the first creator is fixed for the life of the registry.
//!
//! The registry is an explicitly constructed component. Callers hold a
//! handle (typically `Arc<Registry>`) with application-scoped lifetime;
//! there is no hidden process-global.

use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::histogram::{Histogram, HistogramSnapshot};
use crate::quantile::{Summary, SummarySnapshot};

/// Errors produced by [`Registry`].
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum Error {
    /// See [`crate::histogram::Error`] for details.
    #[error(transparent)]
    Histogram(#[from] crate::histogram::Error),
}

/// The aggregator shape requested for a key at first use.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorKind {
    /// A bucketed histogram with the given ascending boundaries.
    Histogram(Vec<f64>),
    /// A P² quantile summary.
    Summary,
}

/// A keyed aggregator, one of the two supported shapes.
#[derive(Debug)]
pub enum Aggregator {
    /// Bucketed histogram.
    Histogram(Histogram),
    /// Streaming quantile summary.
    Summary(Summary),
}

impl Aggregator {
    /// Record one observation.
    pub fn observe(&self, value: f64) {
        match self {
            Aggregator::Histogram(histogram) => histogram.observe(value),
            Aggregator::Summary(summary) => summary.observe(value),
        }
    }

    /// Take a point-in-time copy of this aggregator's state.
    #[must_use]
    pub fn snapshot(&self) -> AggregatorSnapshot {
        match self {
            Aggregator::Histogram(histogram) => {
                AggregatorSnapshot::Histogram(histogram.snapshot())
            }
            Aggregator::Summary(summary) => AggregatorSnapshot::Summary(summary.snapshot()),
        }
    }
}

/// A deep copy of one aggregator's state, safe for concurrent export.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorSnapshot {
    /// Bucketed histogram state.
    Histogram(HistogramSnapshot),
    /// Quantile summary state.
    Summary(SummarySnapshot),
}

/// Process-lifetime mapping from metric key to aggregator.
#[derive(Debug, Default)]
pub struct Registry {
    inner: RwLock<FxHashMap<String, Arc<Aggregator>>>,
}

impl Registry {
    /// Create an empty `Registry`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the aggregator for `key`, creating it with `kind` on first use.
    ///
    /// Creation is atomic across concurrent callers: the first writer wins
    /// and every racer receives the winner's instance. The `kind` argument
    /// only matters on first creation.
    ///
    /// # Errors
    ///
    /// Returns an error if this call creates the aggregator and the
    /// requested histogram boundaries are invalid.
    pub fn get_or_create(&self, key: &str, kind: &AggregatorKind) -> Result<Arc<Aggregator>, Error> {
        {
            let map = match self.inner.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(existing) = map.get(key) {
                return Ok(Arc::clone(existing));
            }
        }

        // Build the candidate outside the write lock, then re-check: a racer
        // may have inserted while we were constructing.
        let candidate = match kind {
            AggregatorKind::Histogram(boundaries) => {
                Arc::new(Aggregator::Histogram(Histogram::new(boundaries.clone())?))
            }
            AggregatorKind::Summary => Arc::new(Aggregator::Summary(Summary::new())),
        };

        let mut map = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = map.get(key) {
            return Ok(Arc::clone(existing));
        }
        debug!(key, "created aggregator");
        map.insert(key.to_string(), Arc::clone(&candidate));
        Ok(candidate)
    }

    /// Snapshot every key with a deep copy of its aggregator state.
    ///
    /// Each key's snapshot is independently consistent; the collection is
    /// not a globally consistent cut across keys.
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<(String, AggregatorSnapshot)> {
        let map = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut entries: Vec<(String, AggregatorSnapshot)> = map
            .iter()
            .map(|(key, aggregator)| (key.clone(), aggregator.snapshot()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{AggregatorKind, AggregatorSnapshot, Registry};

    #[test]
    fn creation_is_idempotent() {
        let registry = Registry::new();
        let first = registry
            .get_or_create("op:duration", &AggregatorKind::Summary)
            .expect("create");
        // A different kind on a later call is ignored, first creator wins.
        let second = registry
            .get_or_create(
                "op:duration",
                &AggregatorKind::Histogram(vec![1.0, 2.0, 3.0]),
            )
            .expect("create");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn concurrent_creators_observe_one_instance() {
        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                registry
                    .get_or_create("op:duration", &AggregatorKind::Summary)
                    .expect("create")
            }));
        }
        let instances: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("creator panicked"))
            .collect();
        for instance in &instances[1..] {
            assert!(Arc::ptr_eq(&instances[0], instance));
        }
    }

    #[test]
    fn invalid_histogram_boundaries_error_at_creation() {
        let registry = Registry::new();
        let result = registry.get_or_create("op:duration", &AggregatorKind::Histogram(vec![]));
        assert!(result.is_err());
    }

    #[test]
    fn snapshot_all_reports_every_key() {
        let registry = Registry::new();
        registry
            .get_or_create("a:duration", &AggregatorKind::Summary)
            .expect("create")
            .observe(1.0);
        registry
            .get_or_create("b:cpu_time", &AggregatorKind::Histogram(vec![10.0, 100.0]))
            .expect("create")
            .observe(5.0);

        let snapshots = registry.snapshot_all();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].0, "a:duration");
        assert_eq!(snapshots[1].0, "b:cpu_time");
        match &snapshots[1].1 {
            AggregatorSnapshot::Histogram(histogram) => {
                assert_eq!(histogram.count, 1);
                assert_eq!(histogram.counts, vec![1, 0, 0]);
            }
            AggregatorSnapshot::Summary(_) => panic!("expected histogram snapshot"),
        }
    }

    #[test]
    fn snapshot_does_not_disturb_the_source() {
        let registry = Registry::new();
        let aggregator = registry
            .get_or_create("a:duration", &AggregatorKind::Summary)
            .expect("create");
        for value in 1..=10 {
            aggregator.observe(f64::from(value));
        }
        let before = registry.snapshot_all();
        let after = registry.snapshot_all();
        assert_eq!(before, after);
    }
}
