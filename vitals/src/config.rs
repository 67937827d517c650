//! Pipeline configuration
//!
//! One YAML document configures every engine. Parsing is strict: unknown
//! fields are rejected so a typo cannot silently disable sampling or
//! suppression. Validation happens before any engine is constructed and
//! fails fast on the first problem.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use vitals_capture::metric::MetricKind;

/// Errors produced when loading a [`Config`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The document failed to parse.
    #[error("configuration parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// A threshold must be a finite number.
    #[error("threshold for `{key}` must be finite: {value}")]
    NonFiniteThreshold {
        /// The metric key the threshold applies to.
        key: String,
        /// The rejected value.
        value: f64,
    },
    /// Histogram boundaries must be non-empty.
    #[error("histogram boundaries for `{kind}` are empty")]
    EmptyBoundaries {
        /// The metric kind the boundaries apply to.
        kind: MetricKind,
    },
    /// Histogram boundaries must be finite and strictly increasing.
    #[error("histogram boundaries for `{kind}` are not strictly increasing")]
    UnorderedBoundaries {
        /// The metric kind the boundaries apply to.
        kind: MetricKind,
    },
}

/// Top-level configuration of a measurement pipeline.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Sampling configuration.
    #[serde(default)]
    pub sampler: crate::sampler::Config,
    /// Duplicate suppression configuration.
    #[serde(default)]
    pub dedupe: crate::dedupe::Config,
    /// Delivery queue configuration.
    #[serde(default)]
    pub queue: crate::queue::Config,
    /// Metric kinds listed here aggregate into bucketed histograms with
    /// the given boundaries; every other kind uses a quantile summary.
    #[serde(default)]
    pub histogram_boundaries: FxHashMap<MetricKind, Vec<f64>>,
    /// Alert thresholds keyed by metric key, `name:kind`. An observation
    /// strictly above its threshold raises an alert.
    #[serde(default)]
    pub thresholds: FxHashMap<String, f64>,
}

impl Config {
    /// Parse and validate a YAML document.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed YAML, unknown fields, or invalid
    /// values.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    ///
    /// Engine-specific constraints, probability ranges and the like, are
    /// enforced again by each engine's constructor.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), Error> {
        for (key, value) in &self.thresholds {
            if !value.is_finite() {
                return Err(Error::NonFiniteThreshold {
                    key: key.clone(),
                    value: *value,
                });
            }
        }
        for (kind, boundaries) in &self.histogram_boundaries {
            if boundaries.is_empty() {
                return Err(Error::EmptyBoundaries { kind: *kind });
            }
            let ordered = boundaries
                .windows(2)
                .all(|pair| pair[0].is_finite() && pair[0] < pair[1]);
            if !ordered || !boundaries[boundaries.len() - 1].is_finite() {
                return Err(Error::UnorderedBoundaries { kind: *kind });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Config;
    use crate::queue::OverflowPolicy;
    use crate::sampler::Mode;
    use vitals_capture::metric::MetricKind;

    #[test]
    fn empty_document_yields_defaults() {
        let config = Config::from_yaml("{}").expect("defaults parse");
        assert_eq!(config, Config::default());
        assert!((config.sampler.base_probability - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.queue.capacity, 1024);
    }

    #[test]
    fn full_document_round_trips() {
        let contents = r"
sampler:
  base_probability: 0.25
  mode: randomized
  seed: 7
  overrides:
    orderservice.placeorder: 1.0
  rate_limit:
    rate: 100.0
    burst: 10.0
dedupe:
  cooldown:
    secs: 30
    nanos: 0
  bits: 131072
queue:
  capacity: 2048
  max_batch: 128
  policy: backoff_retry
histogram_boundaries:
  duration: [1.0, 5.0, 25.0, 125.0]
thresholds:
  'OrderService.PlaceOrder:duration': 500.0
";
        let config = Config::from_yaml(contents).expect("document parses");
        assert!((config.sampler.base_probability - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.sampler.mode, Mode::Randomized);
        assert_eq!(config.dedupe.cooldown, Duration::from_secs(30));
        assert_eq!(config.queue.policy, OverflowPolicy::BackoffRetry);
        assert_eq!(
            config.histogram_boundaries[&MetricKind::Duration],
            vec![1.0, 5.0, 25.0, 125.0]
        );
        assert!(
            (config.thresholds["OrderService.PlaceOrder:duration"] - 500.0).abs() < f64::EPSILON
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let contents = r"
sampler:
  base_probability: 0.5
  sample_mode: deterministic
";
        assert!(Config::from_yaml(contents).is_err());
    }

    #[test]
    fn non_finite_threshold_is_rejected() {
        let contents = r"
thresholds:
  'op:duration': .nan
";
        assert!(Config::from_yaml(contents).is_err());
    }

    #[test]
    fn unordered_boundaries_are_rejected() {
        let contents = r"
histogram_boundaries:
  cpu_time: [10.0, 5.0]
";
        assert!(Config::from_yaml(contents).is_err());
    }
}
