//! Adaptive sampling
//!
//! The sampler decides, once per completed operation, whether the operation
//! is measured at all. A negative decision short-circuits every downstream
//! engine, so this call sits on the hottest path in the pipeline: it never
//! blocks, never errors after construction, and does no I/O.
//!
//! Two decision sources are supported. Deterministic mode hashes the
//! operation name together with a configured seed, so independent pipeline
//! instances observing the same operation name reach the same decision.
//! Randomized mode draws from the calling thread's generator; there is no
//! shared generator state to race on.

use rand::Rng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use vitals_throttle::RateLimiter;

/// Errors produced by [`Sampler`] construction.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The base probability must lie in `[0, 1]`.
    #[error("base probability must be within [0, 1]: {0}")]
    BaseProbability(f64),
    /// A per-name override probability must lie in `[0, 1]`.
    #[error("override probability for `{name}` must be within [0, 1]: {value}")]
    OverrideProbability {
        /// The operation name the override applies to.
        name: String,
        /// The rejected probability.
        value: f64,
    },
    /// See [`vitals_throttle::Error`] for details.
    #[error(transparent)]
    Throttle(#[from] vitals_throttle::Error),
}

/// The source of sampling decisions.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Hash the operation name with the configured seed. The same
    /// `(name, seed)` pair always yields the same decision.
    #[default]
    Deterministic,
    /// Draw from the calling thread's uniform generator.
    Randomized,
}

/// Configuration of a [`Sampler`].
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Probability in `[0, 1]` applied to names without an override.
    pub base_probability: f64,
    /// The decision source.
    #[serde(default)]
    pub mode: Mode,
    /// Seed for deterministic hashing.
    #[serde(default)]
    pub seed: u64,
    /// Per-name probability overrides, matched case-insensitively.
    #[serde(default)]
    pub overrides: FxHashMap<String, f64>,
    /// Optional token bucket applied after a positive probability decision.
    #[serde(default)]
    pub rate_limit: Option<vitals_throttle::Config>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_probability: 1.0,
            mode: Mode::default(),
            seed: 0,
            overrides: FxHashMap::default(),
            rate_limit: None,
        }
    }
}

/// Decides per-operation-name measurement inclusion.
#[derive(Debug)]
pub struct Sampler {
    base_probability: f64,
    mode: Mode,
    seed: u64,
    /// Override keys are lowercased at construction for case-insensitive
    /// lookup.
    overrides: FxHashMap<String, f64>,
    limiter: Option<RateLimiter>,
}

impl Sampler {
    /// Create a new `Sampler`.
    ///
    /// # Errors
    ///
    /// Returns an error if any probability lies outside `[0, 1]` or the
    /// rate limit configuration is invalid.
    pub fn new(config: Config) -> Result<Self, Error> {
        if !(0.0..=1.0).contains(&config.base_probability) {
            return Err(Error::BaseProbability(config.base_probability));
        }
        let mut overrides = FxHashMap::default();
        for (name, probability) in config.overrides {
            if !(0.0..=1.0).contains(&probability) {
                return Err(Error::OverrideProbability {
                    name,
                    value: probability,
                });
            }
            overrides.insert(name.to_ascii_lowercase(), probability);
        }
        let limiter = match config.rate_limit {
            Some(limit) => Some(RateLimiter::new(limit)?),
            None => None,
        };
        Ok(Self {
            base_probability: config.base_probability,
            mode: config.mode,
            seed: config.seed,
            overrides,
            limiter,
        })
    }

    /// Decide whether the operation named `name` is measured.
    ///
    /// O(1), non-blocking, and allocation-free except when an override
    /// table is configured and `name` carries uppercase characters.
    #[must_use]
    pub fn should_sample(&self, name: &str) -> bool {
        let probability = self.resolve_probability(name);
        if probability <= 0.0 {
            return false;
        }

        // A certain probability skips the draw entirely and goes straight
        // to the rate limit check.
        if probability < 1.0 {
            let draw = match self.mode {
                Mode::Deterministic => normalized_hash(name, self.seed),
                Mode::Randomized => rand::rng().random::<f64>(),
            };
            if draw >= probability {
                return false;
            }
        }

        match &self.limiter {
            Some(limiter) => limiter.try_acquire(),
            None => true,
        }
    }

    fn resolve_probability(&self, name: &str) -> f64 {
        if self.overrides.is_empty() {
            return self.base_probability;
        }
        let found = if name.bytes().any(|b| b.is_ascii_uppercase()) {
            self.overrides.get(&name.to_ascii_lowercase())
        } else {
            self.overrides.get(name)
        };
        found.copied().unwrap_or(self.base_probability)
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over the name bytes, seeded, with a splitmix64-style avalanche
/// finisher, normalized to `[0, 1)` from the top 53 bits.
fn normalized_hash(name: &str, seed: u64) -> f64 {
    let mut hash = FNV_OFFSET_BASIS ^ seed;
    for byte in name.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash ^= hash >> 30;
    hash = hash.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    hash ^= hash >> 27;
    hash = hash.wrapping_mul(0x94d0_49bb_1331_11eb);
    hash ^= hash >> 31;

    // 2^53 as f64; the top 53 bits give a uniform dyadic in [0, 1).
    (hash >> 11) as f64 / 9_007_199_254_740_992.0
}
