//! The vitals rate limiting mechanism
//!
//! This library supports the sampling layer of the vitals project with a
//! token bucket: capacity accumulates at a steady rate up to a burst cap and
//! is spent on accepted events. Unlike a throttle that parks its caller the
//! bucket here only ever answers yes or no, the sampler's hot path must not
//! block.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

mod bucket;

use bucket::Bucket;

/// The number of clock ticks in one second. A tick is one microsecond.
pub const TICKS_PER_SECOND: u64 = 1_000_000;

/// Errors produced by [`RateLimiter`].
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum Error {
    /// Refill rate must be a positive, finite number of tokens per second.
    #[error("refill rate must be positive and finite: {0}")]
    NonPositiveRate(f64),
    /// Burst capacity must be a positive, finite token count.
    #[error("burst capacity must be positive and finite: {0}")]
    NonPositiveBurst(f64),
}

/// Configuration of a [`RateLimiter`].
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Tokens added per second of elapsed wall-clock time.
    pub rate: f64,
    /// Maximum number of tokens the bucket may hold, the burst cap.
    pub burst: f64,
}

/// The clock a [`RateLimiter`] reads elapsed time from.
pub trait Clock {
    /// The number of ticks -- microseconds -- elapsed since the clock was
    /// created.
    fn ticks_elapsed(&self) -> u64;
}

#[derive(Debug, Clone, Copy)]
/// A clock that operates with respect to real-clock time.
pub struct RealClock {
    start: Instant,
}

impl Default for RealClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for RealClock {
    /// Return the number of ticks since this clock was created.
    ///
    /// # Panics
    ///
    /// Panics if more microseconds have elapsed than a `u64` can hold.
    fn ticks_elapsed(&self) -> u64 {
        let elapsed = self.start.elapsed().as_micros();
        u64::try_from(elapsed).expect("elapsed microseconds overflow a u64")
    }
}

/// A token bucket rate limiter.
///
/// Tokens refill continuously from elapsed clock time and are spent one at a
/// time by [`RateLimiter::try_acquire`]. The interior bucket is guarded by a
/// single mutex; the critical section is a handful of float operations so
/// contention stays cheap even when many producers sample concurrently.
#[derive(Debug)]
pub struct RateLimiter<C = RealClock> {
    bucket: Mutex<Bucket>,
    clock: C,
}

impl RateLimiter<RealClock> {
    /// Create a new [`RateLimiter`] driven by real-clock time.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured rate or burst is non-positive or
    /// non-finite.
    pub fn new(config: Config) -> Result<Self, Error> {
        Self::with_clock(config, RealClock::default())
    }
}

impl<C> RateLimiter<C>
where
    C: Clock,
{
    /// Create a new [`RateLimiter`] with the provided clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured rate or burst is non-positive or
    /// non-finite.
    pub fn with_clock(config: Config, clock: C) -> Result<Self, Error> {
        let bucket = Bucket::new(config.rate, config.burst)?;
        Ok(Self {
            bucket: Mutex::new(bucket),
            clock,
        })
    }

    /// Attempt to consume a single token, refilling from elapsed time first.
    ///
    /// Returns true if a token was available. Never blocks beyond the mutex
    /// and never errors after construction.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        let ticks = self.clock.ticks_elapsed();
        // A poisoned mutex means another caller panicked mid-refill. The
        // bucket state is a pair of floats and remains usable, continue with
        // the inner value.
        let mut bucket = match self.bucket.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        bucket.try_consume(ticks)
    }
}
