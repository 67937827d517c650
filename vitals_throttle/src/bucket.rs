//! Token bucket interior
//!
//! The non-clocked interior of the rate limiter, about which we can make
//! proof claims. Refill is computed from absolute tick readings so the
//! structure holds no opinion about where time comes from.

use crate::{Error, TICKS_PER_SECOND};

#[derive(Debug)]
/// A token bucket.
///
/// Tokens accumulate at `rate` per second up to `capacity` and are spent one
/// at a time. The invariant `0 <= tokens <= capacity` holds at all times.
pub(crate) struct Bucket {
    /// Tokens added per second of elapsed time.
    rate: f64,
    /// The maximum number of tokens the bucket may hold.
    capacity: f64,
    /// Tokens currently available, clamped to `[0, capacity]`.
    tokens: f64,
    /// The absolute tick reading at the last refill.
    last_refill_ticks: u64,
}

impl Bucket {
    /// Create a new `Bucket`, full at creation.
    ///
    /// # Errors
    ///
    /// Returns an error if `rate` or `capacity` is non-positive or
    /// non-finite.
    pub(crate) fn new(rate: f64, capacity: f64) -> Result<Self, Error> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(Error::NonPositiveRate(rate));
        }
        if !(capacity.is_finite() && capacity > 0.0) {
            return Err(Error::NonPositiveBurst(capacity));
        }
        Ok(Self {
            rate,
            capacity,
            tokens: capacity,
            last_refill_ticks: 0,
        })
    }

    /// Refill from elapsed time, then spend one token if available.
    ///
    /// `ticks_elapsed` is an absolute reading. Readings that run backward --
    /// possible when concurrent callers race to the mutex -- contribute no
    /// refill rather than a negative one.
    pub(crate) fn try_consume(&mut self, ticks_elapsed: u64) -> bool {
        if ticks_elapsed > self.last_refill_ticks {
            let delta = ticks_elapsed - self.last_refill_ticks;
            let gained = (delta as f64 / TICKS_PER_SECOND as f64) * self.rate;
            self.tokens = (self.tokens + gained).min(self.capacity);
            self.last_refill_ticks = ticks_elapsed;
        }

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn tokens(&self) -> f64 {
        self.tokens
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> f64 {
        self.capacity
    }
}
