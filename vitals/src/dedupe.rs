//! Duplicate signal suppression
//!
//! The [`DuplicateGuard`] answers, per metric key, "has this key already
//! been emitted within the current cooldown window?" using two fixed-size
//! atomic bit banks. Time is divided into windows of the cooldown length;
//! each key sets two bits in the active bank, chosen by independent hashes,
//! and is suppressed while both bits are already set.
//!
//! Rotation swaps the banks when the window advances: the inactive bank is
//! cleared first and only then made active, so concurrent callers never
//! observe a half-cleared bank. Memory is bounded by the configured bit
//! width regardless of key cardinality; hash collisions can suppress a key
//! that was never emitted, never the reverse kind of error a set-based
//! filter would avoid at unbounded cost.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

/// Smallest permitted bank width, in bits.
const MIN_BITS: usize = 65_536;
/// Largest permitted bank width, 128 MiB of bits per bank.
const MAX_BITS: usize = 1 << 30;

/// Errors produced by [`DuplicateGuard`] construction.
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum Error {
    /// The cooldown window must be non-zero.
    #[error("cooldown window must be non-zero")]
    ZeroCooldown,
}

fn default_bits() -> u64 {
    MIN_BITS as u64
}

fn default_cooldown() -> Duration {
    Duration::from_secs(10)
}

/// Configuration of a [`DuplicateGuard`].
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Length of the suppression window.
    #[serde(default = "default_cooldown")]
    pub cooldown: Duration,
    /// Bank width in bits. Rounded up to a power of two, floor of 65,536.
    #[serde(default = "default_bits")]
    pub bits: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cooldown: default_cooldown(),
            bits: default_bits(),
        }
    }
}

/// Cooldown filter over metric keys with two rotating bit banks.
#[derive(Debug)]
pub struct DuplicateGuard {
    banks: [Box<[AtomicU64]>; 2],
    /// Index of the bank serving the current window.
    active: AtomicUsize,
    /// Window ordinal the active bank belongs to.
    window: AtomicU64,
    /// Serializes rotation. Bit operations never take this lock.
    rotate: Mutex<()>,
    mask: usize,
    cooldown_micros: u64,
}

impl DuplicateGuard {
    /// Create a new `DuplicateGuard`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured cooldown is zero.
    pub fn new(config: Config) -> Result<Self, Error> {
        if config.cooldown.is_zero() {
            return Err(Error::ZeroCooldown);
        }
        let bits = usize::try_from(config.bits)
            .unwrap_or(MAX_BITS)
            .clamp(MIN_BITS, MAX_BITS)
            .next_power_of_two();
        let words = bits / 64;
        let bank = || (0..words).map(|_| AtomicU64::new(0)).collect();
        Ok(Self {
            banks: [bank(), bank()],
            active: AtomicUsize::new(0),
            window: AtomicU64::new(0),
            rotate: Mutex::new(()),
            mask: bits - 1,
            cooldown_micros: u64::try_from(config.cooldown.as_micros())
                .unwrap_or(u64::MAX)
                .max(1),
        })
    }

    /// Decide whether `key` may be emitted at `now`, time since the caller's
    /// epoch. Returns `false` while the key is inside its cooldown window.
    ///
    /// Lock-free except on the first call of each new window, which rotates
    /// the banks under a mutex.
    pub fn should_emit(&self, key: &str, now: Duration) -> bool {
        let window = u64::try_from(now.as_micros()).unwrap_or(u64::MAX) / self.cooldown_micros;
        if window > self.window.load(Ordering::Acquire) {
            self.rotate_to(window);
        }

        let hash = {
            let mut hasher = FxHasher::default();
            hasher.write(key.as_bytes());
            hasher.finish()
        };
        let first = bit_index(hash, self.mask);
        let second = bit_index(avalanche(hash), self.mask);

        let bank = &self.banks[self.active.load(Ordering::Acquire)];
        let first_word = &bank[first / 64];
        let second_word = &bank[second / 64];
        let first_bit = 1_u64 << (first % 64);
        let second_bit = 1_u64 << (second % 64);

        let first_seen = first_word.fetch_or(first_bit, Ordering::AcqRel) & first_bit != 0;
        let second_seen = second_word.fetch_or(second_bit, Ordering::AcqRel) & second_bit != 0;
        !(first_seen && second_seen)
    }

    /// Advance the banks to `window`. Idempotent and forward-only: a stale
    /// caller that lost the race, or one holding a backward clock reading,
    /// leaves the banks alone.
    fn rotate_to(&self, window: u64) {
        let _guard = match self.rotate.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if window <= self.window.load(Ordering::Acquire) {
            return;
        }
        let next = 1 - self.active.load(Ordering::Acquire);
        for word in &*self.banks[next] {
            word.store(0, Ordering::Relaxed);
        }
        self.active.store(next, Ordering::Release);
        self.window.store(window, Ordering::Release);
    }
}

/// The bank width is a power of two no wider than the word size, so the
/// masked hash always fits.
#[allow(clippy::cast_possible_truncation)]
fn bit_index(hash: u64, mask: usize) -> usize {
    (hash as usize) & mask
}

/// splitmix64-style finisher, giving a second index independent of the low
/// bits of the raw hash.
fn avalanche(mut hash: u64) -> u64 {
    hash ^= hash >> 30;
    hash = hash.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    hash ^= hash >> 27;
    hash = hash.wrapping_mul(0x94d0_49bb_1331_11eb);
    hash ^ (hash >> 31)
}
