//! Streaming aggregation for the vitals telemetry pipeline
//!
//! This library turns unbounded streams of raw observations into
//! space-bounded statistical summaries. Two aggregator shapes are supported:
//! a bucketed [`histogram::Histogram`] with fixed boundaries and a
//! [`quantile::Summary`] that approximates percentiles with the P² streaming
//! estimator, O(1) memory per metric regardless of traffic volume. The
//! [`registry::Registry`] keys aggregators by metric name and exposes
//! copy-on-read snapshots for export.

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

pub mod histogram;
pub mod metric;
pub mod quantile;
pub mod registry;

use std::sync::atomic::{AtomicU64, Ordering};

/// An `f64` stored in an `AtomicU64` via its bit representation.
///
/// Addition and min/max tracking run as compare-exchange loops. This is the
/// same storage trick the metrics ecosystem uses for lock-free gauges.
#[derive(Debug)]
pub(crate) struct AtomicF64 {
    bits: AtomicU64,
}

impl AtomicF64 {
    pub(crate) fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    pub(crate) fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub(crate) fn add(&self, delta: f64) {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self.bits.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn fetch_min(&self, value: f64) {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            if f64::from_bits(current) <= value {
                break;
            }
            match self.bits.compare_exchange_weak(
                current,
                value.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn fetch_max(&self, value: f64) {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            if f64::from_bits(current) >= value {
                break;
            }
            match self.bits.compare_exchange_weak(
                current,
                value.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}
