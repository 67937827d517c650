//! The vitals in-process measurement pipeline.
//!
//! This library is the hot path of a performance-telemetry system: it
//! decides whether an operation is measured at all ([`sampler`]), suppresses
//! repeated identical signals within a cooldown window ([`dedupe`]),
//! aggregates raw observations into space-bounded summaries (the
//! `vitals-capture` crate), and delivers accepted observations to downstream
//! sinks under backpressure without blocking the measured code
//! ([`queue`]). The [`pipeline`] module ties the engines together behind a
//! measurement guard.

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

pub mod config;
pub mod dedupe;
pub mod pipeline;
pub mod queue;
pub mod sampler;
pub mod signals;
pub mod sinks;

pub use vitals_capture::metric::{MetricKind, MetricObservation};
pub use vitals_capture::registry::{AggregatorKind, AggregatorSnapshot, Registry};
