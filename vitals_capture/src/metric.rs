//! The metric data model shared across the pipeline.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// The kind of quantity a measurement produced.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Elapsed wall-clock time of the operation, in milliseconds.
    Duration,
    /// Bytes allocated over the lifetime of the operation.
    AllocatedBytes,
    /// CPU time consumed by the operation, in milliseconds.
    CpuTime,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Rendered names are part of metric keys and must stay stable.
        let name = match self {
            MetricKind::Duration => "duration",
            MetricKind::AllocatedBytes => "allocated_bytes",
            MetricKind::CpuTime => "cpu_time",
        };
        f.write_str(name)
    }
}

/// A single completed measurement.
///
/// Created once per completed operation and read-only afterward.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricObservation {
    /// Logical operation identifier, for instance `OrderService.PlaceOrder`.
    pub name: String,
    /// The quantity kind this observation carries.
    pub kind: MetricKind,
    /// The observed value.
    pub value: f64,
    /// The UTC instant the measurement completed.
    pub timestamp: SystemTime,
}

impl MetricObservation {
    /// Render the metric key this observation aggregates under,
    /// `name:kind`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.name, self.kind)
    }
}
