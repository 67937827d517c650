//! Delivery seams
//!
//! Traits implemented by downstream consumers of the pipeline. Synchronous
//! [`MetricSink`]s receive individual accepted observations on the
//! completing thread and must return quickly; batch exporters and alert
//! sinks run on the runtime and may perform I/O.

use serde::Serialize;

use crate::signals::Shutdown;
use vitals_capture::metric::{MetricKind, MetricObservation};

/// The error type sinks report. Failures are isolated per sink and never
/// propagate into measured code.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// A synchronous consumer of accepted observations.
pub trait MetricSink: Send + Sync {
    /// Identifies this sink in failure logs.
    fn name(&self) -> &str;

    /// Receive one accepted observation.
    ///
    /// # Errors
    ///
    /// Implementations signal delivery failure; the pipeline logs it and
    /// continues with the remaining sinks.
    fn receive(&self, observation: &MetricObservation) -> Result<(), SinkError>;
}

/// A threshold crossing noticed at measurement completion.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Alert {
    /// Operation name the alert fired for.
    pub metric_name: String,
    /// Kind of the offending observation.
    pub kind: MetricKind,
    /// The value that crossed the threshold.
    pub observed_value: f64,
    /// The configured threshold.
    pub threshold: f64,
}

/// An asynchronous consumer of threshold alerts.
#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver one alert.
    ///
    /// # Errors
    ///
    /// Implementations signal delivery failure; the pipeline logs it and
    /// drops the alert.
    async fn deliver(&self, alert: Alert) -> Result<(), SinkError>;
}

/// An asynchronous consumer of batched items drained from the delivery
/// queue.
#[async_trait::async_trait]
pub trait BatchExport<T>: Send + Sync {
    /// Export one batch. Batches are never empty and arrive in enqueue
    /// order. `cancel` fires when the pipeline is shutting down;
    /// implementations may use it to abandon slow I/O. The queue itself
    /// never tears down a flush in progress.
    ///
    /// # Errors
    ///
    /// Implementations signal export failure; the consumer counts it and
    /// moves on to the next batch.
    async fn export(&mut self, batch: Vec<T>, cancel: &Shutdown) -> Result<(), SinkError>;
}

/// Fans each batch out to several exporters.
///
/// Failures are isolated per exporter: every destination is offered every
/// batch, a failing sibling is logged and skipped, and the fan-out itself
/// only reports failure when no destination accepted the batch.
pub struct Fanout<T> {
    exporters: Vec<Box<dyn BatchExport<T>>>,
}

impl<T> std::fmt::Debug for Fanout<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fanout")
            .field("exporters", &self.exporters.len())
            .finish()
    }
}

impl<T> Fanout<T> {
    /// Create a new `Fanout` over the given exporters.
    #[must_use]
    pub fn new(exporters: Vec<Box<dyn BatchExport<T>>>) -> Self {
        Self { exporters }
    }
}

#[async_trait::async_trait]
impl<T> BatchExport<T> for Fanout<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn export(&mut self, batch: Vec<T>, cancel: &Shutdown) -> Result<(), SinkError> {
        let mut failures = 0_usize;
        for (index, exporter) in self.exporters.iter_mut().enumerate() {
            if let Err(error) = exporter.export(batch.clone(), cancel).await {
                failures += 1;
                tracing::warn!(exporter = index, %error, "batch export failed");
            }
        }
        if failures > 0 && failures == self.exporters.len() {
            return Err("every export destination failed".into());
        }
        Ok(())
    }
}

/// A [`MetricSink`] that writes accepted observations to the tracing
/// subscriber at debug level. Useful as a development tap.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl MetricSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn receive(&self, observation: &MetricObservation) -> Result<(), SinkError> {
        tracing::debug!(
            name = %observation.name,
            kind = %observation.kind,
            value = observation.value,
            "observation"
        );
        Ok(())
    }
}
