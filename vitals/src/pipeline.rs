//! Pipeline coordination
//!
//! The [`Pipeline`] wires the engines together and exposes the one API
//! measured code touches: [`Pipeline::measure`] hands back a
//! [`Measurement`] guard, the guard collects observations, and completion
//! runs the full decision chain. Sampling is decided once per guard at
//! creation; a rejected guard costs a hash and nothing else.
//!
//! Completion work happens on the completing thread and never blocks:
//! aggregation is lock-cheap in-process bookkeeping, synchronous sinks are
//! required to return quickly and are isolated from one another, and
//! anything that could wait, alert delivery and policy-driven enqueueing,
//! is spawned onto the runtime instead.
//!
//! Duplicate suppression gates external forwarding only. Aggregates always
//! see every observation; a suppressed key still counts toward its
//! histogram or summary.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::Config;
use crate::dedupe::DuplicateGuard;
use crate::queue::{self, Handle, OverflowPolicy};
use crate::sampler::Sampler;
use crate::signals::Shutdown;
use crate::sinks::{Alert, AlertSink, BatchExport, MetricSink};
use vitals_capture::metric::{MetricKind, MetricObservation};
use vitals_capture::registry::{AggregatorKind, AggregatorSnapshot, Registry};

/// Errors produced by [`Pipeline`] construction.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// See [`crate::config::Error`] for details.
    #[error(transparent)]
    Config(#[from] crate::config::Error),
    /// See [`crate::sampler::Error`] for details.
    #[error(transparent)]
    Sampler(#[from] crate::sampler::Error),
    /// See [`crate::dedupe::Error`] for details.
    #[error(transparent)]
    Dedupe(#[from] crate::dedupe::Error),
    /// See [`crate::queue::Error`] for details.
    #[error(transparent)]
    Queue(#[from] crate::queue::Error),
    /// Construction requires a running `tokio` runtime for the delivery
    /// consumer and spawned delivery work.
    #[error("no tokio runtime available")]
    NoRuntime,
}

/// The measurement pipeline. One instance serves an application.
pub struct Pipeline {
    sampler: Sampler,
    guard: DuplicateGuard,
    registry: Arc<Registry>,
    metric_sinks: Vec<Box<dyn MetricSink>>,
    alert_sink: Option<Arc<dyn AlertSink>>,
    thresholds: FxHashMap<String, f64>,
    boundaries: FxHashMap<MetricKind, Vec<f64>>,
    queue: Handle<MetricObservation>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    shutdown: Shutdown,
    runtime: tokio::runtime::Handle,
    /// Reference instant for cooldown window arithmetic.
    epoch: Instant,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("metric_sinks", &self.metric_sinks.len())
            .field("has_alert_sink", &self.alert_sink.is_some())
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Create a new `Pipeline` and start its delivery consumer.
    ///
    /// Must be called from within a `tokio` runtime.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid configuration or when no runtime is
    /// available.
    pub fn new<E>(config: Config, exporter: E) -> Result<Self, Error>
    where
        E: BatchExport<MetricObservation> + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        config.validate()?;

        let shutdown = Shutdown::new();
        let sampler = Sampler::new(config.sampler)?;
        let guard = DuplicateGuard::new(config.dedupe)?;
        let (queue, consumer) = queue::spawn(config.queue, exporter, &shutdown)?;

        Ok(Self {
            sampler,
            guard,
            registry: Arc::new(Registry::new()),
            metric_sinks: Vec::new(),
            alert_sink: None,
            thresholds: config.thresholds,
            boundaries: config.histogram_boundaries,
            queue,
            consumer: Mutex::new(Some(consumer)),
            shutdown,
            runtime,
            epoch: Instant::now(),
        })
    }

    /// Attach a synchronous observation sink. Call before sharing the
    /// pipeline.
    pub fn add_metric_sink(&mut self, sink: Box<dyn MetricSink>) {
        self.metric_sinks.push(sink);
    }

    /// Attach the alert sink. Call before sharing the pipeline.
    pub fn set_alert_sink(&mut self, sink: Arc<dyn AlertSink>) {
        self.alert_sink = Some(sink);
    }

    /// Begin measuring the operation named `name`.
    ///
    /// The sampling decision is made here, once. A rejected guard is inert:
    /// recording into it and completing it cost nothing further.
    #[must_use]
    pub fn measure(&self, name: impl Into<String>) -> Measurement<'_> {
        let name = name.into();
        let enabled = self.sampler.should_sample(&name);
        Measurement {
            pipeline: self,
            name,
            started: Instant::now(),
            observations: Vec::new(),
            enabled,
            completed: false,
        }
    }

    /// The shared aggregator registry.
    #[must_use]
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Snapshot every aggregated metric key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, AggregatorSnapshot)> {
        self.registry.snapshot_all()
    }

    /// The producer handle of the delivery queue, exposing depth and drop
    /// counters.
    #[must_use]
    pub fn delivery(&self) -> &Handle<MetricObservation> {
        &self.queue
    }

    /// Stop the delivery consumer after draining queued observations.
    /// Idempotent; later completions still aggregate but no longer reach
    /// the queue.
    pub async fn shutdown(&self) {
        self.shutdown.signal();
        let consumer = match self.consumer.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(consumer) = consumer {
            if let Err(error) = consumer.await {
                warn!(%error, "delivery consumer terminated abnormally");
            }
        }
    }

    /// Run the completion chain for one finished measurement.
    fn complete(&self, name: &str, observations: &[(MetricKind, f64)]) {
        let now = self.epoch.elapsed();
        let timestamp = SystemTime::now();
        for &(kind, raw) in observations {
            // Clock skew between start and completion reads as a negative
            // elapsed time; report zero rather than a nonsense value.
            let value = match kind {
                MetricKind::Duration | MetricKind::CpuTime => raw.max(0.0),
                MetricKind::AllocatedBytes => raw,
            };
            if !value.is_finite() {
                debug!(name, %kind, value, "discarding non-finite observation");
                continue;
            }

            let key = format!("{name}:{kind}");
            let shape = self.boundaries.get(&kind).map_or(
                AggregatorKind::Summary,
                |boundaries| AggregatorKind::Histogram(boundaries.clone()),
            );
            match self.registry.get_or_create(&key, &shape) {
                Ok(aggregator) => aggregator.observe(value),
                Err(error) => warn!(key, %error, "aggregation failed"),
            }

            if !self.guard.should_emit(&key, now) {
                continue;
            }
            let observation = MetricObservation {
                name: name.to_string(),
                kind,
                value,
                timestamp,
            };
            for sink in &self.metric_sinks {
                if let Err(error) = sink.receive(&observation) {
                    warn!(sink = sink.name(), %error, "metric sink failed");
                }
            }
            self.maybe_alert(&key, &observation);
            self.forward(observation);
        }
    }

    fn maybe_alert(&self, key: &str, observation: &MetricObservation) {
        let Some(sink) = &self.alert_sink else {
            return;
        };
        let Some(&threshold) = self.thresholds.get(key) else {
            return;
        };
        if observation.value <= threshold {
            return;
        }
        let alert = Alert {
            metric_name: observation.name.clone(),
            kind: observation.kind,
            observed_value: observation.value,
            threshold,
        };
        let sink = Arc::clone(sink);
        self.runtime.spawn(async move {
            if let Err(error) = sink.deliver(alert).await {
                warn!(%error, "alert delivery failed");
            }
        });
    }

    /// Hand the observation to the delivery queue. The reject policy is
    /// served inline; waiting policies move to the runtime so the
    /// completing thread never sleeps.
    fn forward(&self, observation: MetricObservation) {
        match self.queue.policy() {
            OverflowPolicy::RejectNewest => {
                if !self.queue.try_enqueue(observation) {
                    debug!("delivery queue full, observation dropped");
                }
            }
            OverflowPolicy::DropOldest | OverflowPolicy::BackoffRetry => {
                let queue = self.queue.clone();
                self.runtime.spawn(async move {
                    if !queue.enqueue(observation).await {
                        debug!("delivery queue full, observation dropped");
                    }
                });
            }
        }
    }
}

/// RAII guard over one in-flight operation.
///
/// Elapsed wall-clock time is recorded automatically at completion unless
/// the caller recorded an explicit duration. Completion runs exactly once,
/// on [`Measurement::finish`] or on drop, whichever comes first.
pub struct Measurement<'a> {
    pipeline: &'a Pipeline,
    name: String,
    started: Instant,
    observations: Vec<(MetricKind, f64)>,
    enabled: bool,
    completed: bool,
}

impl std::fmt::Debug for Measurement<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Measurement")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("observations", &self.observations.len())
            .finish_non_exhaustive()
    }
}

impl Measurement<'_> {
    /// Whether this operation was selected for measurement.
    #[must_use]
    pub fn is_sampled(&self) -> bool {
        self.enabled
    }

    /// Record one observation against this operation.
    pub fn record(&mut self, kind: MetricKind, value: f64) {
        if self.enabled {
            self.observations.push((kind, value));
        }
    }

    /// Complete the measurement now instead of at drop.
    pub fn finish(mut self) {
        self.complete();
    }

    fn complete(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        if !self.enabled {
            return;
        }
        let has_duration = self
            .observations
            .iter()
            .any(|(kind, _)| *kind == MetricKind::Duration);
        if !has_duration {
            let elapsed_ms = self.started.elapsed().as_secs_f64() * 1_000.0;
            self.observations.push((MetricKind::Duration, elapsed_ms));
        }
        self.pipeline.complete(&self.name, &self.observations);
    }
}

impl Drop for Measurement<'_> {
    fn drop(&mut self) {
        self.complete();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::Pipeline;
    use crate::config::Config;
    use crate::signals::Shutdown;
    use crate::sinks::{Alert, AlertSink, BatchExport, Fanout, MetricSink, SinkError};
    use vitals_capture::metric::{MetricKind, MetricObservation};
    use vitals_capture::registry::AggregatorSnapshot;

    #[derive(Default, Clone)]
    struct Exporter {
        observations: Arc<Mutex<Vec<MetricObservation>>>,
    }

    #[async_trait::async_trait]
    impl BatchExport<MetricObservation> for Exporter {
        async fn export(
            &mut self,
            batch: Vec<MetricObservation>,
            _cancel: &Shutdown,
        ) -> Result<(), SinkError> {
            self.observations.lock().expect("exporter lock").extend(batch);
            Ok(())
        }
    }

    #[derive(Default, Clone)]
    struct CollectingSink {
        received: Arc<Mutex<Vec<MetricObservation>>>,
    }

    impl MetricSink for CollectingSink {
        fn name(&self) -> &str {
            "collecting"
        }

        fn receive(&self, observation: &MetricObservation) -> Result<(), SinkError> {
            self.received
                .lock()
                .expect("sink lock")
                .push(observation.clone());
            Ok(())
        }
    }

    struct ChannelAlertSink {
        tx: mpsc::UnboundedSender<Alert>,
    }

    #[async_trait::async_trait]
    impl AlertSink for ChannelAlertSink {
        async fn deliver(&self, alert: Alert) -> Result<(), SinkError> {
            self.tx.send(alert).map_err(|e| -> SinkError { e.to_string().into() })
        }
    }

    fn sampled_config() -> Config {
        Config::from_yaml("sampler:\n  base_probability: 1.0\n").expect("config parses")
    }

    #[tokio::test]
    async fn completion_aggregates_and_forwards() {
        let exporter = Exporter::default();
        let sink = CollectingSink::default();
        let mut pipeline =
            Pipeline::new(sampled_config(), exporter.clone()).expect("pipeline starts");
        pipeline.add_metric_sink(Box::new(sink.clone()));

        let mut measurement = pipeline.measure("OrderService.PlaceOrder");
        assert!(measurement.is_sampled());
        measurement.record(MetricKind::CpuTime, 5.0);
        measurement.finish();

        let snapshot = pipeline.snapshot();
        let keys: Vec<&str> = snapshot.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "OrderService.PlaceOrder:cpu_time",
                "OrderService.PlaceOrder:duration"
            ]
        );

        let received = sink.received.lock().expect("sink lock").clone();
        assert_eq!(received.len(), 2);

        pipeline.shutdown().await;
        let exported = exporter.observations.lock().expect("exporter lock").len();
        assert_eq!(exported, 2);
    }

    #[tokio::test]
    async fn completion_runs_exactly_once() {
        let pipeline =
            Pipeline::new(sampled_config(), Exporter::default()).expect("pipeline starts");

        // Dropped without finish.
        {
            let mut measurement = pipeline.measure("op");
            measurement.record(MetricKind::CpuTime, 1.0);
        }
        // Finished explicitly, drop must not complete again.
        let mut measurement = pipeline.measure("op");
        measurement.record(MetricKind::CpuTime, 2.0);
        measurement.finish();

        let snapshot = pipeline.snapshot();
        let (_, cpu) = snapshot
            .iter()
            .find(|(key, _)| key == "op:cpu_time")
            .expect("cpu_time aggregated");
        match cpu {
            AggregatorSnapshot::Summary(summary) => assert_eq!(summary.count, 2),
            AggregatorSnapshot::Histogram(_) => panic!("expected summary"),
        }
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn unsampled_measurements_cost_nothing_downstream() {
        let config = Config::from_yaml("sampler:\n  base_probability: 0.0\n")
            .expect("config parses");
        let sink = CollectingSink::default();
        let mut pipeline = Pipeline::new(config, Exporter::default()).expect("pipeline starts");
        pipeline.add_metric_sink(Box::new(sink.clone()));

        let mut measurement = pipeline.measure("op");
        assert!(!measurement.is_sampled());
        measurement.record(MetricKind::CpuTime, 5.0);
        measurement.finish();

        assert!(pipeline.snapshot().is_empty());
        assert!(sink.received.lock().expect("sink lock").is_empty());
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn suppression_gates_forwarding_but_not_aggregation() {
        let sink = CollectingSink::default();
        let mut pipeline =
            Pipeline::new(sampled_config(), Exporter::default()).expect("pipeline starts");
        pipeline.add_metric_sink(Box::new(sink.clone()));

        pipeline.measure("op").finish();
        pipeline.measure("op").finish();

        let snapshot = pipeline.snapshot();
        let (_, duration) = snapshot
            .iter()
            .find(|(key, _)| key == "op:duration")
            .expect("duration aggregated");
        match duration {
            AggregatorSnapshot::Summary(summary) => assert_eq!(summary.count, 2),
            AggregatorSnapshot::Histogram(_) => panic!("expected summary"),
        }
        // Second completion of the same key fell inside the cooldown.
        assert_eq!(sink.received.lock().expect("sink lock").len(), 1);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn threshold_crossing_raises_an_alert() {
        let contents = "
sampler:
  base_probability: 1.0
thresholds:
  'op:cpu_time': 10.0
";
        let config = Config::from_yaml(contents).expect("config parses");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pipeline = Pipeline::new(config, Exporter::default()).expect("pipeline starts");
        pipeline.set_alert_sink(Arc::new(ChannelAlertSink { tx }));

        let mut measurement = pipeline.measure("op");
        measurement.record(MetricKind::CpuTime, 50.0);
        measurement.finish();

        let alert = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("alert within deadline")
            .expect("alert channel open");
        assert_eq!(alert.metric_name, "op");
        assert_eq!(alert.kind, MetricKind::CpuTime);
        assert!((alert.observed_value - 50.0).abs() < f64::EPSILON);
        assert!((alert.threshold - 10.0).abs() < f64::EPSILON);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn values_under_threshold_stay_quiet() {
        let contents = "
thresholds:
  'op:cpu_time': 10.0
";
        let config = Config::from_yaml(contents).expect("config parses");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pipeline = Pipeline::new(config, Exporter::default()).expect("pipeline starts");
        pipeline.set_alert_sink(Arc::new(ChannelAlertSink { tx }));

        let mut measurement = pipeline.measure("op");
        measurement.record(MetricKind::CpuTime, 10.0);
        measurement.finish();
        pipeline.shutdown().await;

        assert!(rx.try_recv().is_err());
    }

    struct FailingExporter;

    #[async_trait::async_trait]
    impl BatchExport<MetricObservation> for FailingExporter {
        async fn export(
            &mut self,
            _batch: Vec<MetricObservation>,
            _cancel: &Shutdown,
        ) -> Result<(), SinkError> {
            Err("destination down".into())
        }
    }

    #[tokio::test]
    async fn failing_export_destination_does_not_starve_siblings() {
        let good = Exporter::default();
        let fanout = Fanout::new(vec![
            Box::new(FailingExporter) as Box<dyn BatchExport<MetricObservation>>,
            Box::new(good.clone()),
        ]);
        let pipeline = Pipeline::new(sampled_config(), fanout).expect("pipeline starts");

        pipeline.measure("op").finish();
        pipeline.shutdown().await;

        let exported = good.observations.lock().expect("exporter lock").len();
        assert_eq!(exported, 1);
    }

    #[tokio::test]
    async fn negative_cpu_time_clamps_to_zero() {
        let pipeline =
            Pipeline::new(sampled_config(), Exporter::default()).expect("pipeline starts");

        let mut measurement = pipeline.measure("op");
        measurement.record(MetricKind::CpuTime, -5.0);
        measurement.finish();

        let snapshot = pipeline.snapshot();
        let (_, cpu) = snapshot
            .iter()
            .find(|(key, _)| key == "op:cpu_time")
            .expect("cpu_time aggregated");
        match cpu {
            AggregatorSnapshot::Summary(summary) => {
                assert_eq!(summary.count, 1);
                assert!((summary.min - 0.0).abs() < f64::EPSILON);
                assert!((summary.max - 0.0).abs() < f64::EPSILON);
            }
            AggregatorSnapshot::Histogram(_) => panic!("expected summary"),
        }
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn negative_durations_clamp_to_zero() {
        let pipeline =
            Pipeline::new(sampled_config(), Exporter::default()).expect("pipeline starts");

        let mut measurement = pipeline.measure("op");
        measurement.record(MetricKind::Duration, -5.0);
        measurement.finish();

        let snapshot = pipeline.snapshot();
        let (_, duration) = snapshot
            .iter()
            .find(|(key, _)| key == "op:duration")
            .expect("duration aggregated");
        match duration {
            AggregatorSnapshot::Summary(summary) => {
                assert_eq!(summary.count, 1);
                assert!((summary.min - 0.0).abs() < f64::EPSILON);
            }
            AggregatorSnapshot::Histogram(_) => panic!("expected summary"),
        }
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn configured_kinds_aggregate_into_histograms() {
        let contents = "
histogram_boundaries:
  duration: [10.0, 100.0]
";
        let config = Config::from_yaml(contents).expect("config parses");
        let pipeline = Pipeline::new(config, Exporter::default()).expect("pipeline starts");

        pipeline.measure("op").finish();

        let snapshot = pipeline.snapshot();
        let (_, duration) = snapshot
            .iter()
            .find(|(key, _)| key == "op:duration")
            .expect("duration aggregated");
        match duration {
            AggregatorSnapshot::Histogram(histogram) => {
                assert_eq!(histogram.count, 1);
                assert_eq!(histogram.boundaries, vec![10.0, 100.0]);
            }
            AggregatorSnapshot::Summary(_) => panic!("expected histogram"),
        }
        pipeline.shutdown().await;
    }
}
