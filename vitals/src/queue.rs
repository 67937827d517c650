//! Backpressure-aware delivery queue
//!
//! Accepted observations cross from the measured thread to a background
//! consumer through a bounded channel. The producer side never blocks the
//! measured code: when the channel is full the configured
//! [`OverflowPolicy`] decides between rejecting the new item, retrying
//! briefly in the hope the consumer drains, or backing off with doubling
//! sub-millisecond sleeps. Every drop is counted, never silent.
//!
//! The consumer greedily packs batches up to `max_batch` and hands them to
//! a [`BatchExport`] implementation. Export failures are counted and the
//! consumer moves on; a misbehaving exporter cannot wedge the queue. On
//! shutdown the consumer drains whatever is already queued, flushes, and
//! exits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::signals::Shutdown;
use crate::sinks::BatchExport;

/// Yield-based retries before a `DropOldest` producer gives up.
const DRAIN_RETRIES: u32 = 8;
/// Sleep-based retries before a `BackoffRetry` producer gives up.
const BACKOFF_RETRIES: u32 = 5;
/// First `BackoffRetry` sleep; doubles per retry, 100us through 1.6ms.
const BACKOFF_INITIAL: Duration = Duration::from_micros(100);

/// Errors produced by [`spawn`].
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum Error {
    /// Queue capacity must be non-zero.
    #[error("queue capacity must be non-zero")]
    ZeroCapacity,
    /// Batch size must be non-zero.
    #[error("max batch size must be non-zero")]
    ZeroBatch,
}

/// Producer behavior when the queue is full.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the incoming item immediately.
    #[default]
    RejectNewest,
    /// Yield to the consumer a bounded number of times, preferring queued
    /// items over the incoming one if the queue stays full. Best effort:
    /// the incoming item is the one discarded when no room appears.
    DropOldest,
    /// Retry with doubling sub-millisecond sleeps, abandoning the item on
    /// shutdown or once the retry budget is spent.
    BackoffRetry,
}

fn default_capacity() -> usize {
    1024
}

fn default_max_batch() -> usize {
    64
}

/// Configuration of the delivery queue.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Maximum queued items.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Maximum items handed to the exporter per batch.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    /// Behavior when the queue is full.
    #[serde(default)]
    pub policy: OverflowPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            max_batch: default_max_batch(),
            policy: OverflowPolicy::default(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

/// Producer handle to the delivery queue. Cloneable across threads.
pub struct Handle<T> {
    tx: mpsc::Sender<T>,
    counters: Arc<Counters>,
    policy: OverflowPolicy,
    shutdown: Shutdown,
}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("enqueued", &self.enqueued())
            .field("dropped", &self.dropped())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            counters: Arc::clone(&self.counters),
            policy: self.policy,
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<T> Handle<T> {
    /// Offer `item` without waiting, regardless of the configured policy.
    /// Returns `false` and counts a drop when the queue is full or closed.
    pub fn try_enqueue(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => {
                self.record_enqueue();
                true
            }
            Err(_) => {
                self.record_drop();
                false
            }
        }
    }

    /// Offer `item` under the configured overflow policy. Returns `false`
    /// and counts a drop when the item could not be queued.
    pub async fn enqueue(&self, item: T) -> bool {
        match self.policy {
            OverflowPolicy::RejectNewest => self.try_enqueue(item),
            OverflowPolicy::DropOldest => self.enqueue_yielding(item).await,
            OverflowPolicy::BackoffRetry => self.enqueue_backoff(item).await,
        }
    }

    async fn enqueue_yielding(&self, mut item: T) -> bool {
        for _ in 0..DRAIN_RETRIES {
            match self.tx.try_send(item) {
                Ok(()) => {
                    self.record_enqueue();
                    return true;
                }
                Err(mpsc::error::TrySendError::Full(returned)) => {
                    item = returned;
                    tokio::task::yield_now().await;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
        self.record_drop();
        false
    }

    async fn enqueue_backoff(&self, mut item: T) -> bool {
        let mut delay = BACKOFF_INITIAL;
        let mut shutdown = self.shutdown.clone();
        for _ in 0..BACKOFF_RETRIES {
            match self.tx.try_send(item) {
                Ok(()) => {
                    self.record_enqueue();
                    return true;
                }
                Err(mpsc::error::TrySendError::Full(returned)) => {
                    item = returned;
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = shutdown.recv() => {
                            self.record_drop();
                            return false;
                        }
                    }
                    delay *= 2;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
        self.record_drop();
        false
    }

    /// The configured overflow policy.
    #[must_use]
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Items accepted into the queue so far.
    #[must_use]
    pub fn enqueued(&self) -> u64 {
        self.counters.enqueued.load(Ordering::Relaxed)
    }

    /// Items discarded at the producer side so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Items currently queued.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    fn record_enqueue(&self) {
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        counter!("delivery_enqueued").increment(1);
        gauge!("delivery_queue_depth").set(self.depth() as f64);
    }

    fn record_drop(&self) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        counter!("delivery_dropped").increment(1);
    }
}

/// Start the delivery queue, returning the producer handle and the consumer
/// task.
///
/// The consumer runs until `shutdown` fires or every handle is dropped,
/// then drains and flushes what remains.
///
/// # Errors
///
/// Returns an error if the capacity or batch size is zero.
pub fn spawn<T, E>(
    config: Config,
    exporter: E,
    shutdown: &Shutdown,
) -> Result<(Handle<T>, JoinHandle<()>), Error>
where
    T: Send + 'static,
    E: BatchExport<T> + 'static,
{
    if config.capacity == 0 {
        return Err(Error::ZeroCapacity);
    }
    if config.max_batch == 0 {
        return Err(Error::ZeroBatch);
    }

    let (tx, rx) = mpsc::channel(config.capacity);
    let handle = Handle {
        tx,
        counters: Arc::new(Counters::default()),
        policy: config.policy,
        shutdown: shutdown.clone(),
    };
    let consumer = tokio::spawn(consume(rx, exporter, config.max_batch, shutdown.clone()));
    Ok((handle, consumer))
}

async fn consume<T, E>(
    mut rx: mpsc::Receiver<T>,
    mut exporter: E,
    max_batch: usize,
    mut shutdown: Shutdown,
) where
    T: Send + 'static,
    E: BatchExport<T> + 'static,
{
    let mut batch = Vec::with_capacity(max_batch);
    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(item) = maybe else { break };
                batch.push(item);
                while batch.len() < max_batch {
                    let Ok(item) = rx.try_recv() else { break };
                    batch.push(item);
                }
                flush(&mut exporter, &mut batch, &shutdown).await;
            }
            () = shutdown.recv() => {
                debug!("delivery queue draining on shutdown");
                while let Ok(item) = rx.try_recv() {
                    batch.push(item);
                    if batch.len() == max_batch {
                        flush(&mut exporter, &mut batch, &shutdown).await;
                    }
                }
                flush(&mut exporter, &mut batch, &shutdown).await;
                break;
            }
        }
        gauge!("delivery_queue_depth").set(rx.len() as f64);
    }
    flush(&mut exporter, &mut batch, &shutdown).await;
}

async fn flush<T, E>(exporter: &mut E, batch: &mut Vec<T>, cancel: &Shutdown)
where
    E: BatchExport<T>,
{
    if batch.is_empty() {
        return;
    }
    let size = batch.len();
    let start = Instant::now();
    match exporter.export(std::mem::take(batch), cancel).await {
        Ok(()) => {
            histogram!("delivery_flush_seconds").record(start.elapsed().as_secs_f64());
            counter!("delivery_exported").increment(size as u64);
        }
        Err(error) => {
            // The exporter seam owns failure reporting; the queue only
            // counts.
            counter!("delivery_export_failures").increment(1);
            debug!(%error, size, "batch export returned an error");
        }
    }
}
