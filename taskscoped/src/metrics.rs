//! Metrics aggregator (C9). All hot-path counters are atomics, following
//! `cognitod`'s `Metrics` style; the published snapshot readers see
//! (`/api/metrics`) is additionally wrapped in an `ArcSwap` so concurrent
//! HTTP requests never observe a half-updated view while the sampler is
//! mid-rollup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use serde::Serialize;
use taskscope_wire::Kind;

const KIND_SLOTS: usize = 6;

fn kind_index(kind: Kind) -> usize {
    kind as u32 as usize
}

/// Sum/count pair, reset to zero at each sample (via `swap`).
struct Accumulator {
    sum: AtomicU64,
    count: AtomicU64,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn record(&self, value_ns: u64) {
        self.sum.fetch_add(value_ns, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Resets both halves and returns the mean observed since the last
    /// reset (0 if nothing was recorded).
    fn take_mean(&self) -> f64 {
        let sum = self.sum.swap(0, Ordering::Relaxed);
        let count = self.count.swap(0, Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }
}

pub struct Metrics {
    reads_this_interval: AtomicU64,
    processed_this_interval: AtomicU64,
    probe_duration: Accumulator,
    processing_time: Accumulator,
    batch_flush_duration: Accumulator,
    queue_wait: Accumulator,
    per_kind_total: [AtomicU64; KIND_SLOTS],
    lost_batches_total: AtomicU64,
    depth_sampler: Box<dyn Fn() -> usize + Send + Sync>,
    snapshot: ArcSwap<MetricsSnapshot>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct MetricsSnapshot {
    pub reads_per_second: u64,
    pub processed_per_second: u64,
    pub queue_depth: usize,
    pub mean_probe_duration_ns: f64,
    pub mean_processing_time_ns: f64,
    pub mean_batch_flush_duration_ns: f64,
    pub mean_queue_wait_ns: f64,
    pub per_kind_total: [u64; KIND_SLOTS],
    pub lost_batches_total: u64,
    pub sampled_at_unix_ms: u64,
}

impl Metrics {
    pub fn new(depth_sampler: impl Fn() -> usize + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            reads_this_interval: AtomicU64::new(0),
            processed_this_interval: AtomicU64::new(0),
            probe_duration: Accumulator::new(),
            processing_time: Accumulator::new(),
            batch_flush_duration: Accumulator::new(),
            queue_wait: Accumulator::new(),
            per_kind_total: std::array::from_fn(|_| AtomicU64::new(0)),
            lost_batches_total: AtomicU64::new(0),
            depth_sampler: Box::new(depth_sampler),
            snapshot: ArcSwap::from_pointee(MetricsSnapshot::default()),
        })
    }

    pub fn record_read(&self, queue_wait_ns: Option<u64>, probe_duration_ns: u32) {
        self.reads_this_interval.fetch_add(1, Ordering::Relaxed);
        if let Some(wait) = queue_wait_ns {
            self.queue_wait.record(wait);
        }
        self.probe_duration.record(probe_duration_ns as u64);
    }

    pub fn record_processed(&self, kind: Kind, processing_time_ns: u64) {
        self.processed_this_interval.fetch_add(1, Ordering::Relaxed);
        self.processing_time.record(processing_time_ns);
        self.per_kind_total[kind_index(kind)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_flush(&self, duration: Duration) {
        self.batch_flush_duration
            .record(duration.as_nanos() as u64);
    }

    pub fn record_lost_batch(&self) {
        self.lost_batches_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Arc<MetricsSnapshot> {
        self.snapshot.load_full()
    }

    /// Samples and resets the per-interval counters, publishing a new
    /// snapshot atomically. Called by the C9 sampler thread at a fixed
    /// cadence.
    pub fn sample(&self) {
        let per_kind_total = std::array::from_fn(|i| self.per_kind_total[i].load(Ordering::Relaxed));
        let snapshot = MetricsSnapshot {
            reads_per_second: self.reads_this_interval.swap(0, Ordering::Relaxed),
            processed_per_second: self.processed_this_interval.swap(0, Ordering::Relaxed),
            queue_depth: (self.depth_sampler)(),
            mean_probe_duration_ns: self.probe_duration.take_mean(),
            mean_processing_time_ns: self.processing_time.take_mean(),
            mean_batch_flush_duration_ns: self.batch_flush_duration.take_mean(),
            mean_queue_wait_ns: self.queue_wait.take_mean(),
            per_kind_total,
            lost_batches_total: self.lost_batches_total.load(Ordering::Relaxed),
            sampled_at_unix_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        };
        self.snapshot.store(Arc::new(snapshot));
    }

    /// Final dump written at shutdown: the last published snapshot plus
    /// final per-kind totals, as a single self-describing file.
    pub fn final_dump(&self) -> MetricsSnapshot {
        self.sample();
        (*self.snapshot.load_full()).clone()
    }
}

/// Runs the C9 sampler loop on its own thread at a fixed cadence until
/// `stop` fires.
pub fn run_sampler(metrics: Arc<Metrics>, cadence: Duration, stop: crossbeam_channel::Receiver<()>) {
    loop {
        match stop.recv_timeout(cadence) {
            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => metrics.sample(),
        }
    }
}
