//! Ringbuffer reader pool (C4). Grounded on `runtime/stream_listener.rs`'s
//! blocking read loop, generalized from a single Linux `RingBuf` listener to
//! an `N`-worker pool over any `RecordSource`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use taskscope_wire::{Event, EVENT_SIZE};

use super::queue::QueueProducer;
use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy)]
pub struct QueuedEvent {
    pub event: Event,
    /// userspace_now - event.timestamp, nanoseconds. None if the clocks
    /// disagreed (producer-side timestamp ahead of the consumer read).
    pub queue_wait_ns: Option<u64>,
}

/// One whole fixed-size record, or `None` at clean end-of-stream.
pub enum ReadOutcome {
    Record(Vec<u8>),
    Eof,
    /// Short read or corrupt framing; skip exactly one record's worth and
    /// continue.
    Malformed,
}

/// The kernel-probe-facing collaborator boundary: a byte-stream of whole
/// fixed-size records. The probe program's attach logic and sampling
/// decision live outside this trait entirely; this is just the consumer
/// side of the ringbuffer handle.
pub trait RecordSource: Send {
    fn read(&mut self) -> ReadOutcome;
}

/// Loads a precompiled ring-buffer map and reads whole records from it.
/// Per-symbol attach is an external collaborator's job; this type only
/// consumes what's already been placed in the buffer.
#[cfg(feature = "linux-probe")]
pub struct AyaRingbufferSource {
    ring: aya::maps::ring_buf::RingBuf<aya::maps::MapData>,
}

#[cfg(feature = "linux-probe")]
impl AyaRingbufferSource {
    pub fn new(ring: aya::maps::ring_buf::RingBuf<aya::maps::MapData>) -> Self {
        Self { ring }
    }
}

#[cfg(feature = "linux-probe")]
impl RecordSource for AyaRingbufferSource {
    fn read(&mut self) -> ReadOutcome {
        match self.ring.next() {
            Some(item) => {
                if item.len() == EVENT_SIZE {
                    ReadOutcome::Record(item.to_vec())
                } else {
                    ReadOutcome::Malformed
                }
            }
            None => ReadOutcome::Eof,
        }
    }
}

/// Generates synthetic records for tests and scenario replay, standing in
/// for a live ringbuffer. Grounded on `cognitod`'s `fake_events.rs` demo
/// generator.
pub struct SyntheticSource {
    events: std::vec::IntoIter<Event>,
}

impl SyntheticSource {
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events: events.into_iter(),
        }
    }
}

impl RecordSource for SyntheticSource {
    fn read(&mut self) -> ReadOutcome {
        match self.events.next() {
            Some(event) => ReadOutcome::Record(event.to_le_bytes().to_vec()),
            None => ReadOutcome::Eof,
        }
    }
}

fn monotonic_now_ns() -> u64 {
    // The kernel stamps monotonic nanoseconds; userspace approximates with
    // wall-clock since process start is not tracked here. Good enough for
    // queue-wait sign checks, which is all this value is used for.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

pub struct ReaderPool {
    handles: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl ReaderPool {
    /// Spawns `sources.len()` worker threads, one per `RecordSource`. Each
    /// worker runs until its source reports EOF or the pool is stopped.
    /// `reads_per_second` is counted here, at the point a record is
    /// actually decoded off the source, not downstream at C6 dequeue, so it
    /// reflects C4's own read rate rather than shadowing `processed/s`.
    pub fn spawn(
        sources: Vec<Box<dyn RecordSource>>,
        producer: QueueProducer,
        metrics: Arc<Metrics>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let handles = sources
            .into_iter()
            .enumerate()
            .map(|(worker_id, mut source)| {
                let producer = producer.clone();
                let stop = stop.clone();
                let metrics = metrics.clone();
                thread::Builder::new()
                    .name(format!("taskscoped-reader-{worker_id}"))
                    .spawn(move || loop {
                        if stop.load(Ordering::Relaxed) {
                            return;
                        }
                        match source.read() {
                            ReadOutcome::Record(bytes) => {
                                let event = match Event::from_le_bytes(&bytes) {
                                    Some(event) => event,
                                    None => {
                                        warn!("reader {worker_id}: malformed record, skipping");
                                        continue;
                                    }
                                };
                                let now = monotonic_now_ns();
                                let queue_wait_ns = now.checked_sub(event.timestamp);
                                if queue_wait_ns.is_none() {
                                    debug!(
                                        "reader {worker_id}: negative queue wait (clock skew)"
                                    );
                                }
                                metrics.record_read(queue_wait_ns, event.probe_duration_ns);
                                if producer
                                    .send(QueuedEvent {
                                        event,
                                        queue_wait_ns,
                                    })
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            ReadOutcome::Malformed => {
                                warn!("reader {worker_id}: short read, skipping one record");
                            }
                            ReadOutcome::Eof => return,
                        }
                    })
                    .expect("failed to spawn reader thread")
            })
            .collect();
        Self { handles, stop }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}
