//! Processor pool (C6): batches by size OR deadline, then flushes to the
//! session store and broadcast hub as one atomic unit from the worker's
//! perspective. Grounded structurally on `stream_listener.rs`'s
//! decode-then-fan-out loop, built out to add batching (the original forwards
//! one event at a time).

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::warn;
use taskscope_wire::Event;
use tokio::runtime::Handle;

use super::queue::{DequeueResult, QueueConsumer};
use crate::hub::BroadcastHub;
use crate::metrics::Metrics;
use crate::session::SessionStore;

pub struct ProcessorConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

pub struct ProcessorPool {
    handles: Vec<JoinHandle<()>>,
}

impl ProcessorPool {
    /// Spawns `worker_count` threads, each independently batching and
    /// flushing; cross-worker ordering is explicitly not guaranteed (see
    /// the concurrency model).
    pub fn spawn(
        worker_count: usize,
        consumer: QueueConsumer,
        store: Arc<dyn SessionStore>,
        hub: Arc<BroadcastHub>,
        metrics: Arc<Metrics>,
        config: ProcessorConfig,
        runtime: Handle,
    ) -> Self {
        let handles = (0..worker_count)
            .map(|worker_id| {
                let consumer = consumer.clone();
                let store = store.clone();
                let hub = hub.clone();
                let metrics = metrics.clone();
                let batch_size = config.batch_size;
                let flush_interval = config.flush_interval;
                let runtime = runtime.clone();
                thread::Builder::new()
                    .name(format!("taskscoped-processor-{worker_id}"))
                    .spawn(move || {
                        run_worker(
                            worker_id,
                            consumer,
                            store,
                            hub,
                            metrics,
                            batch_size,
                            flush_interval,
                            runtime,
                        )
                    })
                    .expect("failed to spawn processor thread")
            })
            .collect();
        Self { handles }
    }

    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_worker(
    worker_id: usize,
    consumer: QueueConsumer,
    store: Arc<dyn SessionStore>,
    hub: Arc<BroadcastHub>,
    metrics: Arc<Metrics>,
    batch_size: usize,
    flush_interval: Duration,
    runtime: Handle,
) {
    let mut batch: Vec<Event> = Vec::with_capacity(batch_size);
    let mut deadline = Instant::now() + flush_interval;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match consumer.recv_timeout(remaining) {
            DequeueResult::Event(queued) => {
                let start = Instant::now();
                batch.push(queued.event);
                let kind = queued.event.kind();
                if let Some(kind) = kind {
                    metrics.record_processed(kind, start.elapsed().as_nanos() as u64);
                }

                if batch.len() >= batch_size {
                    flush(&mut batch, &store, &hub, &metrics, &runtime);
                    deadline = Instant::now() + flush_interval;
                }
            }
            DequeueResult::Timeout => {
                flush(&mut batch, &store, &hub, &metrics, &runtime);
                deadline = Instant::now() + flush_interval;
            }
            DequeueResult::Closed => {
                for queued in consumer.drain() {
                    batch.push(queued.event);
                }
                flush(&mut batch, &store, &hub, &metrics, &runtime);
                return;
            }
        }
    }
    #[allow(unreachable_code)]
    {
        let _ = worker_id;
    }
}

fn flush(
    batch: &mut Vec<Event>,
    store: &Arc<dyn SessionStore>,
    hub: &Arc<BroadcastHub>,
    metrics: &Arc<Metrics>,
    runtime: &Handle,
) {
    if batch.is_empty() {
        return;
    }
    let start = Instant::now();
    let result = runtime.block_on(store.append_batch(batch));
    match result {
        Ok(()) => {
            hub.broadcast_batch(batch);
        }
        Err(e) => {
            warn!("batch append failed, {} events lost: {e}", batch.len());
            metrics.record_lost_batch();
        }
    }
    metrics.record_batch_flush(start.elapsed());
    batch.clear();
}
