//! Bounded multi-producer multi-consumer queue (C5). `crossbeam-channel`
//! gives us the blocking bounded semantics; it does not expose a cheap live
//! length under concurrent access, so depth is tracked by hand with an
//! `AtomicUsize`, incremented once a send actually lands (never while a
//! producer is parked waiting for room on a full channel) and decremented
//! after recv.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::time::Duration;

use super::reader::QueuedEvent;

pub struct BoundedQueue {
    tx: Sender<QueuedEvent>,
    rx: Receiver<QueuedEvent>,
    depth: Arc<AtomicUsize>,
    capacity: usize,
}

impl BoundedQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            tx,
            rx,
            depth: Arc::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Shared depth counter, handed to the metrics aggregator (C9) so it can
    /// sample queue depth without holding a reference to the queue itself.
    pub fn depth_counter(&self) -> Arc<AtomicUsize> {
        self.depth.clone()
    }

    /// Producer handle. Blocks the calling reader thread when full.
    pub fn producer(&self) -> QueueProducer {
        QueueProducer {
            tx: self.tx.clone(),
            depth: self.depth.clone(),
        }
    }

    /// Consumer handle. `recv_timeout` lets a C6 worker race a deadline
    /// timer against the next event without a second thread.
    pub fn consumer(&self) -> QueueConsumer {
        QueueConsumer {
            rx: self.rx.clone(),
            depth: self.depth.clone(),
        }
    }

    /// Closes the queue for new enqueues by dropping the held sender;
    /// consumers observe EOF once buffered events are drained.
    pub fn close(self) {
        drop(self.tx);
    }
}

#[derive(Clone)]
pub struct QueueProducer {
    tx: Sender<QueuedEvent>,
    depth: Arc<AtomicUsize>,
}

impl QueueProducer {
    /// Blocks the calling thread while the channel is full. The depth
    /// counter is only bumped once the send actually lands, so a producer
    /// parked here waiting for room is never counted as occupying a slot it
    /// doesn't hold.
    pub fn send(&self, event: QueuedEvent) -> Result<(), ()> {
        match self.tx.send(event) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => Err(()),
        }
    }

    #[allow(dead_code)]
    pub fn try_send(&self, event: QueuedEvent) -> Result<(), TrySendError<QueuedEvent>> {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[derive(Clone)]
pub struct QueueConsumer {
    rx: Receiver<QueuedEvent>,
    depth: Arc<AtomicUsize>,
}

pub enum DequeueResult {
    Event(QueuedEvent),
    Timeout,
    Closed,
}

impl QueueConsumer {
    pub fn recv_timeout(&self, timeout: Duration) -> DequeueResult {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                DequeueResult::Event(event)
            }
            Err(RecvTimeoutError::Timeout) => DequeueResult::Timeout,
            Err(RecvTimeoutError::Disconnected) => DequeueResult::Closed,
        }
    }

    /// Drains whatever remains without blocking, used during shutdown.
    pub fn drain(&self) -> Vec<QueuedEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            out.push(event);
        }
        out
    }
}
