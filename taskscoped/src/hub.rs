//! Live broadcast hub (C7). Grounded on `ferrex-server`'s
//! `handlers/handle_websocket.rs` connection-registry pattern (per-connection
//! channel, a manager holding connections, a writer task draining the channel
//! into the socket), generalized from a single room-broadcast to a
//! drop-on-slow / evict-after-threshold policy.
//!
//! The hub dispatcher itself runs on its own thread in the orchestrator;
//! `broadcast_one`/`broadcast_batch` are cheap, non-blocking calls a C6
//! worker makes directly. Each subscriber owns a small bounded ring buffer
//! guarded by a `Mutex`/`Condvar` rather than a channel, because eviction
//! requires dropping the *oldest* buffered frame on overflow, which a plain
//! MPSC channel cannot do from the sending side.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::warn;
use serde::Serialize;
use taskscope_wire::Event;

/// Buffered-message cap per subscriber before the drop-oldest policy kicks
/// in.
pub const SUBSCRIBER_BUFFER: usize = 256;
/// Consecutive full-buffer publishes before a subscriber is evicted.
const SLOW_THRESHOLD: u32 = 2;

/// Wire shape for a single broadcast message: either one event or a
/// discriminated batch.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Frame {
    Single(Event),
    Batch { r#type: &'static str, events: Vec<Event> },
}

impl Frame {
    pub fn batch(events: Vec<Event>) -> Self {
        Frame::Batch {
            r#type: "batch",
            events,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Frame always serializes")
    }
}

struct Mailbox {
    queue: Mutex<VecDeque<Frame>>,
    cvar: Condvar,
    closed: std::sync::atomic::AtomicBool,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(SUBSCRIBER_BUFFER)),
            cvar: Condvar::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Pushes a frame, dropping the oldest if the buffer is already full.
    /// Returns `true` if this push found the buffer already full (i.e. a
    /// frame had to be dropped).
    fn push(&self, frame: Frame) -> bool {
        let mut queue = self.queue.lock().expect("mailbox lock poisoned");
        let was_full = queue.len() >= SUBSCRIBER_BUFFER;
        if was_full {
            queue.pop_front();
        }
        queue.push_back(frame);
        self.cvar.notify_one();
        was_full
    }

    fn recv_timeout(&self, timeout: Duration) -> Option<Frame> {
        let mut queue = self.queue.lock().expect("mailbox lock poisoned");
        loop {
            if let Some(frame) = queue.pop_front() {
                return Some(frame);
            }
            if self.closed.load(Ordering::Relaxed) {
                return None;
            }
            let (guard, result) = self
                .cvar
                .wait_timeout(queue, timeout)
                .expect("mailbox lock poisoned");
            queue = guard;
            if result.timed_out() {
                return None;
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.cvar.notify_all();
    }
}

struct SubscriberEntry {
    mailbox: Arc<Mailbox>,
    slow_streak: AtomicU64,
}

/// Handle a caller uses to drain frames for one live viewer, and to
/// unsubscribe on disconnect (dropping it also unregisters it implicitly
/// via `BroadcastHub::unsubscribe`, called by the owning connection task).
pub struct Subscription {
    pub id: u64,
    mailbox: Arc<Mailbox>,
}

impl Subscription {
    /// Blocks the calling thread (the bridging thread between the hub and
    /// the subscriber's async websocket task) until a frame is available,
    /// the subscriber is evicted, or `timeout` elapses.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Frame> {
        self.mailbox.recv_timeout(timeout)
    }
}

pub struct BroadcastHub {
    subscribers: Mutex<HashMap<u64, SubscriberEntry>>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mailbox = Arc::new(Mailbox::new());
        self.subscribers.lock().expect("hub lock poisoned").insert(
            id,
            SubscriberEntry {
                mailbox: mailbox.clone(),
                slow_streak: AtomicU64::new(0),
            },
        );
        Subscription { id, mailbox }
    }

    pub fn unsubscribe(&self, id: u64) {
        if let Some(entry) = self
            .subscribers
            .lock()
            .expect("hub lock poisoned")
            .remove(&id)
        {
            entry.mailbox.close();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("hub lock poisoned").len()
    }

    pub fn broadcast_one(&self, event: Event) {
        self.dispatch(Frame::Single(event));
    }

    pub fn broadcast_batch(&self, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        self.dispatch(Frame::batch(events.to_vec()));
    }

    /// Tries a non-blocking push onto every subscriber's mailbox. A
    /// subscriber whose buffer was already full on two consecutive
    /// dispatches is evicted and its sink closed; the frame is dropped for
    /// it silently either way, matching the backpressure policy.
    fn dispatch(&self, frame: Frame) {
        let mut evicted = Vec::new();
        {
            let subscribers = self.subscribers.lock().expect("hub lock poisoned");
            for (&id, entry) in subscribers.iter() {
                let was_full = entry.mailbox.push(frame.clone());
                if was_full {
                    let streak = entry.slow_streak.fetch_add(1, Ordering::Relaxed) + 1;
                    if streak >= SLOW_THRESHOLD as u64 {
                        evicted.push(id);
                    }
                } else {
                    entry.slow_streak.store(0, Ordering::Relaxed);
                }
            }
        }
        for id in evicted {
            warn!("subscriber {id} evicted after sustained backpressure");
            self.unsubscribe(id);
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}
