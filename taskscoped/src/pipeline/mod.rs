//! The hot path (C4 → C5 → C6): plain OS threads over `crossbeam-channel`,
//! no async runtime on this side. See the orchestrator for how this wires
//! into the session store and broadcast hub, which are reached through a
//! `tokio::runtime::Handle::block_on` bridge at the C6 boundary.

pub mod processor;
pub mod queue;
pub mod reader;

pub use queue::BoundedQueue;
pub use reader::{QueuedEvent, ReaderPool, RecordSource};
