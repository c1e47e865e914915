//! Durable session storage (C2): a trait two on-disk encoders share, plus
//! the filter/metadata types the manager and HTTP surface build on.

pub mod framed;
pub mod manager;
pub mod textual;

use crate::error::CoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use taskscope_wire::{Event, Kind};

/// Logical AND of every set field. `offset`/`limit` apply to the filtered
/// sequence, not the raw stream.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub task_id: Option<u32>,
    pub kind: Option<Kind>,
    pub ts_lower: Option<u64>,
    pub ts_upper: Option<u64>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl ScanFilter {
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(task_id) = self.task_id {
            if event.task_id != task_id {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if event.kind() != Some(kind) {
                return false;
            }
        }
        if let Some(lower) = self.ts_lower {
            if event.timestamp < lower {
                return false;
            }
        }
        if let Some(upper) = self.ts_upper {
            if event.timestamp > upper {
                return false;
            }
        }
        true
    }

    /// Apply offset/limit to an already-filtered sequence.
    pub fn paginate(&self, events: Vec<Event>) -> Vec<Event> {
        let skipped = events.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => skipped.take(limit).collect(),
            None => skipped.collect(),
        }
    }
}

/// Result of a scan: events decoded up to the point of any truncation, plus
/// an optional diagnostic describing that truncation. A non-`None`
/// `truncation` does not mean the scan failed; `events` is still usable.
#[derive(Debug)]
pub struct ScanOutcome {
    pub events: Vec<Event>,
    pub truncation: Option<CoreError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: String,
    pub start_time: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub end_time: Option<u64>,
    pub origin: String,
    pub event_count: u64,
}

/// Contract shared by the framed and textual encoders. Object-safe so the
/// manager can hand out `Box<dyn SessionStore>` without committing callers
/// to a concrete encoder.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn append_one(&self, event: &Event) -> Result<(), CoreError>;

    /// All-or-nothing: either every record lands and is counted, or none
    /// does. Must flush before returning success.
    async fn append_batch(&self, events: &[Event]) -> Result<(), CoreError>;

    async fn scan(&self, filter: &ScanFilter) -> Result<ScanOutcome, CoreError>;

    async fn unique_task_ids(&self) -> Result<HashSet<u32>, CoreError>;

    /// Monotone since open; updated synchronously with each successful
    /// append.
    fn event_count(&self) -> u64;

    async fn close(&self) -> Result<(), CoreError>;
}
