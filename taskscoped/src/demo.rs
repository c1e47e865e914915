//! Deterministic synthetic task-runtime traffic, standing in for a live
//! probe when none is attached. Replaces `cognitod`'s `fake_events.rs`
//! (which faked `NetEvent`/`FileIoEvent`/`SyscallEvent` via `rand`); this
//! generator is seed-free and deterministic so the same run always produces
//! the same stream, which is what lets the integration tests assert exact
//! counts instead of ranges.
//!
//! A `DemoProfile` describes one recognizable workload shape, generalizing
//! `cognitod`'s `DemoProfile` enum (`ForkStorm`, `ShortJobs`, ...) from
//! process trees to task lifecycles: a task is born, transitions through a
//! handful of states, allocates a few objects, and exits. `generator()`
//! cycles through all profiles forever, which is what [`crate::probe`]
//! reaches for when no precompiled probe object is configured.

use std::time::{SystemTime, UNIX_EPOCH};

use taskscope_wire::{Event, Kind, TaskState};

use crate::pipeline::reader::{ReadOutcome, RecordSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoProfile {
    /// A task born, runs briefly, and exits cleanly.
    ShortLived,
    /// A task that fans out several children before exiting.
    ForkStorm,
    /// A task that allocates heavily (dynamic sequences, keyed collections,
    /// heap objects) before exiting.
    AllocatorHeavy,
    /// A task that blocks, gets preempted, then resumes and exits.
    Contended,
}

impl DemoProfile {
    pub const ALL: [DemoProfile; 4] = [
        DemoProfile::ShortLived,
        DemoProfile::ForkStorm,
        DemoProfile::AllocatorHeavy,
        DemoProfile::Contended,
    ];

    /// Builds the fixed sequence of events one task instance of this
    /// profile produces, parented under `parent_task_id` and starting at
    /// `timestamp`. Returns the events and the next free task id.
    fn build(self, task_id: u32, parent_task_id: u32, timestamp: u64) -> (Vec<Event>, u32) {
        let mut events = Vec::new();
        let mut ts = timestamp;
        let mut step = |kind: Kind, attributes: [u64; 5]| {
            events.push(Event {
                timestamp: ts,
                kind: kind as u32,
                probe_duration_ns: 150,
                task_id,
                parent_task_id,
                attributes,
            });
            ts += 1_000;
        };

        step(Kind::NewTask, [parent_task_id as u64, 0, 0, 0, 0]);
        step(
            Kind::TaskStateChange,
            [TaskState::Idle as u64, TaskState::Runnable as u64, 0, 0, 0],
        );
        step(
            Kind::TaskStateChange,
            [TaskState::Runnable as u64, TaskState::Running as u64, 0, 0, 0],
        );

        match self {
            DemoProfile::ShortLived => {}
            DemoProfile::ForkStorm => {
                for child in 0..3 {
                    step(Kind::NewTask, [task_id as u64, child, 0, 0, 0]);
                }
            }
            DemoProfile::AllocatorHeavy => {
                step(Kind::MakeDynamicSequence, [64, 0, 0, 0, 0]);
                step(Kind::MakeKeyedCollection, [16, 0, 0, 0, 0]);
                step(Kind::NewHeapObject, [256, 0, 0, 0, 0]);
            }
            DemoProfile::Contended => {
                step(
                    Kind::TaskStateChange,
                    [TaskState::Running as u64, TaskState::Waiting as u64, 0, 0, 0],
                );
                step(
                    Kind::TaskStateChange,
                    [TaskState::Waiting as u64, TaskState::Preempted as u64, 0, 0, 0],
                );
                step(
                    Kind::TaskStateChange,
                    [TaskState::Preempted as u64, TaskState::Running as u64, 0, 0, 0],
                );
            }
        }

        step(
            Kind::TaskStateChange,
            [TaskState::Running as u64, TaskState::Dead as u64, 0, 0, 0],
        );
        step(Kind::TaskExit, [0, 0, 0, 0, 0]);

        let next_task_id = task_id
            + 1
            + match self {
                DemoProfile::ForkStorm => 3,
                _ => 0,
            };
        (events, next_task_id)
    }
}

/// An endless `RecordSource` that cycles through [`DemoProfile::ALL`],
/// minting a fresh task id for every instance so ids never repeat within a
/// single process lifetime.
pub struct InfiniteDemoSource {
    next_task_id: u32,
    pending: std::collections::VecDeque<Event>,
    timestamp: u64,
    profile_index: usize,
}

impl InfiniteDemoSource {
    pub fn new() -> Self {
        Self {
            next_task_id: 1,
            pending: std::collections::VecDeque::new(),
            timestamp: now_ns(),
            profile_index: 0,
        }
    }

    fn refill(&mut self) {
        let profile = DemoProfile::ALL[self.profile_index % DemoProfile::ALL.len()];
        self.profile_index += 1;
        let (events, next_task_id) = profile.build(self.next_task_id, 0, self.timestamp);
        self.timestamp = events.last().map(|e| e.timestamp + 1_000).unwrap_or(self.timestamp);
        self.next_task_id = next_task_id;
        self.pending.extend(events);
    }
}

impl Default for InfiniteDemoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordSource for InfiniteDemoSource {
    fn read(&mut self) -> ReadOutcome {
        if self.pending.is_empty() {
            self.refill();
        }
        match self.pending.pop_front() {
            Some(event) => ReadOutcome::Record(event.to_le_bytes().to_vec()),
            None => ReadOutcome::Eof,
        }
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Builds a fresh endless demo source, the fallback [`crate::probe::build_sources`]
/// uses when no real probe object is available.
pub fn generator() -> InfiniteDemoSource {
    InfiniteDemoSource::new()
}

/// Builds a finite, fully deterministic batch of events replaying every
/// profile `repetitions` times in order; used by tests and replay scenarios
/// that need an exact, bounded event count.
pub fn scripted_events(repetitions: usize) -> Vec<Event> {
    let mut events = Vec::new();
    let mut next_task_id = 1u32;
    let mut timestamp = 0u64;
    for _ in 0..repetitions {
        for &profile in DemoProfile::ALL.iter() {
            let (mut batch, next) = profile.build(next_task_id, 0, timestamp);
            timestamp = batch.last().map(|e| e.timestamp + 1_000).unwrap_or(timestamp);
            next_task_id = next;
            events.append(&mut batch);
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_events_are_deterministic_across_calls() {
        assert_eq!(scripted_events(3), scripted_events(3));
    }

    #[test]
    fn every_task_opens_with_new_task_and_closes_with_exit() {
        let events = scripted_events(2);
        let mut by_task: std::collections::HashMap<u32, Vec<&Event>> = std::collections::HashMap::new();
        for event in &events {
            by_task.entry(event.task_id).or_default().push(event);
        }
        for (task_id, task_events) in by_task {
            assert_eq!(
                task_events.first().unwrap().kind(),
                Some(Kind::NewTask),
                "task {task_id} did not open with NewTask"
            );
            assert_eq!(
                task_events.last().unwrap().kind(),
                Some(Kind::TaskExit),
                "task {task_id} did not close with TaskExit"
            );
        }
    }

    #[test]
    fn infinite_source_never_reports_eof() {
        let mut source = InfiniteDemoSource::new();
        for _ in 0..10_000 {
            assert!(matches!(source.read(), ReadOutcome::Record(_)));
        }
    }
}
