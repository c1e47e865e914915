#![cfg_attr(all(feature = "probe", not(feature = "user")), no_std)]

//! Shared wire format between the kernel-side runtime probe and the
//! userspace pipeline.
//!
//! The probe program itself (attaching at runtime entry points, deciding
//! what to sample) lives outside this crate. What lives here is the fixed
//! 64-byte record both sides agree on, and the small set of closed
//! enumerations needed to interpret it.

use bytemuck::{Pod, Zeroable};

#[cfg(test)]
use core::mem::size_of;

/// Event kinds. Values are fixed on the wire; new kinds are appended, never
/// renumbered.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum Kind {
    TaskStateChange = 0,
    MakeDynamicSequence = 1,
    MakeKeyedCollection = 2,
    NewHeapObject = 3,
    NewTask = 4,
    TaskExit = 5,
}

impl Kind {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Kind::TaskStateChange),
            1 => Some(Kind::MakeDynamicSequence),
            2 => Some(Kind::MakeKeyedCollection),
            3 => Some(Kind::NewHeapObject),
            4 => Some(Kind::NewTask),
            5 => Some(Kind::TaskExit),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Kind::TaskStateChange => "task_state_change",
            Kind::MakeDynamicSequence => "make_dynamic_sequence",
            Kind::MakeKeyedCollection => "make_keyed_collection",
            Kind::NewHeapObject => "new_heap_object",
            Kind::NewTask => "new_task",
            Kind::TaskExit => "task_exit",
        }
    }
}

/// Task (goroutine-equivalent) scheduling states. State 6 (`Dead`) is
/// terminal for a task id.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum TaskState {
    Idle = 0,
    Runnable = 1,
    Running = 2,
    Syscall = 3,
    Waiting = 4,
    Moribund = 5,
    Dead = 6,
    Enqueue = 7,
    CopyStack = 8,
    Preempted = 9,
}

impl TaskState {
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(TaskState::Idle),
            1 => Some(TaskState::Runnable),
            2 => Some(TaskState::Running),
            3 => Some(TaskState::Syscall),
            4 => Some(TaskState::Waiting),
            5 => Some(TaskState::Moribund),
            6 => Some(TaskState::Dead),
            7 => Some(TaskState::Enqueue),
            8 => Some(TaskState::CopyStack),
            9 => Some(TaskState::Preempted),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Dead)
    }
}

/// Element kinds carried by `MakeDynamicSequence`/`MakeKeyedCollection`
/// events, mirroring a conventional runtime type taxonomy (0 = invalid,
/// 1..16 primitive, 17..26 composite). Consumers render these textually;
/// the core never branches on a specific value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ElementKind(pub u8);

impl ElementKind {
    const NAMES: [&'static str; 27] = [
        "invalid", "bool", "int", "int8", "int16", "int32", "int64", "uint", "uint8", "uint16",
        "uint32", "uint64", "uintptr", "float32", "float64", "complex64", "complex128", "array",
        "chan", "func", "interface", "map", "ptr", "slice", "string", "struct", "unsafe_pointer",
    ];

    pub fn name(self) -> &'static str {
        Self::NAMES
            .get(self.0 as usize)
            .copied()
            .unwrap_or("unknown")
    }
}

/// Event attributes: five 64-bit slots whose interpretation is determined
/// by `Event::kind`. See each accessor for the slot layout of that kind.
pub type Attributes = [u64; 5];

/// The fixed 64-byte record read from the ringbuffer, little-endian,
/// decoded by fixed offsets. Unused attribute slots are zero.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct Event {
    /// Kernel monotonic nanoseconds at probe fire. Strictly non-decreasing
    /// per-CPU; not globally monotonic.
    pub timestamp: u64,
    /// Raw `Kind` discriminant; use `Event::kind()` to validate.
    pub kind: u32,
    /// Measured inside the kernel probe; upper bound on observed overhead.
    pub probe_duration_ns: u32,
    pub task_id: u32,
    /// 0 if unknown.
    pub parent_task_id: u32,
    pub attributes: Attributes,
}

pub const EVENT_SIZE: usize = 64;

#[cfg(test)]
const _: () = {
    assert!(size_of::<Event>() == EVENT_SIZE);
};

impl Event {
    pub fn kind(&self) -> Option<Kind> {
        Kind::from_u32(self.kind)
    }

    pub fn to_le_bytes(&self) -> [u8; EVENT_SIZE] {
        bytemuck::cast(*self)
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != EVENT_SIZE {
            return None;
        }
        let mut buf = [0u8; EVENT_SIZE];
        buf.copy_from_slice(bytes);
        Some(bytemuck::cast(buf))
    }

    /// `(old_state, new_state, task_id_echo)` for `TaskStateChange` events.
    pub fn task_state_change(&self) -> (u64, u64, u64) {
        (self.attributes[0], self.attributes[1], self.attributes[2])
    }

    /// `(element_size, element_kind, length, capacity)` for
    /// `MakeDynamicSequence` events.
    pub fn dynamic_sequence(&self) -> (u64, ElementKind, u64, u64) {
        (
            self.attributes[0],
            ElementKind(self.attributes[1] as u8),
            self.attributes[2],
            self.attributes[3],
        )
    }

    /// `(key_size, key_kind, value_size, value_kind, size_hint)` for
    /// `MakeKeyedCollection` events.
    pub fn keyed_collection(&self) -> (u64, ElementKind, u64, ElementKind, u64) {
        (
            self.attributes[0],
            ElementKind(self.attributes[1] as u8),
            self.attributes[2],
            ElementKind(self.attributes[3] as u8),
            self.attributes[4],
        )
    }

    /// `(size, kind)` for `NewHeapObject` events.
    pub fn heap_object(&self) -> (u64, ElementKind) {
        (self.attributes[0], ElementKind(self.attributes[1] as u8))
    }

    /// `(parent_task_id, new_task_id)` for `NewTask` events.
    pub fn new_task(&self) -> (u64, u64) {
        (self.attributes[0], self.attributes[1])
    }

    /// `(task_id_echo, exit_timestamp)` for `TaskExit` events.
    pub fn task_exit(&self) -> (u64, u64) {
        (self.attributes[0], self.attributes[1])
    }
}

/// A single (kind, sampling-fraction) pair as configured by the operator and
/// written to the kernel sampling map. Fractions are clamped to `[0, 1]` and
/// rounded to the nearest integer percent before being written; the core
/// does not itself decide sampling, it only relays this configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct SamplingRate {
    pub kind: u32,
    pub percent: u8,
}

impl SamplingRate {
    pub fn from_fraction(kind: Kind, fraction: f64) -> Self {
        let clamped = fraction.clamp(0.0, 1.0);
        let percent = (clamped * 100.0).round() as u8;
        SamplingRate {
            kind: kind as u32,
            percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            timestamp: 100,
            kind: Kind::NewTask as u32,
            probe_duration_ns: 5,
            task_id: 1,
            parent_task_id: 0,
            attributes: [0, 1, 0, 0, 0],
        }
    }

    #[test]
    fn event_is_exactly_64_bytes() {
        assert_eq!(core::mem::size_of::<Event>(), EVENT_SIZE);
    }

    #[test]
    fn round_trip_through_bytes_is_bit_identical() {
        let event = sample_event();
        let bytes = event.to_le_bytes();
        let back = Event::from_le_bytes(&bytes).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn from_le_bytes_rejects_wrong_length() {
        assert!(Event::from_le_bytes(&[0u8; 10]).is_none());
    }

    #[test]
    fn kind_decodes_known_values() {
        let event = sample_event();
        assert_eq!(event.kind(), Some(Kind::NewTask));
    }

    #[test]
    fn kind_rejects_unknown_values() {
        let mut event = sample_event();
        event.kind = 99;
        assert_eq!(event.kind(), None);
    }

    #[test]
    fn element_kind_renders_textually() {
        assert_eq!(ElementKind(0).name(), "invalid");
        assert_eq!(ElementKind(25).name(), "struct");
        assert_eq!(ElementKind(255).name(), "unknown");
    }

    #[test]
    fn sampling_rate_rounds_to_nearest_percent() {
        let rate = SamplingRate::from_fraction(Kind::NewHeapObject, 0.125);
        assert_eq!(rate.percent, 13);
        let clamped = SamplingRate::from_fraction(Kind::NewHeapObject, 1.5);
        assert_eq!(clamped.percent, 100);
    }

    #[test]
    fn serde_round_trip() {
        let event = sample_event();
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }
}
