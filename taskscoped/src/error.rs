//! The error taxonomy from the core's design: six kinds, each with its own
//! propagation rule. `CoreError` crosses every module boundary inside the
//! pipeline, including the orchestrator's own `FatalInit` path, so `main`
//! converts it straight into a process exit code without an intermediate
//! `anyhow::Error` layer.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Ringbuffer open, probe attach, directory create, port bind. The
    /// orchestrator converts this into a nonzero process exit; no partial
    /// state is left beyond a session directory, which may be reopened.
    #[error("fatal init failure: {0}")]
    FatalInit(String),

    /// A write failed mid-batch. Logged and surfaced to the caller; the
    /// worker continues on the next batch and the failed batch is counted
    /// as lost in metrics.
    #[error("transient I/O failure: {0}")]
    TransientIo(#[from] io::Error),

    /// A truncated final record or malformed textual line on scan. Events
    /// up to the error are still returned to the caller.
    #[error("parse error at byte offset {offset}: {message}")]
    Parse { offset: u64, message: String },

    /// A broadcast subscriber exceeded its buffer capacity. Dropped
    /// silently by policy; this variant exists so callers can still log it
    /// once without affecting pipeline flow.
    #[error("subscriber backpressure, frame dropped")]
    BackpressureDrop,

    /// An HTTP request could not be served as asked (unknown query value,
    /// unknown format name). The handler responds 400 without mutating
    /// server state.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A configuration value failed validation at startup (e.g.
    /// `read_workers <= 0`). The process aborts before doing any work.
    #[error("invalid input: {0}")]
    InputValidation(String),
}

impl CoreError {
    pub fn fatal_init(message: impl Into<String>) -> Self {
        CoreError::FatalInit(message.into())
    }

    pub fn parse(offset: u64, message: impl Into<String>) -> Self {
        CoreError::Parse {
            offset,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        CoreError::Protocol(message.into())
    }

    pub fn input_validation(message: impl Into<String>) -> Self {
        CoreError::InputValidation(message.into())
    }
}

/// Errors raised by the session manager (C3), distinguished by kind because
/// callers branch on them (e.g. HTTP 404 vs 409).
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("session already exists")]
    AlreadyExists,
    #[error("unrecognized storage format: {0}")]
    InvalidFormat(String),
    #[error("session not found")]
    NotFound,
    #[error("session is in use by a live writer")]
    InUse,
    #[error(transparent)]
    Io(#[from] io::Error),
}
