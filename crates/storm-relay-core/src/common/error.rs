//! Error types for the execution and streaming bridge.
//!
//! This module defines the central `Error` enum, which captures every
//! recoverable and reportable failure of a run: admission, the generation job
//! itself, the per-run artifact store and the progress channels. Each variant
//! maps to a stable [`Error::kind`] string that is used on the wire so clients
//! can branch on it without parsing messages.
//!
//! ## Error Cases
//! - `Validation`: The request was malformed (e.g. empty topic).
//! - `ServerBusy`: Every worker is busy and the admission queue is full.
//! - `Pipeline`: The generation job failed; its description is preserved.
//! - `Timeout`: The run exceeded the configured maximum duration.
//! - `StoreCapacityExceeded`: An artifact tripped the per-artifact size guard.
//! - `NotFound` / `InvalidPath`: Artifact lookups against the virtual store.
//! - `ReservedStage`: A job tried to report a terminal stage itself.
//! - `ChannelError`: Internal communication failure between tasks or workers.
//! - `ServiceShutdown`: A run was requested while the pool is shutting down.
//! - `Cancelled`: A queued run was cancelled before a worker picked it up.
//! - `Internal`: Anything unanticipated.

use crate::types::Stage;
use core::time::Duration;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the relay.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The client request was invalid.
    #[error("Invalid request: {reason}")]
    Validation { reason: String },

    /// The worker pool and its queue are saturated.
    #[error("Server busy: all {capacity} run slots are taken")]
    ServerBusy { capacity: usize },

    /// The generation job failed. The description is kept verbatim.
    #[error("Pipeline execution failed: {0}")]
    Pipeline(String),

    /// The run exceeded its maximum duration.
    #[error("Run exceeded the maximum duration of {limit:?}")]
    Timeout { limit: Duration },

    /// An artifact exceeded the per-artifact byte ceiling.
    #[error("Artifact '{path}' is {size} bytes, exceeding the {limit} byte limit")]
    StoreCapacityExceeded {
        path: String,
        size: usize,
        limit: usize,
    },

    /// No artifact exists at the given path.
    #[error("Artifact not found: {path}")]
    NotFound { path: String },

    /// The path is empty after normalization.
    #[error("Invalid artifact path: '{path}'")]
    InvalidPath { path: String },

    /// Terminal stages are emitted by the runner only.
    #[error("Stage '{stage}' is reserved for the task runner")]
    ReservedStage { stage: Stage },

    /// Internal channel send/receive failure (e.g., closed or full channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The runner is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// The run was cancelled while still waiting for a worker.
    #[error("Run was cancelled before it started")]
    Cancelled,

    /// Anything unanticipated.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable, machine-readable name of the error class.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::ServerBusy { .. } => "server_busy",
            Self::Pipeline(_) => "pipeline_error",
            Self::Timeout { .. } => "timeout",
            Self::StoreCapacityExceeded { .. } => "store_capacity_exceeded",
            Self::NotFound { .. } => "not_found",
            Self::InvalidPath { .. } => "invalid_path",
            Self::ReservedStage { .. } => "reserved_stage",
            Self::ChannelError { .. } => "channel_error",
            Self::ServiceShutdown => "service_shutdown",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Human-readable description carried by terminal `error` events.
    ///
    /// Pipeline failures surface the job's own description unchanged; every
    /// other variant uses its display form.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::Pipeline(description) => description.clone(),
            other => other.to_string(),
        }
    }
}
