//! Error types for the plan engine
//!
//! One enum per concern:
//! - Plan construction (`PlanError`)
//! - Status transitions (`StatusError`)
//! - Wire encoding (`CodecError`)
//! - Durable storage (`StorageError`)
//! - Executor admission (`ExecutorError`)
//! - Configuration (`ConfigError`)
//!
//! `StepFailure` describes why a plan entered rollback. It is reported through
//! logging and `plan_ended(false)`, never returned to the submitter.

use crate::ids::{PlanId, StepId};

/// Crate-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Plan construction failed
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    /// Illegal status transition
    #[error("status error: {0}")]
    Status(#[from] StatusError),

    /// Encoding or decoding failed
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Storage backend failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Executor rejected a request
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Crate-level result alias
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Plan builder errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// Step does not belong to this plan
    #[error("step {0} is not part of this plan")]
    UnknownStep(StepId),

    /// A step cannot depend on itself
    #[error("step {0} cannot require itself")]
    SelfDependency(StepId),

    /// Dependency edges contain a cycle
    #[error("dependency cycle through step {0}")]
    CycleDetected(StepId),
}

/// Illegal status transitions
///
/// These are programmer errors: the tracker only requests transitions that
/// are legal for a well-formed plan.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatusError {
    /// `start_step` on a step that is not pending
    #[error("cannot start step {0}: not pending")]
    NotPending(StepId),

    /// `finish_step` on a step that is not running
    #[error("cannot finish step {0}: not running")]
    NotRunning(StepId),

    /// `rolled_back_step` on a step that is neither running nor completed
    #[error("cannot roll back step {0}: neither running nor completed")]
    NotUndoable(StepId),

    /// Restored status belongs to another plan
    #[error("status for plan {found} cannot track plan {expected}")]
    PlanMismatch {
        /// Plan being tracked
        expected: PlanId,
        /// Plan named by the status
        found: PlanId,
    },
}

/// Wire encoding errors
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Malformed JSON or payload shape
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Blob carries a different entity tag
    #[error("expected {expected} entity, found {found}")]
    WrongEntity {
        /// Entity the caller asked for
        expected: &'static str,
        /// Entity recorded in the envelope
        found: String,
    },

    /// Blob was written by a newer schema
    #[error("unsupported schema version {found} (current {current})")]
    UnsupportedSchema {
        /// Version recorded in the envelope
        found: u32,
        /// Newest version this build understands
        current: u32,
    },

    /// No decoder registered for an operation kind
    #[error("no decoder registered for operation kind {0:?}")]
    UnknownOperation(String),

    /// Decoded plan is structurally invalid
    #[error("invalid plan record: {0}")]
    InvalidPlan(#[from] PlanError),

    /// Embedded message was not valid base64
    #[error("invalid embedded message: {0}")]
    Embedded(#[from] base64::DecodeError),
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Stored blob could not be (de)serialized
    #[error("codec failure: {0}")]
    Codec(#[from] CodecError),

    /// Filesystem failure
    #[error("I/O failure at {path}: {source}")]
    Io {
        /// Store path being accessed
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Store path is not well formed
    #[error("invalid store path {0:?}")]
    InvalidPath(String),

    /// Backend-specific failure
    #[error("backend failure: {0}")]
    Backend(String),
}

impl StorageError {
    /// Wrap an I/O error with the store path it concerns
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Executor errors
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// `reload_from_storage` after a submission or a previous reload
    #[error("executor already initialized; reload must happen once, before any submission")]
    AlreadyInitialized,

    /// A plan with this ID is already live
    #[error("plan {0} is already submitted")]
    DuplicatePlan(PlanId),

    /// Storage failed while admitting or reloading
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    /// Stored status does not fit its plan
    #[error("invalid stored status: {0}")]
    InvalidStatus(#[from] StatusError),

    /// Configuration rejected at construction
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Worker pool needs at least one permit
    #[error("max_concurrent_steps must be at least 1 (got {0})")]
    InvalidConcurrency(usize),
}

/// Why a plan entered rollback
#[derive(Debug, thiserror::Error)]
pub enum StepFailure {
    /// `do_action` returned an error
    #[error("step {step} failed: {source:#}")]
    Operation {
        /// Failing step
        step: StepId,
        /// Error returned by the operation
        #[source]
        source: anyhow::Error,
    },

    /// `do_action` panicked
    #[error("step {step} panicked: {message}")]
    Panicked {
        /// Failing step
        step: StepId,
        /// Panic payload, when it was a string
        message: String,
    },

    /// Tracker requested an illegal transition
    #[error("status transition rejected: {0}")]
    Status(#[from] StatusError),

    /// Status could not be persisted
    #[error("status could not be persisted: {0}")]
    Storage(#[from] StorageError),

    /// Caller aborted the plan
    #[error("plan aborted")]
    Aborted,
}

impl StepFailure {
    /// Check if this failure is an interruption rather than a real error
    #[inline]
    #[must_use]
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}
