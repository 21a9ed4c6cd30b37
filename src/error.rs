//! Error types for tracing and persistence.

use thiserror::Error;

use crate::model::{RunId, StepId};

/// Error returned by an [`EvidenceStore`](crate::EvidenceStore).
#[derive(Error, Debug)]
pub enum StoreError {
    /// No record of the given kind has this identifier.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A record violates one of its field invariants.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// The backing service or database failed.
    #[error("backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

impl StoreError {
    /// Wrap a backend failure.
    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        Self::Backend(err.into())
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Error returned by the [`Tracer`](crate::Tracer) and capture strategy.
#[derive(Error, Debug)]
pub enum TraceError {
    /// A lifecycle call needs an open run and none is open.
    #[error("no active run")]
    NoActiveRun,

    /// `begin` was called while another run is still open.
    #[error("run {run_id} is still active")]
    RunAlreadyActive { run_id: RunId },

    /// The step is not open on this tracer (never opened, or already closed).
    #[error("unknown step: {0}")]
    UnknownStep(StepId),

    /// Candidates were already recorded for this step.
    #[error("candidates already recorded for step {0}")]
    CandidatesAlreadyRecorded(StepId),

    /// Caller-supplied data was rejected before reaching the store.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The persistence call failed.
    #[error("transport error: {0}")]
    Transport(#[from] StoreError),

    /// Capture thresholds are invalid.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl TraceError {
    /// Returns true if the error came from the persistence layer.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Local validation failure, reported as [`TraceError::InvalidInput`].
    pub(crate) fn invalid(err: StoreError) -> Self {
        match err {
            StoreError::InvalidRecord(msg) => Self::InvalidInput(msg),
            other => Self::InvalidInput(other.to_string()),
        }
    }
}
