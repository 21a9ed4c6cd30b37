//! Evidence records: runs, steps, candidates and filters.
//!
//! These are plain data contracts shared by the [`Tracer`](crate::Tracer),
//! the capture strategy and every [`EvidenceStore`](crate::EvidenceStore)
//! implementation. The only behavior here is validation of the few
//! invariants that hold between fields of a single record.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// Free-form key/value mapping attached to most records.
pub type Metadata = serde_json::Map<String, Value>;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a fresh, globally unique identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

opaque_id!(
    /// Unique identifier for a pipeline run.
    RunId
);
opaque_id!(
    /// Unique identifier for a step within a run.
    StepId
);
opaque_id!(
    /// Unique identifier for a persisted candidate.
    CandidateId
);
opaque_id!(
    /// Unique identifier for a filter application.
    FilterId
);

/// Status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Run is in flight.
    Running,
    /// Run completed successfully.
    Completed,
    /// Run failed.
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Step is open.
    Running,
    /// Step was closed without an error.
    Completed,
    /// Step was closed with an error.
    Failed,
    /// Step was still open when its run ended and was closed on its behalf.
    Abandoned,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Outcome recorded for a single evaluated candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateStatus {
    Accepted,
    Rejected,
    Pending,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Pending => "pending",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }
}

/// Label describing what kind of decision a step makes.
///
/// Step types are deliberately open: any string is a valid label. The
/// associated constants are shared conventions that make steps from
/// unrelated pipelines comparable through [`TypeQuery`](crate::TypeQuery)
/// and [`EliminationQuery`](crate::EliminationQuery).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepType(pub String);

impl StepType {
    pub const FILTERING: &'static str = "filtering";
    pub const RANKING: &'static str = "ranking";
    pub const SEARCH: &'static str = "search";
    pub const SELECTION: &'static str = "selection";
    pub const GENERATION: &'static str = "generation";
    pub const SCORING: &'static str = "scoring";
    pub const RETRIEVAL: &'static str = "retrieval";
    pub const VALIDATION: &'static str = "validation";

    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn filtering() -> Self {
        Self::new(Self::FILTERING)
    }

    pub fn ranking() -> Self {
        Self::new(Self::RANKING)
    }

    pub fn search() -> Self {
        Self::new(Self::SEARCH)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for StepType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl PartialEq<str> for StepType {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for StepType {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// One execution of an instrumented pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub pipeline_name: String,
    pub pipeline_version: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// One decision point inside a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub run_id: RunId,
    pub step_type: StepType,
    pub step_index: u32,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub reasoning: Option<String>,
    pub config: Option<Metadata>,
    pub input_count: Option<u64>,
    pub output_count: Option<u64>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub capture_all_candidates: bool,
}

impl Step {
    /// Fraction of inputs that survived this step, `output / input`.
    ///
    /// Returns `None` unless both counts are recorded and `input > 0`.
    pub fn elimination_ratio(&self) -> Option<f64> {
        match (self.input_count, self.output_count) {
            (Some(input), Some(output)) if input > 0 => Some(output as f64 / input as f64),
            _ => None,
        }
    }
}

/// Evidence that one item was evaluated at one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    pub step_id: StepId,
    /// Caller-supplied key, unique within its step only.
    pub candidate_key: String,
    pub status: CandidateStatus,
    pub score: Option<f64>,
    pub reason: Option<String>,
    pub data: Value,
    #[serde(default)]
    pub metadata: Metadata,
}

/// A named constraint applied at a step and its measured impact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub id: FilterId,
    pub step_id: StepId,
    pub filter_type: String,
    pub config: Metadata,
    pub candidates_affected: u64,
    pub candidates_rejected: u64,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Input/output cardinality of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounts {
    pub input: u64,
    pub output: u64,
}

impl StepCounts {
    /// Validate that a step cannot emit more items than it received.
    pub fn new(input: u64, output: u64) -> Result<Self, StoreError> {
        if output > input {
            return Err(StoreError::InvalidRecord(format!(
                "output count {output} exceeds input count {input}"
            )));
        }
        Ok(Self { input, output })
    }
}

/// Fields supplied when creating a run.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRun {
    pub pipeline_name: String,
    pub pipeline_version: Option<String>,
    pub input: Value,
    pub metadata: Metadata,
}

/// Partial update applied to a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error: Option<String>,
}

/// Fields supplied when creating a step.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStep {
    pub run_id: RunId,
    pub step_type: StepType,
    pub step_index: u32,
    pub input: Option<Value>,
    pub config: Option<Metadata>,
    pub reasoning: Option<String>,
    pub capture_all_candidates: Option<bool>,
    pub metadata: Metadata,
}

/// Partial update applied to a step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepUpdate {
    pub status: Option<StepStatus>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub reasoning: Option<String>,
    pub counts: Option<StepCounts>,
}

/// Fields supplied when recording a filter application.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFilter {
    pub filter_type: String,
    pub config: Metadata,
    pub candidates_affected: u64,
    pub candidates_rejected: u64,
    pub metadata: Metadata,
}

impl NewFilter {
    /// Build a filter record, rejecting more rejections than affected items.
    pub fn new(
        filter_type: impl Into<String>,
        candidates_affected: u64,
        candidates_rejected: u64,
    ) -> Result<Self, StoreError> {
        let filter = Self {
            filter_type: filter_type.into(),
            config: Metadata::new(),
            candidates_affected,
            candidates_rejected,
            metadata: Metadata::new(),
        };
        filter.validate()?;
        Ok(filter)
    }

    pub fn with_config(mut self, config: Metadata) -> Self {
        self.config = config;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Check `candidates_rejected <= candidates_affected`.
    ///
    /// Stores call this again on insert since the fields are public.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.candidates_rejected > self.candidates_affected {
            return Err(StoreError::InvalidRecord(format!(
                "filter '{}' rejected {} candidates but only affected {}",
                self.filter_type, self.candidates_rejected, self.candidates_affected
            )));
        }
        Ok(())
    }
}

impl Run {
    /// Apply `update`, enforcing a single running -> terminal transition.
    ///
    /// A terminal status without an explicit completion time is stamped now.
    pub fn apply(&mut self, update: RunUpdate) -> Result<(), StoreError> {
        if let Some(status) = update.status {
            if self.status.is_terminal() {
                return Err(StoreError::InvalidRecord(format!(
                    "run {} is already {}",
                    self.id,
                    self.status.as_str()
                )));
            }
            if status.is_terminal() {
                self.completed_at = Some(update.completed_at.unwrap_or_else(Utc::now));
            }
            self.status = status;
        }
        if update.output.is_some() {
            self.output = update.output;
        }
        if update.error.is_some() {
            self.error = update.error;
        }
        Ok(())
    }
}

impl Step {
    /// Apply `update`, enforcing a single running -> terminal transition and
    /// the count and duration invariants.
    pub fn apply(&mut self, update: StepUpdate) -> Result<(), StoreError> {
        if let Some(duration) = update.duration_ms {
            if duration < 0 {
                return Err(StoreError::InvalidRecord(format!(
                    "step {} has negative duration {duration}ms",
                    self.id
                )));
            }
        }
        if let Some(counts) = update.counts {
            StepCounts::new(counts.input, counts.output)?;
            self.input_count = Some(counts.input);
            self.output_count = Some(counts.output);
        }
        if let Some(status) = update.status {
            if self.status.is_terminal() {
                return Err(StoreError::InvalidRecord(format!(
                    "step {} is already {}",
                    self.id,
                    self.status.as_str()
                )));
            }
            if status.is_terminal() {
                let completed_at = update.completed_at.unwrap_or_else(Utc::now);
                self.completed_at = Some(completed_at);
                self.duration_ms = Some(
                    update
                        .duration_ms
                        .unwrap_or_else(|| (completed_at - self.started_at).num_milliseconds().max(0)),
                );
            }
            self.status = status;
        }
        if update.output.is_some() {
            self.output = update.output;
        }
        if update.error.is_some() {
            self.error = update.error;
        }
        if update.reasoning.is_some() {
            self.reasoning = update.reasoning;
        }
        Ok(())
    }
}

/// A step together with its persisted evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDetail {
    #[serde(flatten)]
    pub step: Step,
    pub candidates: Vec<Candidate>,
    pub filters: Vec<Filter>,
}

/// A run together with all of its steps, in index order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: Run,
    pub steps: Vec<StepDetail>,
}
