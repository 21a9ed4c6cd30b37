//! # Whytrace
//!
//! Decision tracing for multi-step, non-deterministic pipelines.
//!
//! Ordinary tracing tells you what ran. Whytrace records why a pipeline
//! produced its output: which candidates each step evaluated, which it kept,
//! which filters removed the rest, and with what reasoning.
//!
//! ## Why Whytrace?
//!
//! - **Decision evidence** - Candidates, scores and filters are stored per step
//! - **Bounded capture** - Large candidate sets are reduced to top accepted plus a rejected sample
//! - **Cross-pipeline queries** - Find aggressive filtering steps regardless of pipeline
//! - **Pluggable storage** - In-memory store built in, SQLite behind a feature flag
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use whytrace::{MemoryStore, RawCandidate, RunEnd, RunStart, StepClose, StepStart, Tracer};
//!
//! let mut tracer = Tracer::new(MemoryStore::new());
//! tracer.begin(RunStart::new("competitor_selection", json!({"asin": "B0X"}))).await?;
//!
//! let step = tracer.open_step(StepStart::new("filtering")).await?;
//! tracer.record_candidates(&step.id, candidates, &accepted_keys).await?;
//! tracer.close_step(&step.id, StepClose::completed(json!({"kept": 3}))).await?;
//!
//! tracer.end(RunEnd::completed(json!({"winner": "B0Y"}))).await?;
//! ```
//!
//! ## Querying
//!
//! ```rust,ignore
//! use whytrace::{EliminationQuery, EvidenceStore};
//!
//! // Filtering steps that kept fewer than half of their inputs.
//! let steps = store.query_high_elimination(&EliminationQuery::new(0.5)?).await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` - Enable the SQLite-backed evidence store

pub mod analytics;
pub mod capture;
pub mod error;
pub mod memory;
pub mod model;
pub mod store;
pub mod tracer;

pub use analytics::{EliminationQuery, TypeQuery, DEFAULT_ELIMINATION_THRESHOLD};
pub use capture::{
    CaptureConfig, CaptureMode, CaptureOutcome, CaptureStrategy, RawCandidate, REJECTION_REASON,
};
pub use error::{StoreError, TraceError};
pub use memory::MemoryStore;
pub use model::{
    Candidate, CandidateId, CandidateStatus, Filter, FilterId, Metadata, NewFilter, NewRun,
    NewStep, Run, RunDetail, RunId, RunStatus, RunUpdate, Step, StepCounts, StepDetail, StepId,
    StepStatus, StepType, StepUpdate,
};
pub use store::{EvidenceStore, RunQuery};
pub use tracer::{
    RunEnd, RunStart, StepClose, StepStart, Tracer, TracerBuilder, ABANDONED_REASONING,
};

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
