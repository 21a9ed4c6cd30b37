//! Persistence interface for decision evidence.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::analytics::{EliminationQuery, TypeQuery};
use crate::error::StoreError;
use crate::model::{
    Candidate, CandidateStatus, Filter, NewFilter, NewRun, NewStep, Run, RunDetail, RunId,
    RunStatus, RunUpdate, Step, StepDetail, StepId, StepUpdate,
};

/// Filters for [`EvidenceStore::list_runs`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunQuery {
    pub pipeline_name: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl RunQuery {
    /// Match every run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only runs of this pipeline.
    pub fn pipeline(mut self, name: impl Into<String>) -> Self {
        self.pipeline_name = Some(name.into());
        self
    }

    /// Only runs in this status.
    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Return at most `limit` runs.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip the first `offset` runs.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Stores runs, steps, candidates and filters, and answers queries over them.
///
/// The store assigns run and step identifiers and start timestamps. Each
/// call is expected to be atomic on its own; the tracer never spans a
/// transaction across calls.
#[async_trait]
pub trait EvidenceStore: Send + Sync {
    /// Record the start of a run in status `running`.
    async fn create_run(&self, run: NewRun) -> Result<Run, StoreError>;

    /// Apply a partial update to a run.
    async fn update_run(&self, id: &RunId, update: RunUpdate) -> Result<Run, StoreError>;

    /// Record the start of a step in status `running`.
    async fn create_step(&self, step: NewStep) -> Result<Step, StoreError>;

    /// Apply a partial update to a step.
    async fn update_step(&self, id: &StepId, update: StepUpdate) -> Result<Step, StoreError>;

    /// Persist captured candidates for a step in one call.
    ///
    /// Every candidate must already carry `step_id` as its owner, and its
    /// key must not repeat within the batch or among the step's stored
    /// candidates. The batch is stored entirely or not at all.
    async fn create_candidates_bulk(
        &self,
        step_id: &StepId,
        candidates: Vec<Candidate>,
    ) -> Result<Vec<Candidate>, StoreError>;

    /// Record that a filter was applied at a step.
    async fn create_filter(&self, step_id: &StepId, filter: NewFilter)
        -> Result<Filter, StoreError>;

    /// Fetch a run with its steps (index order) and their evidence.
    async fn get_run(&self, id: &RunId) -> Result<RunDetail, StoreError>;

    /// List runs, most recent first.
    async fn list_runs(&self, query: RunQuery) -> Result<Vec<Run>, StoreError>;

    /// Fetch a step with its candidates and filters.
    async fn get_step(&self, id: &StepId) -> Result<StepDetail, StoreError>;

    /// List a step's candidates by score descending, unscored last.
    async fn list_candidates(
        &self,
        step_id: &StepId,
        status: Option<CandidateStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Candidate>, StoreError>;

    /// Steps whose elimination ratio is below the query threshold.
    async fn query_high_elimination(
        &self,
        query: &EliminationQuery,
    ) -> Result<Vec<Step>, StoreError>;

    /// Steps with the given type label.
    async fn query_by_type(&self, query: &TypeQuery) -> Result<Vec<Step>, StoreError>;
}

/// Check that every candidate in a bulk insert belongs to `step_id` and
/// that no key repeats within the batch.
pub(crate) fn check_candidate_batch(
    step_id: &StepId,
    candidates: &[Candidate],
) -> Result<(), StoreError> {
    if let Some(stray) = candidates.iter().find(|c| &c.step_id != step_id) {
        return Err(StoreError::InvalidRecord(format!(
            "candidate {} belongs to step {}, not {}",
            stray.id, stray.step_id, step_id
        )));
    }
    let mut seen = HashSet::with_capacity(candidates.len());
    if let Some(repeat) = candidates
        .iter()
        .find(|c| !seen.insert(c.candidate_key.as_str()))
    {
        return Err(duplicate_candidate(step_id, &repeat.candidate_key));
    }
    Ok(())
}

pub(crate) fn duplicate_candidate(step_id: &StepId, key: &str) -> StoreError {
    StoreError::InvalidRecord(format!(
        "candidate key '{key}' is already recorded for step {step_id}"
    ))
}
