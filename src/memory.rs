//! In-process evidence store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::analytics::{self, EliminationQuery, TypeQuery};
use crate::capture::by_score_desc;
use crate::error::StoreError;
use crate::model::{
    Candidate, CandidateStatus, Filter, FilterId, NewFilter, NewRun, NewStep, Run, RunDetail,
    RunId, RunStatus, RunUpdate, Step, StepDetail, StepId, StepStatus, StepUpdate,
};
use crate::store::{check_candidate_batch, duplicate_candidate, EvidenceStore, RunQuery};

#[derive(Default)]
struct Tables {
    runs: HashMap<RunId, Run>,
    steps: HashMap<StepId, Step>,
    candidates: Vec<Candidate>,
    filters: Vec<Filter>,
}

impl Tables {
    fn step_detail(&self, step: &Step) -> StepDetail {
        StepDetail {
            step: step.clone(),
            candidates: self
                .candidates
                .iter()
                .filter(|c| c.step_id == step.id)
                .cloned()
                .collect(),
            filters: self
                .filters
                .iter()
                .filter(|f| f.step_id == step.id)
                .cloned()
                .collect(),
        }
    }
}

/// Evidence store that keeps everything in memory.
///
/// Clones share the same tables, so a test can hand one clone to a
/// [`Tracer`](crate::Tracer) and inspect the evidence through another.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::backend(anyhow::anyhow!("memory store lock poisoned")))
    }
}

#[async_trait]
impl EvidenceStore for MemoryStore {
    async fn create_run(&self, run: NewRun) -> Result<Run, StoreError> {
        let record = Run {
            id: RunId::generate(),
            pipeline_name: run.pipeline_name,
            pipeline_version: run.pipeline_version,
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            input: run.input,
            output: None,
            error: None,
            metadata: run.metadata,
        };
        self.tables()?
            .runs
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn update_run(&self, id: &RunId, update: RunUpdate) -> Result<Run, StoreError> {
        let mut tables = self.tables()?;
        let run = tables
            .runs
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("run", id))?;
        let mut updated = run.clone();
        updated.apply(update)?;
        *run = updated.clone();
        Ok(updated)
    }

    async fn create_step(&self, step: NewStep) -> Result<Step, StoreError> {
        let mut tables = self.tables()?;
        if !tables.runs.contains_key(&step.run_id) {
            return Err(StoreError::not_found("run", &step.run_id));
        }
        if tables
            .steps
            .values()
            .any(|s| s.run_id == step.run_id && s.step_index == step.step_index)
        {
            return Err(StoreError::InvalidRecord(format!(
                "run {} already has a step at index {}",
                step.run_id, step.step_index
            )));
        }

        let record = Step {
            id: StepId::generate(),
            run_id: step.run_id,
            step_type: step.step_type,
            step_index: step.step_index,
            status: StepStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            input: step.input,
            output: None,
            reasoning: step.reasoning,
            config: step.config,
            input_count: None,
            output_count: None,
            duration_ms: None,
            error: None,
            metadata: step.metadata,
            capture_all_candidates: step.capture_all_candidates.unwrap_or(false),
        };
        tables.steps.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn update_step(&self, id: &StepId, update: StepUpdate) -> Result<Step, StoreError> {
        let mut tables = self.tables()?;
        let step = tables
            .steps
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("step", id))?;
        let mut updated = step.clone();
        updated.apply(update)?;
        *step = updated.clone();
        Ok(updated)
    }

    async fn create_candidates_bulk(
        &self,
        step_id: &StepId,
        candidates: Vec<Candidate>,
    ) -> Result<Vec<Candidate>, StoreError> {
        check_candidate_batch(step_id, &candidates)?;
        let mut tables = self.tables()?;
        if !tables.steps.contains_key(step_id) {
            return Err(StoreError::not_found("step", step_id));
        }
        if let Some(taken) = candidates.iter().find(|c| {
            tables
                .candidates
                .iter()
                .any(|stored| &stored.step_id == step_id && stored.candidate_key == c.candidate_key)
        }) {
            return Err(duplicate_candidate(step_id, &taken.candidate_key));
        }
        tables.candidates.extend(candidates.iter().cloned());
        Ok(candidates)
    }

    async fn create_filter(
        &self,
        step_id: &StepId,
        filter: NewFilter,
    ) -> Result<Filter, StoreError> {
        filter.validate()?;
        let mut tables = self.tables()?;
        if !tables.steps.contains_key(step_id) {
            return Err(StoreError::not_found("step", step_id));
        }
        let record = Filter {
            id: FilterId::generate(),
            step_id: step_id.clone(),
            filter_type: filter.filter_type,
            config: filter.config,
            candidates_affected: filter.candidates_affected,
            candidates_rejected: filter.candidates_rejected,
            metadata: filter.metadata,
        };
        tables.filters.push(record.clone());
        Ok(record)
    }

    async fn get_run(&self, id: &RunId) -> Result<RunDetail, StoreError> {
        let tables = self.tables()?;
        let run = tables
            .runs
            .get(id)
            .ok_or_else(|| StoreError::not_found("run", id))?;
        let mut steps: Vec<&Step> = tables.steps.values().filter(|s| &s.run_id == id).collect();
        steps.sort_by_key(|s| s.step_index);
        Ok(RunDetail {
            run: run.clone(),
            steps: steps.into_iter().map(|s| tables.step_detail(s)).collect(),
        })
    }

    async fn list_runs(&self, query: RunQuery) -> Result<Vec<Run>, StoreError> {
        let tables = self.tables()?;
        let mut runs: Vec<Run> = tables
            .runs
            .values()
            .filter(|r| {
                query
                    .pipeline_name
                    .as_ref()
                    .map_or(true, |name| &r.pipeline_name == name)
            })
            .filter(|r| query.status.map_or(true, |status| r.status == status))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(runs
            .into_iter()
            .skip(query.offset.unwrap_or(0))
            .take(query.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn get_step(&self, id: &StepId) -> Result<StepDetail, StoreError> {
        let tables = self.tables()?;
        let step = tables
            .steps
            .get(id)
            .ok_or_else(|| StoreError::not_found("step", id))?;
        Ok(tables.step_detail(step))
    }

    async fn list_candidates(
        &self,
        step_id: &StepId,
        status: Option<CandidateStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Candidate>, StoreError> {
        let tables = self.tables()?;
        let mut candidates: Vec<Candidate> = tables
            .candidates
            .iter()
            .filter(|c| &c.step_id == step_id)
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| by_score_desc(a.score, b.score));
        candidates.truncate(limit.unwrap_or(usize::MAX));
        Ok(candidates)
    }

    async fn query_high_elimination(
        &self,
        query: &EliminationQuery,
    ) -> Result<Vec<Step>, StoreError> {
        query.validate()?;
        let tables = self.tables()?;
        Ok(analytics::high_elimination(tables.steps.values(), query))
    }

    async fn query_by_type(&self, query: &TypeQuery) -> Result<Vec<Step>, StoreError> {
        let tables = self.tables()?;
        Ok(analytics::by_type(tables.steps.values(), query))
    }
}
