//! Run and step lifecycle.
//!
//! A [`Tracer`] tracks at most one open run and the steps opened under it.
//! It assigns step indices, hands candidate sets to the capture strategy,
//! and makes sure no step is left `running` once its run ends. Every
//! persistence failure is returned to the caller unchanged; the tracer
//! keeps no local buffer and never retries.
//!
//! A tracer is owned by one logical caller. Concurrent pipeline executions
//! use one tracer each, sharing a store if they like.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::capture::{
    duplicate_key, CaptureConfig, CaptureMode, CaptureOutcome, CaptureStrategy, RawCandidate,
};
use crate::error::TraceError;
use crate::model::{
    Filter, Metadata, NewFilter, NewRun, NewStep, Run, RunStatus, RunUpdate, Step, StepCounts,
    StepId, StepStatus, StepType, StepUpdate,
};
use crate::store::EvidenceStore;

/// Reasoning recorded on steps closed by [`Tracer::end`].
pub const ABANDONED_REASONING: &str = "run ended while step was open";

/// Parameters for [`Tracer::begin`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunStart {
    pub pipeline_name: String,
    pub pipeline_version: Option<String>,
    pub input: Value,
    pub metadata: Metadata,
}

impl RunStart {
    /// Start a run of `pipeline_name` with the given input payload.
    pub fn new(pipeline_name: impl Into<String>, input: Value) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            pipeline_version: None,
            input,
            metadata: Metadata::new(),
        }
    }

    /// Set the pipeline version.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.pipeline_version = Some(version.into());
        self
    }

    /// Attach free-form metadata to the run.
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Parameters for [`Tracer::open_step`].
#[derive(Debug, Clone, PartialEq)]
pub struct StepStart {
    pub step_type: StepType,
    pub input: Option<Value>,
    pub config: Option<Metadata>,
    pub reasoning: Option<String>,
    /// Forces full or hybrid capture for this step's candidates.
    pub capture_all: Option<bool>,
    pub metadata: Metadata,
}

impl StepStart {
    /// Open a step with the given type label.
    pub fn new(step_type: impl Into<StepType>) -> Self {
        Self {
            step_type: step_type.into(),
            input: None,
            config: None,
            reasoning: None,
            capture_all: None,
            metadata: Metadata::new(),
        }
    }

    /// Set the step's input payload.
    pub fn input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    /// Record the configuration the step ran with.
    pub fn config(mut self, config: Metadata) -> Self {
        self.config = Some(config);
        self
    }

    /// Explain what the step is about to decide.
    pub fn reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    /// Force full (`true`) or hybrid (`false`) capture for this step.
    pub fn capture_all(mut self, capture_all: bool) -> Self {
        self.capture_all = Some(capture_all);
        self
    }

    /// Attach free-form metadata to the step.
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Parameters for [`Tracer::close_step`].
///
/// A non-empty `error` marks the step failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepClose {
    pub output: Option<Value>,
    pub error: Option<String>,
    pub reasoning: Option<String>,
    pub counts: Option<StepCounts>,
}

impl StepClose {
    /// Close successfully with no output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Close successfully with an output payload.
    pub fn completed(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Self::default()
        }
    }

    /// Close as failed with an error message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Explain the decision the step made.
    pub fn reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    /// Record explicit input/output counts for steps without a candidate set.
    pub fn counts(mut self, counts: StepCounts) -> Self {
        self.counts = Some(counts);
        self
    }
}

/// Parameters for [`Tracer::end`].
///
/// A non-empty `error` marks the run failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunEnd {
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl RunEnd {
    /// End successfully with no output.
    pub fn new() -> Self {
        Self::default()
    }

    /// End successfully with an output payload.
    pub fn completed(output: Value) -> Self {
        Self {
            output: Some(output),
            error: None,
        }
    }

    /// End as failed with an error message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            output: None,
            error: Some(error.into()),
        }
    }
}

struct OpenStep {
    step: Step,
    capture_all: Option<bool>,
    candidates_recorded: bool,
}

struct ActiveRun {
    run: Run,
    next_index: u32,
    open_steps: HashMap<StepId, OpenStep>,
}

/// Builder for a [`Tracer`].
pub struct TracerBuilder {
    store: Arc<dyn EvidenceStore>,
    capture: CaptureConfig,
    seed: Option<u64>,
}

impl TracerBuilder {
    /// Set capture thresholds. Validated by [`TracerBuilder::build`].
    pub fn capture(mut self, config: CaptureConfig) -> Self {
        self.capture = config;
        self
    }

    /// Seed the rejected-candidate sampler.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Build the tracer, failing on negative capture thresholds.
    pub fn build(self) -> Result<Tracer, TraceError> {
        let mut capture = CaptureStrategy::new(self.capture)?;
        if let Some(seed) = self.seed {
            capture = capture.with_seed(seed);
        }
        Ok(Tracer::from_parts(self.store, capture))
    }
}

/// Tracks one pipeline run at a time and records its steps.
pub struct Tracer {
    store: Arc<dyn EvidenceStore>,
    capture: CaptureStrategy,
    active: Option<ActiveRun>,
}

impl Tracer {
    /// Create a tracer with default capture thresholds.
    pub fn new<S: EvidenceStore + 'static>(store: S) -> Self {
        Self::with_store(Arc::new(store))
    }

    /// Create a tracer over a shared store with default capture thresholds.
    pub fn with_store(store: Arc<dyn EvidenceStore>) -> Self {
        Self::from_parts(store, CaptureStrategy::default())
    }

    fn from_parts(store: Arc<dyn EvidenceStore>, capture: CaptureStrategy) -> Self {
        Self {
            store,
            capture,
            active: None,
        }
    }

    /// Configure capture thresholds or a sampling seed before building.
    pub fn builder(store: Arc<dyn EvidenceStore>) -> TracerBuilder {
        TracerBuilder {
            store,
            capture: CaptureConfig::default(),
            seed: None,
        }
    }

    /// The store evidence is written to.
    pub fn store(&self) -> &Arc<dyn EvidenceStore> {
        &self.store
    }

    /// The open run, if any.
    pub fn active_run(&self) -> Option<&Run> {
        self.active.as_ref().map(|a| &a.run)
    }

    /// Steps opened under the active run and not yet closed.
    pub fn open_steps(&self) -> Vec<&Step> {
        let mut steps: Vec<&Step> = self
            .active
            .iter()
            .flat_map(|a| a.open_steps.values().map(|o| &o.step))
            .collect();
        steps.sort_by_key(|s| s.step_index);
        steps
    }

    /// Start a run. Fails if one is already open on this tracer.
    pub async fn begin(&mut self, start: RunStart) -> Result<Run, TraceError> {
        if let Some(active) = &self.active {
            return Err(TraceError::RunAlreadyActive {
                run_id: active.run.id.clone(),
            });
        }

        let run = self
            .store
            .create_run(NewRun {
                pipeline_name: start.pipeline_name,
                pipeline_version: start.pipeline_version,
                input: start.input,
                metadata: start.metadata,
            })
            .await?;

        info!(
            run_id = %run.id,
            pipeline = %run.pipeline_name,
            "Run started"
        );

        self.active = Some(ActiveRun {
            run: run.clone(),
            next_index: 0,
            open_steps: HashMap::new(),
        });
        Ok(run)
    }

    /// Open the next step of the active run.
    ///
    /// Indices are 0, 1, 2, ... in call order. An index is consumed only
    /// when the store accepted the step.
    pub async fn open_step(&mut self, start: StepStart) -> Result<Step, TraceError> {
        let active = self.active.as_mut().ok_or(TraceError::NoActiveRun)?;

        let step = self
            .store
            .create_step(NewStep {
                run_id: active.run.id.clone(),
                step_type: start.step_type,
                step_index: active.next_index,
                input: start.input,
                config: start.config,
                reasoning: start.reasoning,
                capture_all_candidates: start.capture_all,
                metadata: start.metadata,
            })
            .await?;

        debug!(
            run_id = %active.run.id,
            step_id = %step.id,
            step_type = %step.step_type,
            step_index = step.step_index,
            "Step opened"
        );

        active.next_index += 1;
        active.open_steps.insert(
            step.id.clone(),
            OpenStep {
                step: step.clone(),
                capture_all: start.capture_all,
                candidates_recorded: false,
            },
        );
        Ok(step)
    }

    /// Capture and persist the evaluated candidate set of an open step.
    ///
    /// The step's input count becomes the size of `candidates` and its
    /// output count the number of accepted keys found among them, whatever
    /// subset capture decides to persist. A step records one candidate set;
    /// keys must be unique within it. If the call fails it can be repeated,
    /// and candidates are stored at most once.
    pub async fn record_candidates(
        &mut self,
        step_id: &StepId,
        candidates: Vec<RawCandidate>,
        accepted_keys: &HashSet<String>,
    ) -> Result<CaptureOutcome, TraceError> {
        let active = self.active.as_mut().ok_or(TraceError::NoActiveRun)?;
        let open = active
            .open_steps
            .get_mut(step_id)
            .ok_or_else(|| TraceError::UnknownStep(step_id.clone()))?;
        if open.candidates_recorded {
            return Err(TraceError::CandidatesAlreadyRecorded(step_id.clone()));
        }
        if let Some(key) = duplicate_key(&candidates) {
            return Err(TraceError::InvalidInput(format!(
                "candidate key '{key}' appears more than once"
            )));
        }

        let outcome = self
            .capture
            .reduce(step_id, candidates, accepted_keys, open.capture_all);

        debug!(
            step_id = %step_id,
            mode = ?outcome.mode,
            total = outcome.total,
            accepted = outcome.accepted_total,
            persisted = outcome.candidates.len(),
            "Candidates captured"
        );
        if outcome.mode == CaptureMode::Hybrid {
            debug!(
                step_id = %step_id,
                dropped = outcome.total - outcome.candidates.len(),
                "Hybrid capture dropped candidates"
            );
        }

        // Counts first: only the candidate insert must not run twice.
        let counts = StepCounts::new(outcome.total as u64, outcome.accepted_total as u64)
            .map_err(TraceError::invalid)?;
        open.step = self
            .store
            .update_step(
                step_id,
                StepUpdate {
                    counts: Some(counts),
                    ..StepUpdate::default()
                },
            )
            .await?;

        self.store
            .create_candidates_bulk(step_id, outcome.candidates.clone())
            .await?;
        open.candidates_recorded = true;

        Ok(outcome)
    }

    /// Record a filter applied at an open step.
    pub async fn record_filter(
        &mut self,
        step_id: &StepId,
        filter: NewFilter,
    ) -> Result<Filter, TraceError> {
        let active = self.active.as_ref().ok_or(TraceError::NoActiveRun)?;
        if !active.open_steps.contains_key(step_id) {
            return Err(TraceError::UnknownStep(step_id.clone()));
        }
        filter.validate().map_err(TraceError::invalid)?;

        let filter = self.store.create_filter(step_id, filter).await?;
        debug!(
            step_id = %step_id,
            filter_type = %filter.filter_type,
            affected = filter.candidates_affected,
            rejected = filter.candidates_rejected,
            "Filter recorded"
        );
        Ok(filter)
    }

    /// Close an open step.
    ///
    /// The step leaves the open set only once the store accepted the update,
    /// so a failed call can be retried. A second successful close of the
    /// same step fails with [`TraceError::UnknownStep`].
    pub async fn close_step(
        &mut self,
        step_id: &StepId,
        close: StepClose,
    ) -> Result<Step, TraceError> {
        let status = if has_error(&close.error) {
            StepStatus::Failed
        } else {
            StepStatus::Completed
        };
        self.finish_step(step_id, status, close).await
    }

    /// End the active run.
    ///
    /// Steps still open are closed first with status `abandoned`. The run is
    /// closed only after all of them were, and tracer state is cleared only
    /// after the run was.
    pub async fn end(&mut self, end: RunEnd) -> Result<Run, TraceError> {
        if self.active.is_none() {
            return Err(TraceError::NoActiveRun);
        }
        let leftover: Vec<StepId> = self
            .open_steps()
            .into_iter()
            .map(|s| s.id.clone())
            .collect();

        for step_id in leftover {
            warn!(step_id = %step_id, "Closing step left open at run end");
            self.finish_step(
                &step_id,
                StepStatus::Abandoned,
                StepClose::new().reasoning(ABANDONED_REASONING),
            )
            .await?;
        }

        let active = self.active.as_ref().ok_or(TraceError::NoActiveRun)?;
        let failed = has_error(&end.error);
        let run = self
            .store
            .update_run(
                &active.run.id,
                RunUpdate {
                    status: Some(if failed {
                        RunStatus::Failed
                    } else {
                        RunStatus::Completed
                    }),
                    completed_at: Some(Utc::now()),
                    output: end.output,
                    error: end.error.filter(|e| !e.is_empty()),
                },
            )
            .await?;

        info!(
            run_id = %run.id,
            pipeline = %run.pipeline_name,
            status = run.status.as_str(),
            steps = active.next_index,
            "Run ended"
        );

        self.active = None;
        Ok(run)
    }

    async fn finish_step(
        &mut self,
        step_id: &StepId,
        status: StepStatus,
        close: StepClose,
    ) -> Result<Step, TraceError> {
        let active = self.active.as_mut().ok_or(TraceError::NoActiveRun)?;
        let open = active
            .open_steps
            .get(step_id)
            .ok_or_else(|| TraceError::UnknownStep(step_id.clone()))?;

        let completed_at = Utc::now();
        let duration_ms = (completed_at - open.step.started_at)
            .num_milliseconds()
            .max(0);

        let step = self
            .store
            .update_step(
                step_id,
                StepUpdate {
                    status: Some(status),
                    completed_at: Some(completed_at),
                    duration_ms: Some(duration_ms),
                    output: close.output,
                    error: close.error.filter(|e| !e.is_empty()),
                    reasoning: close.reasoning,
                    counts: close.counts,
                },
            )
            .await?;

        active.open_steps.remove(step_id);
        debug!(
            step_id = %step_id,
            status = step.status.as_str(),
            duration_ms = duration_ms,
            "Step closed"
        );
        Ok(step)
    }
}

fn has_error(error: &Option<String>) -> bool {
    error.as_deref().is_some_and(|e| !e.is_empty())
}
