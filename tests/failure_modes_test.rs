//! Tests demonstrating how the tracer behaves when the store fails.
//!
//! Failures are surfaced to the caller immediately and leave the tracer in a
//! state from which the same call can be retried.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use whytrace::{
    Candidate, CandidateStatus, EliminationQuery, EvidenceStore, Filter, MemoryStore, NewFilter,
    NewRun, NewStep, RawCandidate, Run, RunDetail, RunEnd, RunId, RunQuery, RunStart, RunStatus,
    RunUpdate, Step, StepClose, StepDetail, StepId, StepStart, StepStatus, StepUpdate, StoreError,
    TraceError, Tracer, TypeQuery,
};

/// Memory store whose write paths can be switched to fail.
#[derive(Clone, Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_create_step: Arc<AtomicBool>,
    fail_update_step: Arc<AtomicBool>,
    fail_update_run: Arc<AtomicBool>,
    fail_candidates: Arc<AtomicBool>,
}

fn unavailable() -> StoreError {
    StoreError::backend(anyhow::anyhow!("store unavailable"))
}

fn check(flag: &AtomicBool) -> Result<(), StoreError> {
    if flag.load(Ordering::SeqCst) {
        Err(unavailable())
    } else {
        Ok(())
    }
}

#[async_trait]
impl EvidenceStore for FlakyStore {
    async fn create_run(&self, run: NewRun) -> Result<Run, StoreError> {
        self.inner.create_run(run).await
    }

    async fn update_run(&self, id: &RunId, update: RunUpdate) -> Result<Run, StoreError> {
        check(&self.fail_update_run)?;
        self.inner.update_run(id, update).await
    }

    async fn create_step(&self, step: NewStep) -> Result<Step, StoreError> {
        check(&self.fail_create_step)?;
        self.inner.create_step(step).await
    }

    async fn update_step(&self, id: &StepId, update: StepUpdate) -> Result<Step, StoreError> {
        check(&self.fail_update_step)?;
        self.inner.update_step(id, update).await
    }

    async fn create_candidates_bulk(
        &self,
        step_id: &StepId,
        candidates: Vec<Candidate>,
    ) -> Result<Vec<Candidate>, StoreError> {
        check(&self.fail_candidates)?;
        self.inner.create_candidates_bulk(step_id, candidates).await
    }

    async fn create_filter(
        &self,
        step_id: &StepId,
        filter: NewFilter,
    ) -> Result<Filter, StoreError> {
        self.inner.create_filter(step_id, filter).await
    }

    async fn get_run(&self, id: &RunId) -> Result<RunDetail, StoreError> {
        self.inner.get_run(id).await
    }

    async fn list_runs(&self, query: RunQuery) -> Result<Vec<Run>, StoreError> {
        self.inner.list_runs(query).await
    }

    async fn get_step(&self, id: &StepId) -> Result<StepDetail, StoreError> {
        self.inner.get_step(id).await
    }

    async fn list_candidates(
        &self,
        step_id: &StepId,
        status: Option<CandidateStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Candidate>, StoreError> {
        self.inner.list_candidates(step_id, status, limit).await
    }

    async fn query_high_elimination(
        &self,
        query: &EliminationQuery,
    ) -> Result<Vec<Step>, StoreError> {
        self.inner.query_high_elimination(query).await
    }

    async fn query_by_type(&self, query: &TypeQuery) -> Result<Vec<Step>, StoreError> {
        self.inner.query_by_type(query).await
    }
}

#[tokio::test]
async fn failed_step_creation_does_not_consume_an_index() {
    let store = FlakyStore::default();
    let mut tracer = Tracer::new(store.clone());
    let run = tracer.begin(RunStart::new("p", json!({}))).await.unwrap();

    store.fail_create_step.store(true, Ordering::SeqCst);
    let err = tracer
        .open_step(StepStart::new("search"))
        .await
        .unwrap_err();
    assert!(err.is_transport());
    assert!(tracer.open_steps().is_empty());

    store.fail_create_step.store(false, Ordering::SeqCst);
    let step = tracer.open_step(StepStart::new("search")).await.unwrap();
    assert_eq!(step.step_index, 0);

    let detail = store.get_run(&run.id).await.unwrap();
    assert_eq!(detail.steps.len(), 1);
}

#[tokio::test]
async fn failed_close_can_be_retried() {
    let store = FlakyStore::default();
    let mut tracer = Tracer::new(store.clone());
    tracer.begin(RunStart::new("p", json!({}))).await.unwrap();
    let step = tracer.open_step(StepStart::new("ranking")).await.unwrap();

    store.fail_update_step.store(true, Ordering::SeqCst);
    let err = tracer
        .close_step(&step.id, StepClose::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TraceError::Transport(StoreError::Backend(_))));
    assert_eq!(tracer.open_steps().len(), 1);

    store.fail_update_step.store(false, Ordering::SeqCst);
    let closed = tracer.close_step(&step.id, StepClose::new()).await.unwrap();
    assert_eq!(closed.status, StepStatus::Completed);
    assert!(tracer.open_steps().is_empty());
}

#[tokio::test]
async fn failed_run_close_keeps_run_active() {
    let store = FlakyStore::default();
    let mut tracer = Tracer::new(store.clone());
    let run = tracer.begin(RunStart::new("p", json!({}))).await.unwrap();
    tracer.open_step(StepStart::new("search")).await.unwrap();

    store.fail_update_run.store(true, Ordering::SeqCst);
    assert!(tracer.end(RunEnd::new()).await.unwrap_err().is_transport());
    // The step was abandoned before the run update failed.
    assert!(tracer.open_steps().is_empty());
    assert_eq!(tracer.active_run().map(|r| &r.id), Some(&run.id));

    store.fail_update_run.store(false, Ordering::SeqCst);
    let ended = tracer.end(RunEnd::new()).await.unwrap();
    assert_eq!(ended.status, RunStatus::Completed);
    assert!(tracer.active_run().is_none());

    let detail = store.get_run(&run.id).await.unwrap();
    assert_eq!(detail.steps[0].step.status, StepStatus::Abandoned);
}

#[tokio::test]
async fn failed_abandon_leaves_run_open() {
    let store = FlakyStore::default();
    let mut tracer = Tracer::new(store.clone());
    let run = tracer.begin(RunStart::new("p", json!({}))).await.unwrap();
    tracer.open_step(StepStart::new("search")).await.unwrap();

    store.fail_update_step.store(true, Ordering::SeqCst);
    assert!(tracer.end(RunEnd::new()).await.is_err());
    assert_eq!(tracer.open_steps().len(), 1);

    let stored = store.get_run(&run.id).await.unwrap().run;
    assert_eq!(stored.status, RunStatus::Running);
}

#[tokio::test]
async fn failed_candidate_write_can_be_retried() {
    let store = FlakyStore::default();
    let mut tracer = Tracer::new(store.clone());
    tracer.begin(RunStart::new("p", json!({}))).await.unwrap();
    let step = tracer.open_step(StepStart::new("filtering")).await.unwrap();
    let batch = || vec![RawCandidate::new("a", json!(1)), RawCandidate::new("b", json!(2))];
    let accepted: HashSet<String> = HashSet::from(["a".to_string()]);

    store.fail_candidates.store(true, Ordering::SeqCst);
    let err = tracer
        .record_candidates(&step.id, batch(), &accepted)
        .await
        .unwrap_err();
    assert!(err.is_transport());
    assert!(store.get_step(&step.id).await.unwrap().candidates.is_empty());

    store.fail_candidates.store(false, Ordering::SeqCst);
    tracer
        .record_candidates(&step.id, batch(), &accepted)
        .await
        .unwrap();

    let detail = store.get_step(&step.id).await.unwrap();
    assert_eq!(detail.candidates.len(), 2);
    assert_eq!(detail.step.input_count, Some(2));
    assert_eq!(detail.step.output_count, Some(1));
}

#[tokio::test]
async fn failed_count_update_stores_no_candidates() {
    let store = FlakyStore::default();
    let mut tracer = Tracer::new(store.clone());
    tracer.begin(RunStart::new("p", json!({}))).await.unwrap();
    let step = tracer.open_step(StepStart::new("filtering")).await.unwrap();
    let batch = || vec![RawCandidate::new("a", json!(1)), RawCandidate::new("b", json!(2))];
    let accepted: HashSet<String> = HashSet::from(["a".to_string()]);

    store.fail_update_step.store(true, Ordering::SeqCst);
    let err = tracer
        .record_candidates(&step.id, batch(), &accepted)
        .await
        .unwrap_err();
    assert!(err.is_transport());
    assert!(store.get_step(&step.id).await.unwrap().candidates.is_empty());

    store.fail_update_step.store(false, Ordering::SeqCst);
    tracer
        .record_candidates(&step.id, batch(), &accepted)
        .await
        .unwrap();

    let detail = store.get_step(&step.id).await.unwrap();
    let mut keys: Vec<&str> = detail
        .candidates
        .iter()
        .map(|c| c.candidate_key.as_str())
        .collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["a", "b"]);
    assert_eq!(detail.step.input_count, Some(2));
    assert_eq!(detail.step.output_count, Some(1));
}

#[tokio::test]
async fn invalid_filter_is_refused_before_the_store() {
    let store = FlakyStore::default();
    let mut tracer = Tracer::new(store.clone());
    tracer.begin(RunStart::new("p", json!({}))).await.unwrap();
    let step = tracer.open_step(StepStart::new("filtering")).await.unwrap();

    assert!(NewFilter::new("price", 3, 5).is_err());

    let mut filter = NewFilter::new("price", 3, 1).unwrap();
    filter.candidates_rejected = 9;
    let err = tracer.record_filter(&step.id, filter).await.unwrap_err();
    assert!(matches!(err, TraceError::InvalidInput(_)));
    assert!(!err.is_transport());
    assert!(store.get_step(&step.id).await.unwrap().filters.is_empty());
}
