//! Integration tests for the SQLite evidence store.

#![cfg(feature = "sqlite")]

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use whytrace::{
    Candidate, CandidateId, CandidateStatus, EliminationQuery, EvidenceStore, Metadata, NewFilter,
    RawCandidate, RunEnd, RunQuery, RunStart, RunStatus, SqliteStore, StepClose, StepCounts,
    StepId, StepStart, StepStatus, StoreError, TraceError, Tracer, TypeQuery,
};

async fn setup() -> (SqlitePool, SqliteStore) {
    // A single connection keeps every query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteStore::new(pool.clone());
    store.run_migrations().await.unwrap();
    (pool, store)
}

#[tokio::test]
async fn successful_run_recording() {
    let (pool, store) = setup().await;
    let mut tracer = Tracer::new(store.clone());

    let run = tracer
        .begin(RunStart::new("competitor_selection", json!({"asin": "B0X"})))
        .await
        .unwrap();
    let step = tracer.open_step(StepStart::new("filtering")).await.unwrap();

    let candidates = (1..=5)
        .map(|i| RawCandidate::new(format!("p{i}"), json!({"i": i})).with_score(i as f64))
        .collect();
    let accepted: HashSet<String> = ["p1", "p3", "p5"].iter().map(|k| k.to_string()).collect();
    tracer
        .record_candidates(&step.id, candidates, &accepted)
        .await
        .unwrap();
    tracer
        .record_filter(&step.id, NewFilter::new("rating", 5, 2).unwrap())
        .await
        .unwrap();
    tracer
        .close_step(&step.id, StepClose::completed(json!({"kept": 3})))
        .await
        .unwrap();
    tracer
        .end(RunEnd::completed(json!({"winner": "p5"})))
        .await
        .unwrap();

    let status: String = sqlx::query_scalar("SELECT status FROM trace_runs WHERE id = ?")
        .bind(run.id.as_str())
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "completed");

    let candidate_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM trace_candidates WHERE step_id = ?")
            .bind(step.id.as_str())
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(candidate_count, 5);

    let detail = store.get_run(&run.id).await.unwrap();
    assert_eq!(detail.run.output, Some(json!({"winner": "p5"})));
    assert_eq!(detail.steps.len(), 1);
    let recorded = &detail.steps[0];
    assert_eq!(recorded.step.status, StepStatus::Completed);
    assert_eq!(recorded.step.step_index, 0);
    assert_eq!(recorded.step.input_count, Some(5));
    assert_eq!(recorded.step.output_count, Some(3));
    assert!(recorded.step.duration_ms.is_some());
    assert_eq!(recorded.filters.len(), 1);
    assert_eq!(recorded.filters[0].candidates_rejected, 2);

    let keys: Vec<String> = recorded
        .candidates
        .iter()
        .map(|c| c.candidate_key.clone())
        .collect();
    assert_eq!(keys, vec!["p1", "p2", "p3", "p4", "p5"]);
}

#[tokio::test]
async fn created_records_read_back_unchanged() {
    let (_pool, store) = setup().await;
    let mut tracer = Tracer::new(store.clone());
    let run = tracer
        .begin(RunStart::new("p", json!({"q": "laptop"})).version("2"))
        .await
        .unwrap();
    let step = tracer
        .open_step(StepStart::new("search").input(json!(["a", "b"])))
        .await
        .unwrap();

    let stored_run = store.get_run(&run.id).await.unwrap().run;
    assert_eq!(stored_run, run);
    let stored_step = store.get_step(&step.id).await.unwrap().step;
    assert_eq!(stored_step, step);

    let closed = tracer.close_step(&step.id, StepClose::new()).await.unwrap();
    assert_eq!(store.get_step(&step.id).await.unwrap().step, closed);
}

#[tokio::test]
async fn abandoned_steps_and_failed_run() {
    let (pool, store) = setup().await;
    let mut tracer = Tracer::new(store.clone());
    let run = tracer.begin(RunStart::new("p", json!({}))).await.unwrap();
    tracer.open_step(StepStart::new("search")).await.unwrap();
    tracer.open_step(StepStart::new("ranking")).await.unwrap();

    tracer.end(RunEnd::failed("crashed")).await.unwrap();

    let open: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM trace_steps WHERE run_id = ? AND status = 'running'",
    )
    .bind(run.id.as_str())
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(open, 0);

    let detail = store.get_run(&run.id).await.unwrap();
    assert_eq!(detail.run.status, RunStatus::Failed);
    assert_eq!(detail.run.error.as_deref(), Some("crashed"));
    assert!(detail
        .steps
        .iter()
        .all(|s| s.step.status == StepStatus::Abandoned));
}

#[tokio::test]
async fn candidates_listed_by_score_and_status() {
    let (_pool, store) = setup().await;
    let mut tracer = Tracer::new(store.clone());
    tracer.begin(RunStart::new("p", json!({}))).await.unwrap();
    let step = tracer.open_step(StepStart::new("ranking")).await.unwrap();

    let candidates = vec![
        RawCandidate::new("low", json!(null)).with_score(0.1),
        RawCandidate::new("unscored", json!(null)),
        RawCandidate::new("high", json!(null)).with_score(0.9),
        RawCandidate::new("dropped", json!(null)).with_score(0.5),
    ];
    let accepted: HashSet<String> = ["low", "unscored", "high"]
        .iter()
        .map(|k| k.to_string())
        .collect();
    tracer
        .record_candidates(&step.id, candidates, &accepted)
        .await
        .unwrap();

    let listed = store
        .list_candidates(&step.id, Some(CandidateStatus::Accepted), None)
        .await
        .unwrap();
    let keys: Vec<&str> = listed.iter().map(|c| c.candidate_key.as_str()).collect();
    assert_eq!(keys, vec!["high", "low", "unscored"]);

    let rejected = store
        .list_candidates(&step.id, Some(CandidateStatus::Rejected), None)
        .await
        .unwrap();
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].score.is_none());

    let top = store.list_candidates(&step.id, None, Some(2)).await.unwrap();
    assert_eq!(top.len(), 2);
}

#[tokio::test]
async fn elimination_and_type_queries() {
    let (_pool, store) = setup().await;
    for (pipeline, input, output) in [("a", 100, 5), ("b", 100, 95), ("c", 0, 0)] {
        let mut tracer = Tracer::new(store.clone());
        tracer.begin(RunStart::new(pipeline, json!({}))).await.unwrap();
        let step = tracer.open_step(StepStart::new("filtering")).await.unwrap();
        tracer
            .close_step(
                &step.id,
                StepClose::new().counts(StepCounts::new(input, output).unwrap()),
            )
            .await
            .unwrap();
        tracer.end(RunEnd::new()).await.unwrap();
    }

    let hits = store
        .query_high_elimination(&EliminationQuery::default())
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].output_count, Some(5));

    let none = store
        .query_high_elimination(&EliminationQuery::new(0.01).unwrap())
        .await
        .unwrap();
    assert!(none.is_empty());

    let all = store
        .query_by_type(&TypeQuery::new("filtering"))
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    let paged = store
        .query_by_type(&TypeQuery::new("filtering").offset(1).limit(1))
        .await
        .unwrap();
    assert_eq!(paged.len(), 1);

    let runs = store
        .list_runs(RunQuery::new().pipeline("b"))
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
}

#[tokio::test]
async fn deleting_a_run_cascades() {
    let (pool, store) = setup().await;
    let mut tracer = Tracer::builder(Arc::new(store.clone())).build().unwrap();
    let run = tracer.begin(RunStart::new("p", json!({}))).await.unwrap();
    let step = tracer.open_step(StepStart::new("filtering")).await.unwrap();
    let accepted: HashSet<String> = HashSet::from(["a".to_string()]);
    tracer
        .record_candidates(&step.id, vec![RawCandidate::new("a", json!(1))], &accepted)
        .await
        .unwrap();
    tracer.end(RunEnd::new()).await.unwrap();

    assert!(store.delete_run(&run.id).await.unwrap());
    assert!(!store.delete_run(&run.id).await.unwrap());

    let candidates: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trace_candidates")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(candidates, 0);
    assert!(matches!(
        store.get_step(&step.id).await,
        Err(StoreError::NotFound { kind: "step", .. })
    ));
}

#[tokio::test]
async fn status_cannot_change_twice() {
    let (_pool, store) = setup().await;
    let mut tracer = Tracer::new(store.clone());
    let run = tracer.begin(RunStart::new("p", json!({}))).await.unwrap();
    tracer.end(RunEnd::new()).await.unwrap();

    let err = store
        .update_run(
            &run.id,
            whytrace::RunUpdate {
                status: Some(RunStatus::Failed),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidRecord(_)));
}

fn accepted(step_id: &StepId, key: &str) -> Candidate {
    Candidate {
        id: CandidateId::generate(),
        step_id: step_id.clone(),
        candidate_key: key.to_string(),
        status: CandidateStatus::Accepted,
        score: None,
        reason: None,
        data: json!({}),
        metadata: Metadata::new(),
    }
}

#[tokio::test]
async fn candidate_keys_are_unique_per_step() {
    let (pool, store) = setup().await;
    let mut tracer = Tracer::new(store.clone());
    tracer.begin(RunStart::new("p", json!({}))).await.unwrap();
    let step = tracer.open_step(StepStart::new("filtering")).await.unwrap();
    let other = tracer.open_step(StepStart::new("ranking")).await.unwrap();

    let batch = || vec![RawCandidate::new("a", json!(1)), RawCandidate::new("b", json!(2))];
    let keep: HashSet<String> = HashSet::from(["a".to_string()]);
    tracer
        .record_candidates(&step.id, batch(), &keep)
        .await
        .unwrap();

    let err = tracer
        .record_candidates(&step.id, batch(), &keep)
        .await
        .unwrap_err();
    assert!(matches!(err, TraceError::CandidatesAlreadyRecorded(_)));

    // Bypassing the tracer hits the table constraint; the batch is all or nothing.
    let err = store
        .create_candidates_bulk(&step.id, vec![accepted(&step.id, "c"), accepted(&step.id, "a")])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidRecord(_)));

    let err = store
        .create_candidates_bulk(&step.id, vec![accepted(&step.id, "d"), accepted(&step.id, "d")])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidRecord(_)));

    // The same key is fine under a different step.
    store
        .create_candidates_bulk(&other.id, vec![accepted(&other.id, "a")])
        .await
        .unwrap();

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trace_candidates WHERE step_id = ?")
        .bind(step.id.as_str())
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 2);
}

#[tokio::test]
async fn counts_beyond_integer_range_are_refused() {
    let (_pool, store) = setup().await;
    let mut tracer = Tracer::new(store.clone());
    tracer.begin(RunStart::new("p", json!({}))).await.unwrap();
    let step = tracer.open_step(StepStart::new("filtering")).await.unwrap();

    let err = tracer
        .close_step(
            &step.id,
            StepClose::new().counts(StepCounts::new(u64::MAX, 1).unwrap()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TraceError::Transport(StoreError::InvalidRecord(_))));
    assert_eq!(tracer.open_steps().len(), 1);

    let stored = store.get_step(&step.id).await.unwrap().step;
    assert_eq!(stored.status, StepStatus::Running);
    assert_eq!(stored.input_count, None);
}
