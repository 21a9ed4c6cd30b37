//! Tracing runs into a SQLite file and querying them across pipelines.
//!
//! ```text
//! cargo run --example sqlite_ranking --features sqlite -- traces.db
//! ```

use std::collections::HashSet;

use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing_subscriber::EnvFilter;
use whytrace::{
    EliminationQuery, EvidenceStore, RawCandidate, RunEnd, RunQuery, RunStart, SqliteStore,
    StepClose, StepStart, StepType, Tracer, TypeQuery,
};

async fn traced_run(store: &SqliteStore, pipeline: &str, keep_every: usize) -> anyhow::Result<()> {
    let mut tracer = Tracer::new(store.clone());
    tracer
        .begin(RunStart::new(pipeline, json!({"keep_every": keep_every})))
        .await?;

    let step = tracer.open_step(StepStart::new(StepType::FILTERING)).await?;
    let candidates: Vec<RawCandidate> = (0..250)
        .map(|i| RawCandidate::new(format!("item-{i}"), json!({"i": i})).with_score(i as f64))
        .collect();
    let accepted: HashSet<String> = (0..250)
        .filter(|i| i % keep_every == 0)
        .map(|i| format!("item-{i}"))
        .collect();
    tracer
        .record_candidates(&step.id, candidates, &accepted)
        .await?;
    tracer.close_step(&step.id, StepClose::new()).await?;

    tracer.end(RunEnd::completed(json!({"kept": accepted.len()}))).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "whytrace.db".to_string());
    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;

    let store = SqliteStore::new(pool);
    store.run_migrations().await?;

    traced_run(&store, "listing_optimizer", 1).await?;
    traced_run(&store, "competitor_selection", 20).await?;
    traced_run(&store, "categorizer", 2).await?;

    let runs = store.list_runs(RunQuery::new().limit(10)).await?;
    println!("{} most recent runs in {path}", runs.len());

    let filtering = store
        .query_by_type(&TypeQuery::new(StepType::FILTERING).limit(10))
        .await?;
    println!("{} recent filtering steps", filtering.len());

    for step in store
        .query_high_elimination(&EliminationQuery::default())
        .await?
    {
        println!(
            "  step {} of run {} kept {:?} of {:?}",
            step.step_index, step.run_id, step.output_count, step.input_count
        );
    }

    Ok(())
}
