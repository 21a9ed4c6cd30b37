//! Competitor selection traced end to end with the in-memory store.
//!
//! This example demonstrates:
//! - Starting a run and opening steps in order
//! - Recording a large candidate set (hybrid capture kicks in)
//! - Recording the filters that explain the eliminations
//! - Asking the store afterwards which steps eliminated the most
//!
//! Run with `RUST_LOG=whytrace=debug` to see the tracer's own events.

use std::collections::HashSet;

use serde_json::json;
use tracing_subscriber::EnvFilter;
use whytrace::{
    CandidateStatus, EliminationQuery, EvidenceStore, MemoryStore, NewFilter, RawCandidate,
    RunEnd, RunStart, StepClose, StepStart, StepType, Tracer,
};

#[derive(Debug, Clone)]
struct Product {
    asin: String,
    price: f64,
    rating: f64,
    reviews: u32,
}

/// A deterministic catalogue so the output is stable between runs.
fn catalogue(size: usize) -> Vec<Product> {
    (0..size)
        .map(|i| Product {
            asin: format!("B0{i:05}"),
            price: 10.0 + (i * 37 % 200) as f64,
            rating: 2.5 + (i * 13 % 25) as f64 / 10.0,
            reviews: (i * 91 % 5000) as u32,
        })
        .collect()
}

fn as_candidate(p: &Product, score: f64) -> RawCandidate {
    RawCandidate::new(
        p.asin.clone(),
        json!({"price": p.price, "rating": p.rating, "reviews": p.reviews}),
    )
    .with_score(score)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let store = MemoryStore::new();
    let mut tracer = Tracer::new(store.clone());

    let run = tracer
        .begin(RunStart::new("competitor_selection", json!({"asin": "B0TARGET", "price": 80.0})).version("1.0"))
        .await?;

    // Retrieval: pull a broad set of products from the catalogue.
    let products = catalogue(500);
    let retrieval = tracer
        .open_step(StepStart::new(StepType::RETRIEVAL).input(json!({"query": "wireless earbuds"})))
        .await?;
    tracer
        .close_step(
            &retrieval.id,
            StepClose::completed(json!({"retrieved": products.len()}))
                .reasoning("keyword search over the catalogue"),
        )
        .await?;

    // Filtering: price band and minimum rating.
    let filtering = tracer
        .open_step(StepStart::new(StepType::FILTERING).reasoning("keep comparable products"))
        .await?;
    let in_band = |p: &Product| (40.0..=120.0).contains(&p.price);
    let rated = |p: &Product| p.rating >= 4.0;

    let price_rejected = products.iter().filter(|p| !in_band(p)).count() as u64;
    let rating_rejected = products
        .iter()
        .filter(|p| in_band(p) && !rated(p))
        .count() as u64;
    let survivors: Vec<&Product> = products.iter().filter(|p| in_band(p) && rated(p)).collect();
    let accepted: HashSet<String> = survivors.iter().map(|p| p.asin.clone()).collect();

    let outcome = tracer
        .record_candidates(
            &filtering.id,
            products.iter().map(|p| as_candidate(p, p.rating)).collect(),
            &accepted,
        )
        .await?;
    tracer
        .record_filter(
            &filtering.id,
            NewFilter::new("price_band", products.len() as u64, price_rejected)?,
        )
        .await?;
    tracer
        .record_filter(
            &filtering.id,
            NewFilter::new(
                "min_rating",
                products.len() as u64 - price_rejected,
                rating_rejected,
            )?,
        )
        .await?;
    tracer
        .close_step(
            &filtering.id,
            StepClose::completed(json!({"survivors": survivors.len()})),
        )
        .await?;

    // Ranking: score survivors by review volume weighted by rating.
    let ranking = tracer.open_step(StepStart::new(StepType::RANKING)).await?;
    let mut ranked: Vec<(&Product, f64)> = survivors
        .iter()
        .map(|p| (*p, p.rating * (1.0 + p.reviews as f64).ln()))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    let top: HashSet<String> = ranked.iter().take(5).map(|(p, _)| p.asin.clone()).collect();
    tracer
        .record_candidates(
            &ranking.id,
            ranked.iter().map(|(p, s)| as_candidate(p, *s)).collect(),
            &top,
        )
        .await?;
    tracer
        .close_step(
            &ranking.id,
            StepClose::completed(json!({"top": top.len()}))
                .reasoning("rating weighted by log review count"),
        )
        .await?;

    let winner = ranked.first().map(|(p, _)| p.asin.clone());
    tracer
        .end(RunEnd::completed(json!({"competitor": winner})))
        .await?;

    let detail = store.get_run(&run.id).await?;
    println!(
        "run {} ({}): {}",
        detail.run.id,
        detail.run.pipeline_name,
        detail.run.status.as_str()
    );
    for step in &detail.steps {
        println!(
            "  #{} {:<10} in={:?} out={:?} candidates={} filters={}",
            step.step.step_index,
            step.step.step_type,
            step.step.input_count,
            step.step.output_count,
            step.candidates.len(),
            step.filters.len()
        );
    }
    println!(
        "filtering capture: {:?}, {} accepted and {} rejected persisted of {}",
        outcome.mode,
        outcome.accepted_emitted(),
        outcome.rejected_emitted(),
        outcome.total
    );

    let best = store
        .list_candidates(&ranking.id, Some(CandidateStatus::Accepted), Some(3))
        .await?;
    for candidate in best {
        println!(
            "  kept {} score={:.2}",
            candidate.candidate_key,
            candidate.score.unwrap_or_default()
        );
    }

    let aggressive = store
        .query_high_elimination(&EliminationQuery::new(0.5)?)
        .await?;
    println!("filtering steps keeping under half their input: {}", aggressive.len());

    Ok(())
}
