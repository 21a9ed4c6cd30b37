//! Adaptive candidate capture.
//!
//! Decides which evaluated candidates of a step are persisted as evidence.
//! Small sets are captured in full. Large sets are reduced to the
//! best-scoring accepted candidates plus a uniform sample of rejected ones,
//! which keeps the write volume of a step bounded no matter how many items
//! it evaluated.

use std::cmp::Ordering;
use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TraceError;
use crate::model::{Candidate, CandidateId, CandidateStatus, Metadata, StepId};

/// Reason attached to every persisted rejected candidate.
pub const REJECTION_REASON: &str = "Filtered out";

/// Thresholds for the capture strategy.
///
/// Fields are signed so that configuration loaded from outside the process
/// can express a negative value; [`CaptureConfig::validate`] rejects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Sets smaller than this are captured in full.
    pub full_capture_threshold: i64,
    /// Accepted candidates kept in hybrid mode, highest score first.
    pub top_accepted_count: i64,
    /// Rejected candidates sampled in hybrid mode.
    pub sample_rejected_count: i64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            full_capture_threshold: 100,
            top_accepted_count: 50,
            sample_rejected_count: 20,
        }
    }
}

impl CaptureConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn full_capture_threshold(mut self, threshold: i64) -> Self {
        self.full_capture_threshold = threshold;
        self
    }

    pub fn top_accepted_count(mut self, count: i64) -> Self {
        self.top_accepted_count = count;
        self
    }

    pub fn sample_rejected_count(mut self, count: i64) -> Self {
        self.sample_rejected_count = count;
        self
    }

    /// Reject negative thresholds.
    pub fn validate(&self) -> Result<(), TraceError> {
        let fields = [
            ("full_capture_threshold", self.full_capture_threshold),
            ("top_accepted_count", self.top_accepted_count),
            ("sample_rejected_count", self.sample_rejected_count),
        ];
        for (name, value) in fields {
            if value < 0 {
                return Err(TraceError::Configuration(format!(
                    "{name} must be non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// A candidate as evaluated by the pipeline, before capture.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCandidate {
    pub key: String,
    pub data: Value,
    pub score: Option<f64>,
    pub metadata: Metadata,
}

impl RawCandidate {
    pub fn new(key: impl Into<String>, data: Value) -> Self {
        Self {
            key: key.into(),
            data,
            score: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// How a candidate set was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Every evaluated candidate was kept.
    Full,
    /// Top accepted candidates plus a rejected sample were kept.
    Hybrid,
}

/// Result of [`CaptureStrategy::reduce`].
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOutcome {
    pub mode: CaptureMode,
    /// Size of the evaluated set.
    pub total: usize,
    /// Accepted candidates in the evaluated set.
    pub accepted_total: usize,
    /// Candidates to persist.
    pub candidates: Vec<Candidate>,
}

impl CaptureOutcome {
    pub fn accepted_emitted(&self) -> usize {
        self.count(CandidateStatus::Accepted)
    }

    pub fn rejected_emitted(&self) -> usize {
        self.count(CandidateStatus::Rejected)
    }

    fn count(&self, status: CandidateStatus) -> usize {
        self.candidates.iter().filter(|c| c.status == status).count()
    }
}

/// Capture policy with an injectable random source for rejected sampling.
#[derive(Debug, Clone)]
pub struct CaptureStrategy {
    full_capture_threshold: usize,
    top_accepted_count: usize,
    sample_rejected_count: usize,
    rng: StdRng,
}

impl Default for CaptureStrategy {
    fn default() -> Self {
        Self::from_valid(CaptureConfig::default())
    }
}

impl CaptureStrategy {
    /// Validate `config` and build a strategy seeded from OS entropy.
    pub fn new(config: CaptureConfig) -> Result<Self, TraceError> {
        config.validate()?;
        Ok(Self::from_valid(config))
    }

    /// Build from a config already known to be non-negative.
    fn from_valid(config: CaptureConfig) -> Self {
        Self {
            full_capture_threshold: config.full_capture_threshold.max(0) as usize,
            top_accepted_count: config.top_accepted_count.max(0) as usize,
            sample_rejected_count: config.sample_rejected_count.max(0) as usize,
            rng: StdRng::from_entropy(),
        }
    }

    /// Use a deterministic random source.
    pub fn with_seed(self, seed: u64) -> Self {
        self.with_rng(StdRng::seed_from_u64(seed))
    }

    /// Use the given random source for rejected sampling.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    /// The thresholds this strategy applies.
    pub fn config(&self) -> CaptureConfig {
        CaptureConfig {
            full_capture_threshold: self.full_capture_threshold as i64,
            top_accepted_count: self.top_accepted_count as i64,
            sample_rejected_count: self.sample_rejected_count as i64,
        }
    }

    /// Reduce an evaluated set to the candidates worth persisting for `step_id`.
    ///
    /// `capture_all` overrides the size heuristic when present.
    pub fn reduce(
        &mut self,
        step_id: &StepId,
        candidates: Vec<RawCandidate>,
        accepted_keys: &HashSet<String>,
        capture_all: Option<bool>,
    ) -> CaptureOutcome {
        let total = candidates.len();
        let accepted_total = candidates
            .iter()
            .filter(|c| accepted_keys.contains(&c.key))
            .count();

        if capture_all.unwrap_or(total < self.full_capture_threshold) {
            let candidates = candidates
                .into_iter()
                .map(|c| {
                    if accepted_keys.contains(&c.key) {
                        into_accepted(step_id, c)
                    } else {
                        into_rejected(step_id, c)
                    }
                })
                .collect();
            return CaptureOutcome {
                mode: CaptureMode::Full,
                total,
                accepted_total,
                candidates,
            };
        }

        let (mut accepted, mut rejected): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|c| accepted_keys.contains(&c.key));

        accepted.sort_by(|a, b| by_score_desc(a.score, b.score));
        accepted.truncate(self.top_accepted_count);

        rejected.shuffle(&mut self.rng);
        rejected.truncate(self.sample_rejected_count);

        let candidates = accepted
            .into_iter()
            .map(|c| into_accepted(step_id, c))
            .chain(rejected.into_iter().map(|c| into_rejected(step_id, c)))
            .collect();

        CaptureOutcome {
            mode: CaptureMode::Hybrid,
            total,
            accepted_total,
            candidates,
        }
    }
}

/// First key that occurs more than once in `candidates`.
///
/// Candidate keys identify an item within its step, so a set with repeated
/// keys cannot be recorded.
pub fn duplicate_key(candidates: &[RawCandidate]) -> Option<&str> {
    let mut seen = HashSet::with_capacity(candidates.len());
    candidates
        .iter()
        .map(|c| c.key.as_str())
        .find(|key| !seen.insert(*key))
}

/// Absent and NaN scores rank below every real score.
pub(crate) fn by_score_desc(a: Option<f64>, b: Option<f64>) -> Ordering {
    let key = |s: Option<f64>| match s {
        Some(v) if !v.is_nan() => v,
        _ => f64::NEG_INFINITY,
    };
    key(b).total_cmp(&key(a))
}

fn into_accepted(step_id: &StepId, raw: RawCandidate) -> Candidate {
    Candidate {
        id: CandidateId::generate(),
        step_id: step_id.clone(),
        candidate_key: raw.key,
        status: CandidateStatus::Accepted,
        score: raw.score,
        reason: None,
        data: raw.data,
        metadata: raw.metadata,
    }
}

fn into_rejected(step_id: &StepId, raw: RawCandidate) -> Candidate {
    Candidate {
        id: CandidateId::generate(),
        step_id: step_id.clone(),
        candidate_key: raw.key,
        status: CandidateStatus::Rejected,
        score: None,
        reason: Some(REJECTION_REASON.to_string()),
        data: raw.data,
        metadata: raw.metadata,
    }
}
