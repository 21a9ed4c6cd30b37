//! Cross-pipeline queries over persisted steps.
//!
//! Both queries are answered from step rows alone. Elimination is judged
//! from the `input_count`/`output_count` stored on the step, never by
//! counting candidate rows, because capture may persist only a sample of
//! what a step evaluated.

use std::cmp::Ordering;

use crate::error::StoreError;
use crate::model::{Step, StepType};

/// Default ratio below which a filtering step counts as aggressive.
pub const DEFAULT_ELIMINATION_THRESHOLD: f64 = 0.9;

/// Steps of one type whose `output / input` ratio is below a threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct EliminationQuery {
    pub step_type: StepType,
    pub threshold: f64,
    pub limit: Option<usize>,
}

impl Default for EliminationQuery {
    fn default() -> Self {
        Self {
            step_type: StepType::filtering(),
            threshold: DEFAULT_ELIMINATION_THRESHOLD,
            limit: None,
        }
    }
}

impl EliminationQuery {
    /// Query filtering steps below `threshold`.
    pub fn new(threshold: f64) -> Result<Self, StoreError> {
        let query = Self {
            threshold,
            ..Self::default()
        };
        query.validate()?;
        Ok(query)
    }

    pub fn step_type(mut self, step_type: impl Into<StepType>) -> Self {
        self.step_type = step_type.into();
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(StoreError::InvalidRecord(format!(
                "elimination threshold must be finite and non-negative, got {}",
                self.threshold
            )));
        }
        Ok(())
    }

    /// Whether `step` belongs in this query's result.
    pub fn matches(&self, step: &Step) -> bool {
        step.step_type == self.step_type
            && step
                .elimination_ratio()
                .is_some_and(|ratio| ratio < self.threshold)
    }
}

/// Steps with exactly this type label, regardless of pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeQuery {
    pub step_type: StepType,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl TypeQuery {
    pub fn new(step_type: impl Into<StepType>) -> Self {
        Self {
            step_type: step_type.into(),
            limit: None,
            offset: None,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Most recently started first; later index breaks ties within a run.
pub fn recent_first(a: &Step, b: &Step) -> Ordering {
    b.started_at
        .cmp(&a.started_at)
        .then_with(|| b.step_index.cmp(&a.step_index))
        .then_with(|| a.id.cmp(&b.id))
}

/// Evaluate an [`EliminationQuery`] over committed steps.
pub fn high_elimination<'a>(
    steps: impl IntoIterator<Item = &'a Step>,
    query: &EliminationQuery,
) -> Vec<Step> {
    let mut matched: Vec<Step> = steps
        .into_iter()
        .filter(|s| query.matches(s))
        .cloned()
        .collect();
    matched.sort_by(recent_first);
    if let Some(limit) = query.limit {
        matched.truncate(limit);
    }
    matched
}

/// Evaluate a [`TypeQuery`] over committed steps.
pub fn by_type<'a>(steps: impl IntoIterator<Item = &'a Step>, query: &TypeQuery) -> Vec<Step> {
    let mut matched: Vec<Step> = steps
        .into_iter()
        .filter(|s| s.step_type == query.step_type)
        .cloned()
        .collect();
    matched.sort_by(recent_first);
    matched
        .into_iter()
        .skip(query.offset.unwrap_or(0))
        .take(query.limit.unwrap_or(usize::MAX))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Metadata, RunId, StepId, StepStatus};
    use chrono::{Duration, Utc};

    fn step(step_type: &str, input: Option<u64>, output: Option<u64>, age_secs: i64) -> Step {
        Step {
            id: StepId::generate(),
            run_id: RunId::generate(),
            step_type: StepType::from(step_type),
            step_index: 0,
            status: StepStatus::Completed,
            started_at: Utc::now() - Duration::seconds(age_secs),
            completed_at: None,
            input: None,
            output: None,
            reasoning: None,
            config: None,
            input_count: input,
            output_count: output,
            duration_ms: None,
            error: None,
            metadata: Metadata::new(),
            capture_all_candidates: false,
        }
    }

    #[test]
    fn elimination_threshold_is_strict() {
        let s = step("filtering", Some(100), Some(5), 0);
        assert!(EliminationQuery::new(0.9).unwrap().matches(&s));
        assert!(!EliminationQuery::new(0.01).unwrap().matches(&s));
        assert!(!EliminationQuery::new(0.05).unwrap().matches(&s));
    }

    #[test]
    fn elimination_ignores_zero_input_and_other_types() {
        let query = EliminationQuery::default();
        assert!(!query.matches(&step("filtering", Some(0), Some(0), 0)));
        assert!(!query.matches(&step("filtering", None, None, 0)));
        assert!(!query.matches(&step("ranking", Some(100), Some(1), 0)));
        assert!(query
            .clone()
            .step_type("ranking")
            .matches(&step("ranking", Some(100), Some(1), 0)));
    }

    #[test]
    fn rejects_unusable_thresholds() {
        assert!(EliminationQuery::new(f64::NAN).is_err());
        assert!(EliminationQuery::new(-0.1).is_err());
        assert!(EliminationQuery::new(f64::INFINITY).is_err());
        assert!(EliminationQuery::new(0.0).is_ok());
    }

    #[test]
    fn results_are_most_recent_first() {
        let old = step("filtering", Some(10), Some(1), 60);
        let new = step("filtering", Some(10), Some(2), 1);
        let steps = vec![old.clone(), new.clone()];

        let found = high_elimination(&steps, &EliminationQuery::default());
        assert_eq!(found, vec![new.clone(), old.clone()]);

        let typed = by_type(&steps, &TypeQuery::new("filtering").limit(1));
        assert_eq!(typed, vec![new]);
        let paged = by_type(&steps, &TypeQuery::new("filtering").offset(1));
        assert_eq!(paged, vec![old]);
    }
}
