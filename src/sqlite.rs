//! SQLite-backed evidence store.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::analytics::{EliminationQuery, TypeQuery};
use crate::error::StoreError;
use crate::model::{
    Candidate, CandidateId, CandidateStatus, Filter, FilterId, NewFilter, NewRun, NewStep, Run,
    RunDetail, RunId, RunStatus, RunUpdate, Step, StepDetail, StepId, StepStatus, StepType,
    StepUpdate,
};
use crate::store::{check_candidate_batch, duplicate_candidate, EvidenceStore, RunQuery};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS trace_runs (
    id TEXT PRIMARY KEY,
    pipeline_name TEXT NOT NULL,
    pipeline_version TEXT,
    status TEXT NOT NULL DEFAULT 'running',
    started_at TEXT NOT NULL,
    completed_at TEXT,
    input TEXT NOT NULL,
    output TEXT,
    error_message TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS trace_steps (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES trace_runs(id) ON DELETE CASCADE,
    step_type TEXT NOT NULL,
    step_index INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    started_at TEXT NOT NULL,
    completed_at TEXT,
    input TEXT,
    output TEXT,
    reasoning TEXT,
    config TEXT,
    input_count INTEGER,
    output_count INTEGER,
    duration_ms INTEGER,
    error_message TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    capture_all_candidates INTEGER NOT NULL DEFAULT 0,
    UNIQUE (run_id, step_index),
    CHECK (input_count IS NULL OR output_count IS NULL OR output_count <= input_count),
    CHECK (duration_ms IS NULL OR duration_ms >= 0)
);

CREATE TABLE IF NOT EXISTS trace_candidates (
    id TEXT PRIMARY KEY,
    step_id TEXT NOT NULL REFERENCES trace_steps(id) ON DELETE CASCADE,
    candidate_key TEXT NOT NULL,
    status TEXT NOT NULL,
    score REAL,
    reason TEXT,
    data TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    UNIQUE (step_id, candidate_key)
);

CREATE TABLE IF NOT EXISTS trace_filters (
    id TEXT PRIMARY KEY,
    step_id TEXT NOT NULL REFERENCES trace_steps(id) ON DELETE CASCADE,
    filter_type TEXT NOT NULL,
    config TEXT NOT NULL DEFAULT '{}',
    candidates_affected INTEGER NOT NULL,
    candidates_rejected INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    CHECK (candidates_rejected <= candidates_affected)
);

CREATE INDEX IF NOT EXISTS idx_trace_runs_pipeline ON trace_runs(pipeline_name);
CREATE INDEX IF NOT EXISTS idx_trace_runs_status ON trace_runs(status);
CREATE INDEX IF NOT EXISTS idx_trace_runs_started ON trace_runs(started_at);
CREATE INDEX IF NOT EXISTS idx_trace_steps_type ON trace_steps(step_type);
CREATE INDEX IF NOT EXISTS idx_trace_steps_run_type ON trace_steps(run_id, step_type);
CREATE INDEX IF NOT EXISTS idx_trace_steps_started ON trace_steps(started_at);
CREATE INDEX IF NOT EXISTS idx_trace_candidates_step_status ON trace_candidates(step_id, status);
CREATE INDEX IF NOT EXISTS idx_trace_filters_step ON trace_filters(step_id)
"#;

const RUN_COLUMNS: &str = "id, pipeline_name, pipeline_version, status, started_at, completed_at, \
     input, output, error_message, metadata";

const STEP_COLUMNS: &str = "id, run_id, step_type, step_index, status, started_at, completed_at, \
     input, output, reasoning, config, input_count, output_count, duration_ms, error_message, \
     metadata, capture_all_candidates";

const CANDIDATE_COLUMNS: &str =
    "id, step_id, candidate_key, status, score, reason, data, metadata";

const FILTER_COLUMNS: &str =
    "id, step_id, filter_type, config, candidates_affected, candidates_rejected, metadata";

/// SQLite-based evidence store.
///
/// Foreign keys must be enabled on the pool's connections (the sqlx
/// default) for run deletion to cascade to steps and their evidence.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run database migrations to create required tables.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .map_err(StoreError::backend)?;
            }
        }
        Ok(())
    }

    /// Delete a run together with its steps, candidates and filters.
    ///
    /// Returns false if no such run existed.
    pub async fn delete_run(&self, id: &RunId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM trace_runs WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        self.pool.begin().await.map_err(StoreError::backend)
    }

    async fn fetch_step_detail(&self, step: Step) -> Result<StepDetail, StoreError> {
        let candidates = sqlx::query(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM trace_candidates WHERE step_id = ? ORDER BY rowid"
        ))
        .bind(step.id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?
        .iter()
        .map(candidate_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        let filters = sqlx::query(&format!(
            "SELECT {FILTER_COLUMNS} FROM trace_filters WHERE step_id = ? ORDER BY rowid"
        ))
        .bind(step.id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?
        .iter()
        .map(filter_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        Ok(StepDetail {
            step,
            candidates,
            filters,
        })
    }
}

#[async_trait]
impl EvidenceStore for SqliteStore {
    async fn create_run(&self, run: NewRun) -> Result<Run, StoreError> {
        let record = Run {
            id: RunId::generate(),
            pipeline_name: run.pipeline_name,
            pipeline_version: run.pipeline_version,
            status: RunStatus::Running,
            started_at: stored_now(),
            completed_at: None,
            input: run.input,
            output: None,
            error: None,
            metadata: run.metadata,
        };

        sqlx::query(
            "INSERT INTO trace_runs (id, pipeline_name, pipeline_version, status, started_at, input, metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.as_str())
        .bind(&record.pipeline_name)
        .bind(record.pipeline_version.as_deref())
        .bind(record.status.as_str())
        .bind(timestamp(&record.started_at))
        .bind(to_json(&record.input)?)
        .bind(to_json(&record.metadata)?)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(record)
    }

    async fn update_run(&self, id: &RunId, update: RunUpdate) -> Result<Run, StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM trace_runs WHERE id = ?"))
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::backend)?
            .ok_or_else(|| StoreError::not_found("run", id))?;
        let mut run = run_from_row(&row)?;
        run.apply(update)?;
        run.completed_at = run.completed_at.map(|at| at.trunc_subsecs(6));

        sqlx::query(
            "UPDATE trace_runs SET status = ?, completed_at = ?, output = ?, error_message = ? WHERE id = ?",
        )
        .bind(run.status.as_str())
        .bind(run.completed_at.as_ref().map(timestamp))
        .bind(run.output.as_ref().map(to_json).transpose()?)
        .bind(run.error.as_deref())
        .bind(id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(StoreError::backend)?;

        tx.commit().await.map_err(StoreError::backend)?;
        Ok(run)
    }

    async fn create_step(&self, step: NewStep) -> Result<Step, StoreError> {
        let mut tx = self.begin().await?;

        let run_exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM trace_runs WHERE id = ?")
            .bind(step.run_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::backend)?;
        if run_exists.is_none() {
            return Err(StoreError::not_found("run", &step.run_id));
        }

        let taken: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM trace_steps WHERE run_id = ? AND step_index = ?")
                .bind(step.run_id.as_str())
                .bind(to_sql(step.step_index, "step_index")?)
                .fetch_optional(&mut *tx)
                .await
                .map_err(StoreError::backend)?;
        if taken.is_some() {
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
            started_at: stored_now(),
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

        sqlx::query(
            "INSERT INTO trace_steps (id, run_id, step_type, step_index, status, started_at, input, \
             reasoning, config, metadata, capture_all_candidates) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.as_str())
        .bind(record.run_id.as_str())
        .bind(record.step_type.as_str())
        .bind(to_sql(record.step_index, "step_index")?)
        .bind(record.status.as_str())
        .bind(timestamp(&record.started_at))
        .bind(record.input.as_ref().map(to_json).transpose()?)
        .bind(record.reasoning.as_deref())
        .bind(record.config.as_ref().map(to_json).transpose()?)
        .bind(to_json(&record.metadata)?)
        .bind(record.capture_all_candidates)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::backend)?;

        tx.commit().await.map_err(StoreError::backend)?;
        Ok(record)
    }

    async fn update_step(&self, id: &StepId, update: StepUpdate) -> Result<Step, StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(&format!("SELECT {STEP_COLUMNS} FROM trace_steps WHERE id = ?"))
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::backend)?
            .ok_or_else(|| StoreError::not_found("step", id))?;
        let mut step = step_from_row(&row)?;
        step.apply(update)?;
        step.completed_at = step.completed_at.map(|at| at.trunc_subsecs(6));

        sqlx::query(
            "UPDATE trace_steps SET status = ?, completed_at = ?, duration_ms = ?, output = ?, \
             error_message = ?, reasoning = ?, input_count = ?, output_count = ? WHERE id = ?",
        )
        .bind(step.status.as_str())
        .bind(step.completed_at.as_ref().map(timestamp))
        .bind(step.duration_ms)
        .bind(step.output.as_ref().map(to_json).transpose()?)
        .bind(step.error.as_deref())
        .bind(step.reasoning.as_deref())
        .bind(step.input_count.map(|c| to_sql(c, "input_count")).transpose()?)
        .bind(step.output_count.map(|c| to_sql(c, "output_count")).transpose()?)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(StoreError::backend)?;

        tx.commit().await.map_err(StoreError::backend)?;
        Ok(step)
    }

    async fn create_candidates_bulk(
        &self,
        step_id: &StepId,
        candidates: Vec<Candidate>,
    ) -> Result<Vec<Candidate>, StoreError> {
        check_candidate_batch(step_id, &candidates)?;
        let mut tx = self.begin().await?;

        let step_exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM trace_steps WHERE id = ?")
            .bind(step_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::backend)?;
        if step_exists.is_none() {
            return Err(StoreError::not_found("step", step_id));
        }

        for candidate in &candidates {
            sqlx::query(
                "INSERT INTO trace_candidates (id, step_id, candidate_key, status, score, reason, data, metadata) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(candidate.id.as_str())
            .bind(step_id.as_str())
            .bind(&candidate.candidate_key)
            .bind(candidate.status.as_str())
            .bind(candidate.score)
            .bind(candidate.reason.as_deref())
            .bind(to_json(&candidate.data)?)
            .bind(to_json(&candidate.metadata)?)
            .execute(&mut *tx)
            .await
            .map_err(|err| {
                if matches!(&err, sqlx::Error::Database(db) if db.is_unique_violation()) {
                    duplicate_candidate(step_id, &candidate.candidate_key)
                } else {
                    StoreError::backend(err)
                }
            })?;
        }

        tx.commit().await.map_err(StoreError::backend)?;
        Ok(candidates)
    }

    async fn create_filter(
        &self,
        step_id: &StepId,
        filter: NewFilter,
    ) -> Result<Filter, StoreError> {
        filter.validate()?;

        let step_exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM trace_steps WHERE id = ?")
            .bind(step_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        if step_exists.is_none() {
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

        sqlx::query(
            "INSERT INTO trace_filters (id, step_id, filter_type, config, candidates_affected, \
             candidates_rejected, metadata) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.as_str())
        .bind(step_id.as_str())
        .bind(&record.filter_type)
        .bind(to_json(&record.config)?)
        .bind(to_sql(record.candidates_affected, "candidates_affected")?)
        .bind(to_sql(record.candidates_rejected, "candidates_rejected")?)
        .bind(to_json(&record.metadata)?)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(record)
    }

    async fn get_run(&self, id: &RunId) -> Result<RunDetail, StoreError> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM trace_runs WHERE id = ?"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::backend)?
            .ok_or_else(|| StoreError::not_found("run", id))?;
        let run = run_from_row(&row)?;

        let step_rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM trace_steps WHERE run_id = ? ORDER BY step_index"
        ))
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        let mut steps = Vec::with_capacity(step_rows.len());
        for row in &step_rows {
            steps.push(self.fetch_step_detail(step_from_row(row)?).await?);
        }

        Ok(RunDetail { run, steps })
    }

    async fn list_runs(&self, query: RunQuery) -> Result<Vec<Run>, StoreError> {
        let status = query.status.map(|s| s.as_str());
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM trace_runs \
             WHERE (? IS NULL OR pipeline_name = ?) AND (? IS NULL OR status = ?) \
             ORDER BY started_at DESC, id LIMIT ? OFFSET ?"
        ))
        .bind(query.pipeline_name.as_deref())
        .bind(query.pipeline_name.as_deref())
        .bind(status)
        .bind(status)
        .bind(sql_limit(query.limit)?)
        .bind(to_sql(query.offset.unwrap_or(0), "offset")?)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        rows.iter().map(run_from_row).collect()
    }

    async fn get_step(&self, id: &StepId) -> Result<StepDetail, StoreError> {
        let row = sqlx::query(&format!("SELECT {STEP_COLUMNS} FROM trace_steps WHERE id = ?"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::backend)?
            .ok_or_else(|| StoreError::not_found("step", id))?;
        self.fetch_step_detail(step_from_row(&row)?).await
    }

    async fn list_candidates(
        &self,
        step_id: &StepId,
        status: Option<CandidateStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Candidate>, StoreError> {
        let status = status.map(|s| s.as_str());
        let rows = sqlx::query(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM trace_candidates \
             WHERE step_id = ? AND (? IS NULL OR status = ?) \
             ORDER BY score IS NULL, score DESC, rowid LIMIT ?"
        ))
        .bind(step_id.as_str())
        .bind(status)
        .bind(status)
        .bind(sql_limit(limit)?)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        rows.iter().map(candidate_from_row).collect()
    }

    async fn query_high_elimination(
        &self,
        query: &EliminationQuery,
    ) -> Result<Vec<Step>, StoreError> {
        query.validate()?;
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM trace_steps \
             WHERE step_type = ? AND input_count > 0 AND output_count IS NOT NULL \
             AND CAST(output_count AS REAL) / input_count < ? \
             ORDER BY started_at DESC, step_index DESC, id LIMIT ?"
        ))
        .bind(query.step_type.as_str())
        .bind(query.threshold)
        .bind(sql_limit(query.limit)?)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        rows.iter().map(step_from_row).collect()
    }

    async fn query_by_type(&self, query: &TypeQuery) -> Result<Vec<Step>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM trace_steps WHERE step_type = ? \
             ORDER BY started_at DESC, step_index DESC, id LIMIT ? OFFSET ?"
        ))
        .bind(query.step_type.as_str())
        .bind(sql_limit(query.limit)?)
        .bind(to_sql(query.offset.unwrap_or(0), "offset")?)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        rows.iter().map(step_from_row).collect()
    }
}

/// Current time at the precision the store keeps.
fn stored_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(StoreError::backend)
}

/// SQLite treats a negative LIMIT as no limit.
fn sql_limit(limit: Option<usize>) -> Result<i64, StoreError> {
    Ok(limit.map(|l| to_sql(l, "limit")).transpose()?.unwrap_or(-1))
}

fn to_sql<T>(value: T, column: &str) -> Result<i64, StoreError>
where
    T: TryInto<i64> + Copy + std::fmt::Display,
{
    value.try_into().map_err(|_| {
        StoreError::InvalidRecord(format!("{column} value {value} does not fit in INTEGER"))
    })
}

fn from_sql<T: TryFrom<i64>>(value: i64, column: &str) -> Result<T, StoreError> {
    T::try_from(value).map_err(|_| corrupt(column, &value.to_string()))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(StoreError::backend)
}

fn from_json<T: DeserializeOwned>(value: &str) -> Result<T, StoreError> {
    serde_json::from_str(value).map_err(StoreError::backend)
}

fn get<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(column).map_err(StoreError::backend)
}

fn get_json<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<Option<T>, StoreError> {
    get::<Option<String>>(row, column)?
        .map(|raw| from_json(&raw))
        .transpose()
}

fn corrupt(column: &str, value: &str) -> StoreError {
    StoreError::backend(anyhow::anyhow!("unexpected {column} value '{value}'"))
}

fn run_from_row(row: &SqliteRow) -> Result<Run, StoreError> {
    let status: String = get(row, "status")?;
    let started_at: String = get(row, "started_at")?;
    let completed_at: Option<String> = get(row, "completed_at")?;
    Ok(Run {
        id: RunId(get(row, "id")?),
        pipeline_name: get(row, "pipeline_name")?,
        pipeline_version: get(row, "pipeline_version")?,
        status: RunStatus::parse(&status).ok_or_else(|| corrupt("status", &status))?,
        started_at: parse_timestamp(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
        input: get_json(row, "input")?.unwrap_or_default(),
        output: get_json(row, "output")?,
        error: get(row, "error_message")?,
        metadata: get_json(row, "metadata")?.unwrap_or_default(),
    })
}

fn step_from_row(row: &SqliteRow) -> Result<Step, StoreError> {
    let status: String = get(row, "status")?;
    let started_at: String = get(row, "started_at")?;
    let completed_at: Option<String> = get(row, "completed_at")?;
    let step_index: i64 = get(row, "step_index")?;
    let input_count: Option<i64> = get(row, "input_count")?;
    let output_count: Option<i64> = get(row, "output_count")?;
    Ok(Step {
        id: StepId(get(row, "id")?),
        run_id: RunId(get(row, "run_id")?),
        step_type: StepType(get(row, "step_type")?),
        step_index: from_sql(step_index, "step_index")?,
        status: StepStatus::parse(&status).ok_or_else(|| corrupt("status", &status))?,
        started_at: parse_timestamp(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
        input: get_json(row, "input")?,
        output: get_json(row, "output")?,
        reasoning: get(row, "reasoning")?,
        config: get_json(row, "config")?,
        input_count: input_count.map(|c| from_sql(c, "input_count")).transpose()?,
        output_count: output_count.map(|c| from_sql(c, "output_count")).transpose()?,
        duration_ms: get(row, "duration_ms")?,
        error: get(row, "error_message")?,
        metadata: get_json(row, "metadata")?.unwrap_or_default(),
        capture_all_candidates: get(row, "capture_all_candidates")?,
    })
}

fn candidate_from_row(row: &SqliteRow) -> Result<Candidate, StoreError> {
    let status: String = get(row, "status")?;
    Ok(Candidate {
        id: CandidateId(get(row, "id")?),
        step_id: StepId(get(row, "step_id")?),
        candidate_key: get(row, "candidate_key")?,
        status: CandidateStatus::parse(&status).ok_or_else(|| corrupt("status", &status))?,
        score: get(row, "score")?,
        reason: get(row, "reason")?,
        data: get_json(row, "data")?.unwrap_or_default(),
        metadata: get_json(row, "metadata")?.unwrap_or_default(),
    })
}

fn filter_from_row(row: &SqliteRow) -> Result<Filter, StoreError> {
    let affected: i64 = get(row, "candidates_affected")?;
    let rejected: i64 = get(row, "candidates_rejected")?;
    Ok(Filter {
        id: FilterId(get(row, "id")?),
        step_id: StepId(get(row, "step_id")?),
        filter_type: get(row, "filter_type")?,
        config: get_json(row, "config")?.unwrap_or_default(),
        candidates_affected: from_sql(affected, "candidates_affected")?,
        candidates_rejected: from_sql(rejected, "candidates_rejected")?,
        metadata: get_json(row, "metadata")?.unwrap_or_default(),
    })
}
