//! Database operations for `pipeline_runs`.
//!
//! The single-running guard is the `uq_pipeline_runs_single_running` partial
//! unique index: a second `running` insert fails with a unique violation,
//! which surfaces as [`DbError::RunAlreadyRunning`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refinery_core::{PipelineRun, PipelineRunRepo, RunStatus, StoreError};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{is_unique_violation, to_i32, to_u32, DbError, PgStore};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PipelineRunRow {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: String,
    pub trigger_source: String,
    pub captures_processed: i32,
    pub scrubber_stats: serde_json::Value,
    pub pattern_matcher_stats: serde_json::Value,
    pub strategist_stats: serde_json::Value,
    pub total_tokens_used: i64,
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<PipelineRunRow> for PipelineRun {
    type Error = DbError;

    fn try_from(row: PipelineRunRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let stats_err =
            |what: &str, e: serde_json::Error| DbError::Malformed(format!("run {id} {what}: {e}"));

        Ok(PipelineRun {
            id,
            started_at: row.started_at,
            completed_at: row.completed_at,
            status: row
                .status
                .parse::<RunStatus>()
                .map_err(|e| DbError::Malformed(e.to_string()))?,
            trigger_source: row.trigger_source,
            captures_processed: to_u32("captures_processed", row.captures_processed)?,
            scrubber: serde_json::from_value(row.scrubber_stats)
                .map_err(|e| stats_err("scrubber_stats", e))?,
            pattern_matcher: serde_json::from_value(row.pattern_matcher_stats)
                .map_err(|e| stats_err("pattern_matcher_stats", e))?,
            strategist: serde_json::from_value(row.strategist_stats)
                .map_err(|e| stats_err("strategist_stats", e))?,
            total_tokens_used: u64::try_from(row.total_tokens_used).map_err(|_| {
                DbError::Malformed(format!("run {id} total_tokens_used is negative"))
            })?,
            errors: row.errors,
        })
    }
}

const RUN_COLUMNS: &str = "id, started_at, completed_at, status, trigger_source, \
                           captures_processed, scrubber_stats, pattern_matcher_stats, \
                           strategist_stats, total_tokens_used, errors, created_at";

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Inserts `run` in `running` status.
///
/// # Errors
///
/// Returns [`DbError::RunAlreadyRunning`] when another run is running, or
/// [`DbError::Sqlx`] if the insert fails for another reason.
pub async fn insert_running_pipeline_run(pool: &PgPool, run: &PipelineRun) -> Result<(), DbError> {
    let result = sqlx::query(
        "INSERT INTO pipeline_runs (id, started_at, status, trigger_source) \
         VALUES ($1, $2, 'running', $3)",
    )
    .bind(run.id)
    .bind(run.started_at)
    .bind(&run.trigger_source)
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(DbError::RunAlreadyRunning),
        Err(e) => Err(DbError::Sqlx(e)),
    }
}

/// Writes the terminal state of a running run.
///
/// # Errors
///
/// Returns [`DbError::InvalidRunTransition`] if the run is not `running`, or
/// [`DbError::Sqlx`] if the update fails.
pub async fn finalize_pipeline_run(pool: &PgPool, run: &PipelineRun) -> Result<(), DbError> {
    let total_tokens = i64::try_from(run.total_tokens_used)
        .map_err(|_| DbError::Malformed(format!("run {} token count overflows", run.id)))?;

    let result = sqlx::query(
        "UPDATE pipeline_runs \
         SET status = $1, completed_at = $2, captures_processed = $3, \
             scrubber_stats = $4, pattern_matcher_stats = $5, strategist_stats = $6, \
             total_tokens_used = $7, errors = $8 \
         WHERE id = $9 AND status = 'running'",
    )
    .bind(run.status.as_str())
    .bind(run.completed_at)
    .bind(to_i32("captures_processed", run.captures_processed)?)
    .bind(serde_json::to_value(run.scrubber)?)
    .bind(serde_json::to_value(run.pattern_matcher)?)
    .bind(serde_json::to_value(run.strategist)?)
    .bind(total_tokens)
    .bind(&run.errors)
    .bind(run.id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::InvalidRunTransition { id: run.id });
    }

    Ok(())
}

/// Fails `running` runs started before `started_before`, freeing the
/// single-running slot a crashed or unfinalized run still holds.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the update fails.
pub async fn fail_stale_pipeline_runs(
    pool: &PgPool,
    started_before: DateTime<Utc>,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<u64, DbError> {
    let result = sqlx::query(
        "UPDATE pipeline_runs \
         SET status = 'failed', completed_at = $1, errors = array_append(errors, $2) \
         WHERE status = 'running' AND started_at < $3",
    )
    .bind(now)
    .bind(reason)
    .bind(started_before)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn get_pipeline_run(pool: &PgPool, id: Uuid) -> Result<Option<PipelineRunRow>, DbError> {
    let row = sqlx::query_as::<_, PipelineRunRow>(&format!(
        "SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Returns the most recent `limit` runs, newest first.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_pipeline_runs(pool: &PgPool, limit: i64) -> Result<Vec<PipelineRunRow>, DbError> {
    let rows = sqlx::query_as::<_, PipelineRunRow>(&format!(
        "SELECT {RUN_COLUMNS} FROM pipeline_runs \
         ORDER BY started_at DESC, created_at DESC \
         LIMIT $1"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[async_trait]
impl PipelineRunRepo for PgStore {
    async fn start_pipeline_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        insert_running_pipeline_run(self.pool(), run).await?;
        Ok(())
    }

    async fn finalize_pipeline_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        finalize_pipeline_run(self.pool(), run).await?;
        Ok(())
    }

    async fn fail_stale_pipeline_runs(
        &self,
        started_before: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        Ok(fail_stale_pipeline_runs(self.pool(), started_before, reason, now).await?)
    }

    async fn get_pipeline_run(&self, id: Uuid) -> Result<Option<PipelineRun>, StoreError> {
        let row = get_pipeline_run(self.pool(), id).await?;
        Ok(row.map(PipelineRun::try_from).transpose()?)
    }

    async fn list_pipeline_runs(&self, limit: i64) -> Result<Vec<PipelineRun>, StoreError> {
        let rows = list_pipeline_runs(self.pool(), limit).await?;
        let runs = rows
            .into_iter()
            .map(PipelineRun::try_from)
            .collect::<Result<Vec<_>, DbError>>()?;
        Ok(runs)
    }
}
