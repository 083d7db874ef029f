//! Database operations for `scrubber_outputs`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refinery_core::{ScrubberOutput, ScrubberOutputRepo, StoreError};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{to_i32, to_u32, DbError, PgStore};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScrubberOutputRow {
    pub id: i64,
    pub capture_id: Uuid,
    pub processed_at: DateTime<Utc>,
    pub total_input: i32,
    pub total_passed: i32,
    pub entities: serde_json::Value,
    pub friction_points: serde_json::Value,
    pub notable_mentions: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ScrubberOutputRow> for ScrubberOutput {
    type Error = DbError;

    fn try_from(row: ScrubberOutputRow) -> Result<Self, Self::Error> {
        let capture_id = row.capture_id;
        let decode = |what: &str, e: serde_json::Error| {
            DbError::Malformed(format!("scrubber output {capture_id} {what}: {e}"))
        };

        Ok(ScrubberOutput {
            capture_id,
            processed_at: row.processed_at,
            total_input: to_u32("total_input", row.total_input)?,
            total_passed: to_u32("total_passed", row.total_passed)?,
            entities: serde_json::from_value(row.entities)
                .map_err(|e| decode("entities", e))?,
            friction_points: serde_json::from_value(row.friction_points)
                .map_err(|e| decode("friction_points", e))?,
            notable_mentions: serde_json::from_value(row.notable_mentions)
                .map_err(|e| decode("notable_mentions", e))?,
        })
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Inserts the extraction result for one capture.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the insert fails, including when an output
/// already exists for the capture.
pub async fn insert_scrubber_output(pool: &PgPool, output: &ScrubberOutput) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO scrubber_outputs \
             (capture_id, processed_at, total_input, total_passed, \
              entities, friction_points, notable_mentions) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(output.capture_id)
    .bind(output.processed_at)
    .bind(to_i32("total_input", output.total_input)?)
    .bind(to_i32("total_passed", output.total_passed)?)
    .bind(serde_json::to_value(&output.entities)?)
    .bind(serde_json::to_value(&output.friction_points)?)
    .bind(serde_json::to_value(&output.notable_mentions)?)
    .execute(pool)
    .await?;

    Ok(())
}

/// Outputs processed at or after `since`, oldest first.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_scrubber_outputs_since(
    pool: &PgPool,
    since: DateTime<Utc>,
) -> Result<Vec<ScrubberOutputRow>, DbError> {
    let rows = sqlx::query_as::<_, ScrubberOutputRow>(
        "SELECT id, capture_id, processed_at, total_input, total_passed, \
                entities, friction_points, notable_mentions, created_at \
         FROM scrubber_outputs \
         WHERE processed_at >= $1 \
         ORDER BY processed_at ASC, id ASC",
    )
    .bind(since)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[async_trait]
impl ScrubberOutputRepo for PgStore {
    async fn insert_scrubber_output(&self, output: &ScrubberOutput) -> Result<(), StoreError> {
        insert_scrubber_output(self.pool(), output).await?;
        Ok(())
    }

    async fn list_scrubber_outputs_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ScrubberOutput>, StoreError> {
        let rows = list_scrubber_outputs_since(self.pool(), since).await?;
        let outputs = rows
            .into_iter()
            .map(ScrubberOutput::try_from)
            .collect::<Result<Vec<_>, DbError>>()?;
        Ok(outputs)
    }
}
