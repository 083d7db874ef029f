//! Database operations for `raw_captures`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refinery_core::{CaptureInsert, CaptureRecord, CaptureRepo, CaptureStatus, RawCapture, StoreError};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, PgStore};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A row from the `raw_captures` table. `payload` holds the full submitted
/// capture as JSON.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RawCaptureRow {
    pub id: i64,
    pub capture_id: Uuid,
    pub source_feed: String,
    pub source_type: String,
    pub captured_at: DateTime<Utc>,
    pub agent_version: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<RawCaptureRow> for CaptureRecord {
    type Error = DbError;

    fn try_from(row: RawCaptureRow) -> Result<Self, Self::Error> {
        let capture: RawCapture = serde_json::from_value(row.payload).map_err(|e| {
            DbError::Malformed(format!("capture {} payload: {e}", row.capture_id))
        })?;
        let status = row
            .status
            .parse::<CaptureStatus>()
            .map_err(|e| DbError::Malformed(e.to_string()))?;

        Ok(CaptureRecord {
            capture,
            status,
            error_message: row.error_message,
            created_at: row.created_at,
        })
    }
}

const CAPTURE_COLUMNS: &str = "id, capture_id, source_feed, source_type, captured_at, \
                               agent_version, payload, status, error_message, created_at, updated_at";

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Inserts a capture in `pending` status.
///
/// Returns `false` without writing when a row with the same `capture_id`
/// already exists; the `ON CONFLICT DO NOTHING` form keeps this atomic.
///
/// # Errors
///
/// Returns [`DbError::Json`] if the payload cannot be encoded, or
/// [`DbError::Sqlx`] if the insert fails.
pub async fn insert_raw_capture(pool: &PgPool, capture: &RawCapture) -> Result<bool, DbError> {
    let payload = serde_json::to_value(capture)?;

    let inserted = sqlx::query_scalar::<_, i64>(
        "INSERT INTO raw_captures \
             (capture_id, source_feed, source_type, captured_at, agent_version, payload, status) \
         VALUES ($1, $2, $3, $4, $5, $6, 'pending') \
         ON CONFLICT (capture_id) DO NOTHING \
         RETURNING id",
    )
    .bind(capture.capture_id)
    .bind(&capture.source_feed)
    .bind(&capture.source_type)
    .bind(capture.captured_at)
    .bind(&capture.agent_version)
    .bind(payload)
    .fetch_optional(pool)
    .await?;

    Ok(inserted.is_some())
}

/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn get_raw_capture(
    pool: &PgPool,
    capture_id: Uuid,
) -> Result<Option<RawCaptureRow>, DbError> {
    let row = sqlx::query_as::<_, RawCaptureRow>(&format!(
        "SELECT {CAPTURE_COLUMNS} FROM raw_captures WHERE capture_id = $1"
    ))
    .bind(capture_id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Returns up to `limit` pending captures, oldest first.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_pending_captures(pool: &PgPool, limit: i64) -> Result<Vec<RawCaptureRow>, DbError> {
    let rows = sqlx::query_as::<_, RawCaptureRow>(&format!(
        "SELECT {CAPTURE_COLUMNS} FROM raw_captures \
         WHERE status = 'pending' \
         ORDER BY created_at ASC, id ASC \
         LIMIT $1"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Sets the processing status and error message of a capture.
///
/// # Errors
///
/// Returns [`DbError::NotFound`] if no capture has the given id, or
/// [`DbError::Sqlx`] if the update fails.
pub async fn update_capture_status(
    pool: &PgPool,
    capture_id: Uuid,
    status: CaptureStatus,
    error_message: Option<&str>,
) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE raw_captures \
         SET status = $1, error_message = $2, updated_at = NOW() \
         WHERE capture_id = $3",
    )
    .bind(status.as_str())
    .bind(error_message)
    .bind(capture_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}

/// When the most recent capture from `source_feed` was stored.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn latest_capture_at(
    pool: &PgPool,
    source_feed: &str,
) -> Result<Option<DateTime<Utc>>, DbError> {
    let latest = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
        "SELECT MAX(created_at) FROM raw_captures WHERE source_feed = $1",
    )
    .bind(source_feed)
    .fetch_one(pool)
    .await?;

    Ok(latest)
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[async_trait]
impl CaptureRepo for PgStore {
    async fn insert_capture(&self, capture: &RawCapture) -> Result<CaptureInsert, StoreError> {
        let inserted = insert_raw_capture(self.pool(), capture).await?;
        Ok(if inserted {
            CaptureInsert::Inserted
        } else {
            CaptureInsert::AlreadyExists
        })
    }

    async fn get_capture(&self, capture_id: Uuid) -> Result<Option<CaptureRecord>, StoreError> {
        let row = get_raw_capture(self.pool(), capture_id).await?;
        Ok(row.map(CaptureRecord::try_from).transpose()?)
    }

    async fn list_pending_captures(&self, limit: i64) -> Result<Vec<CaptureRecord>, StoreError> {
        let rows = list_pending_captures(self.pool(), limit).await?;
        let records = rows
            .into_iter()
            .map(CaptureRecord::try_from)
            .collect::<Result<Vec<_>, DbError>>()?;
        Ok(records)
    }

    async fn set_capture_status(
        &self,
        capture_id: Uuid,
        status: CaptureStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        update_capture_status(self.pool(), capture_id, status, error_message).await?;
        Ok(())
    }

    async fn latest_ingest_at(
        &self,
        source_feed: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(latest_capture_at(self.pool(), source_feed).await?)
    }
}
