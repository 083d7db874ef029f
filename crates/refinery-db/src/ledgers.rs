//! Database operations for the `ingest_nonces` and `processed_post_ids` ledgers.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refinery_core::{NonceLedger, ProcessedPostLedger, StoreError};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, PgStore};

// ---------------------------------------------------------------------------
// ingest_nonces
// ---------------------------------------------------------------------------

/// Records a nonce. Returns `false` when the nonce was already present.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the insert fails.
pub async fn insert_nonce(
    pool: &PgPool,
    nonce: &str,
    seen_at: DateTime<Utc>,
) -> Result<bool, DbError> {
    let inserted = sqlx::query_scalar::<_, String>(
        "INSERT INTO ingest_nonces (nonce, created_at) VALUES ($1, $2) \
         ON CONFLICT (nonce) DO NOTHING \
         RETURNING nonce",
    )
    .bind(nonce)
    .bind(seen_at)
    .fetch_optional(pool)
    .await?;

    Ok(inserted.is_some())
}

/// Deletes nonces recorded before `older_than` and returns how many went.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the delete fails.
pub async fn delete_nonces_before(pool: &PgPool, older_than: DateTime<Utc>) -> Result<u64, DbError> {
    let result = sqlx::query("DELETE FROM ingest_nonces WHERE created_at < $1")
        .bind(older_than)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// processed_post_ids
// ---------------------------------------------------------------------------

/// Returns the subset of `post_ids` already in the ledger.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn select_processed_post_ids(
    pool: &PgPool,
    post_ids: &[String],
) -> Result<Vec<String>, DbError> {
    if post_ids.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query_scalar::<_, String>(
        "SELECT post_id FROM processed_post_ids WHERE post_id = ANY($1)",
    )
    .bind(post_ids)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Adds `post_ids` to the ledger in one round-trip. Ids already present keep
/// their original owning capture.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the insert fails.
pub async fn insert_processed_post_ids(
    pool: &PgPool,
    capture_id: Uuid,
    post_ids: &[String],
) -> Result<(), DbError> {
    if post_ids.is_empty() {
        return Ok(());
    }

    sqlx::query(
        "INSERT INTO processed_post_ids (post_id, capture_id) \
         SELECT post_id, $2 FROM UNNEST($1::text[]) AS t(post_id) \
         ON CONFLICT (post_id) DO NOTHING",
    )
    .bind(post_ids)
    .bind(capture_id)
    .execute(pool)
    .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[async_trait]
impl NonceLedger for PgStore {
    async fn record_nonce(&self, nonce: &str, seen_at: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(insert_nonce(self.pool(), nonce, seen_at).await?)
    }

    async fn prune_nonces(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(delete_nonces_before(self.pool(), older_than).await?)
    }
}

#[async_trait]
impl ProcessedPostLedger for PgStore {
    async fn filter_processed_post_ids(
        &self,
        post_ids: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        let seen = select_processed_post_ids(self.pool(), post_ids).await?;
        Ok(seen.into_iter().collect())
    }

    async fn mark_posts_processed(
        &self,
        capture_id: Uuid,
        post_ids: &[String],
    ) -> Result<(), StoreError> {
        insert_processed_post_ids(self.pool(), capture_id, post_ids).await?;
        Ok(())
    }
}
