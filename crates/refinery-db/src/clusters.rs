//! Database operations for `pattern_clusters`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refinery_core::{ClusterRepo, Direction, PatternCluster, StoreError};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{to_i32, to_u32, DbError, PgStore};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PatternClusterRow {
    pub id: i64,
    pub cluster_id: Uuid,
    pub identity_key: String,
    pub entities: Vec<String>,
    pub momentum_score: f64,
    pub momentum_delta: f64,
    pub direction: String,
    pub evidence_post_ids: Vec<String>,
    pub friction_density: f64,
    pub first_seen: DateTime<Utc>,
    pub window_hours: i32,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<PatternClusterRow> for PatternCluster {
    type Error = DbError;

    fn try_from(row: PatternClusterRow) -> Result<Self, Self::Error> {
        Ok(PatternCluster {
            cluster_id: row.cluster_id,
            entities: row.entities,
            momentum_score: row.momentum_score,
            momentum_delta: row.momentum_delta,
            direction: row
                .direction
                .parse::<Direction>()
                .map_err(|e| DbError::Malformed(e.to_string()))?,
            evidence_post_ids: row.evidence_post_ids,
            friction_density: row.friction_density,
            first_seen: row.first_seen,
            window_hours: to_u32("window_hours", row.window_hours)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Inserts every cluster inside one transaction; either all rows land or none.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if any insert or the commit fails.
pub async fn insert_pattern_clusters(
    pool: &PgPool,
    clusters: &[PatternCluster],
) -> Result<(), DbError> {
    if clusters.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await?;

    for cluster in clusters {
        sqlx::query(
            "INSERT INTO pattern_clusters \
                 (cluster_id, identity_key, entities, momentum_score, momentum_delta, \
                  direction, evidence_post_ids, friction_density, first_seen, window_hours) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(cluster.cluster_id)
        .bind(cluster.identity_key())
        .bind(&cluster.entities)
        .bind(cluster.momentum_score)
        .bind(cluster.momentum_delta)
        .bind(cluster.direction.as_str())
        .bind(&cluster.evidence_post_ids)
        .bind(cluster.friction_density)
        .bind(cluster.first_seen)
        .bind(to_i32("window_hours", cluster.window_hours)?)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Returns the most recent `limit` clusters, newest first.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_recent_pattern_clusters(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<PatternClusterRow>, DbError> {
    let rows = sqlx::query_as::<_, PatternClusterRow>(
        "SELECT id, cluster_id, identity_key, entities, momentum_score, momentum_delta, \
                direction, evidence_post_ids, friction_density, first_seen, window_hours, created_at \
         FROM pattern_clusters \
         ORDER BY created_at DESC, id DESC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[async_trait]
impl ClusterRepo for PgStore {
    async fn insert_clusters(&self, clusters: &[PatternCluster]) -> Result<(), StoreError> {
        insert_pattern_clusters(self.pool(), clusters).await?;
        Ok(())
    }

    async fn list_recent_clusters(&self, limit: i64) -> Result<Vec<PatternCluster>, StoreError> {
        let rows = list_recent_pattern_clusters(self.pool(), limit).await?;
        let clusters = rows
            .into_iter()
            .map(PatternCluster::try_from)
            .collect::<Result<Vec<_>, DbError>>()?;
        Ok(clusters)
    }
}
