//! Database operations for `alpha_cards`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refinery_core::{
    AlphaCard, AlphaCardRepo, AlphaCategory, Blueprint, CardQuery, CardStatus, Direction,
    EvidenceQuote, StoreError,
};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{to_i32, to_u32, DbError, PgStore};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AlphaCardRow {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: String,
    pub title: String,
    pub category: String,
    pub entities: Vec<String>,
    pub momentum_score: f64,
    pub direction: String,
    pub signal_count: i32,
    pub thesis: Option<String>,
    pub strategy: Option<String>,
    pub risk_factors: Option<Vec<String>>,
    pub evidence: Option<serde_json::Value>,
    pub friction_detail: Option<String>,
    pub opportunity_window: Option<String>,
    pub blueprint: Option<serde_json::Value>,
    pub cluster_id: Uuid,
}

fn malformed(id: Uuid, what: &str, reason: impl std::fmt::Display) -> DbError {
    DbError::Malformed(format!("alpha card {id} {what}: {reason}"))
}

impl TryFrom<AlphaCardRow> for AlphaCard {
    type Error = DbError;

    fn try_from(row: AlphaCardRow) -> Result<Self, Self::Error> {
        let id = row.id;

        let evidence = row
            .evidence
            .map(serde_json::from_value::<Vec<EvidenceQuote>>)
            .transpose()
            .map_err(|e| malformed(id, "evidence", e))?;
        let blueprint = row
            .blueprint
            .map(serde_json::from_value::<Blueprint>)
            .transpose()
            .map_err(|e| malformed(id, "blueprint", e))?;

        Ok(AlphaCard {
            id,
            created_at: row.created_at,
            expires_at: row.expires_at,
            status: row
                .status
                .parse::<CardStatus>()
                .map_err(|e| malformed(id, "status", e))?,
            title: row.title,
            category: row
                .category
                .parse::<AlphaCategory>()
                .map_err(|e| malformed(id, "category", e))?,
            entities: row.entities,
            momentum_score: row.momentum_score,
            direction: row
                .direction
                .parse::<Direction>()
                .map_err(|e| malformed(id, "direction", e))?,
            signal_count: to_u32("signal_count", row.signal_count)?,
            thesis: row.thesis,
            strategy: row.strategy,
            risk_factors: row.risk_factors,
            evidence,
            friction_detail: row.friction_detail,
            opportunity_window: row.opportunity_window,
            blueprint,
            cluster_id: row.cluster_id,
        })
    }
}

const CARD_COLUMNS: &str = "id, created_at, expires_at, status, title, category, entities, \
                            momentum_score, direction, signal_count, thesis, strategy, \
                            risk_factors, evidence, friction_detail, opportunity_window, \
                            blueprint, cluster_id";

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// # Errors
///
/// Returns [`DbError::Sqlx`] if the insert fails.
pub async fn insert_alpha_card(pool: &PgPool, card: &AlphaCard) -> Result<(), DbError> {
    let evidence = card
        .evidence
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;
    let blueprint = card
        .blueprint
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;

    sqlx::query(
        "INSERT INTO alpha_cards \
             (id, created_at, expires_at, status, title, category, entities, \
              momentum_score, direction, signal_count, thesis, strategy, \
              risk_factors, evidence, friction_detail, opportunity_window, \
              blueprint, cluster_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
    )
    .bind(card.id)
    .bind(card.created_at)
    .bind(card.expires_at)
    .bind(card.status.as_str())
    .bind(&card.title)
    .bind(card.category.as_str())
    .bind(&card.entities)
    .bind(card.momentum_score)
    .bind(card.direction.as_str())
    .bind(to_i32("signal_count", card.signal_count)?)
    .bind(&card.thesis)
    .bind(&card.strategy)
    .bind(&card.risk_factors)
    .bind(evidence)
    .bind(&card.friction_detail)
    .bind(&card.opportunity_window)
    .bind(blueprint)
    .bind(card.cluster_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn get_alpha_card(pool: &PgPool, id: Uuid) -> Result<Option<AlphaCardRow>, DbError> {
    let row = sqlx::query_as::<_, AlphaCardRow>(&format!(
        "SELECT {CARD_COLUMNS} FROM alpha_cards WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Returns cards matching `query`, newest first. `None` filters match any value.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_alpha_cards(pool: &PgPool, query: &CardQuery) -> Result<Vec<AlphaCardRow>, DbError> {
    let rows = sqlx::query_as::<_, AlphaCardRow>(&format!(
        "SELECT {CARD_COLUMNS} FROM alpha_cards \
         WHERE status = $1 \
           AND ($2::text IS NULL OR category = $2) \
           AND ($3::text IS NULL OR direction = $3) \
         ORDER BY created_at DESC, id DESC \
         LIMIT $4"
    ))
    .bind(query.status.as_str())
    .bind(query.category.map(AlphaCategory::as_str))
    .bind(query.direction.map(Direction::as_str))
    .bind(query.limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Moves active cards whose `expires_at` has passed to `expired`.
///
/// Returns the number of cards updated.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the update fails.
pub async fn expire_alpha_cards(pool: &PgPool, now: DateTime<Utc>) -> Result<u64, DbError> {
    let result = sqlx::query(
        "UPDATE alpha_cards SET status = 'expired' \
         WHERE status = 'active' AND expires_at <= $1",
    )
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[async_trait]
impl AlphaCardRepo for PgStore {
    async fn insert_alpha_card(&self, card: &AlphaCard) -> Result<(), StoreError> {
        insert_alpha_card(self.pool(), card).await?;
        Ok(())
    }

    async fn get_alpha_card(&self, id: Uuid) -> Result<Option<AlphaCard>, StoreError> {
        let row = get_alpha_card(self.pool(), id).await?;
        Ok(row.map(AlphaCard::try_from).transpose()?)
    }

    async fn list_alpha_cards(&self, query: &CardQuery) -> Result<Vec<AlphaCard>, StoreError> {
        let rows = list_alpha_cards(self.pool(), query).await?;
        let cards = rows
            .into_iter()
            .map(AlphaCard::try_from)
            .collect::<Result<Vec<_>, DbError>>()?;
        Ok(cards)
    }

    async fn expire_alpha_cards(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(expire_alpha_cards(self.pool(), now).await?)
    }
}
