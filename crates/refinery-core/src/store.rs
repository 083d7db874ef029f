//! Repository interfaces, one per persisted entity.
//!
//! The pipeline only talks to these traits, so its stages run unchanged
//! against Postgres in production and the in-memory store in tests.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::alpha::{AlphaCard, AlphaCategory, CardStatus};
use crate::capture::{CaptureRecord, CaptureStatus, RawCapture};
use crate::refinery::{Direction, PatternCluster, ScrubberOutput};
use crate::run::PipelineRun;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Another run already holds the single running slot.
    #[error("a pipeline run is already in flight")]
    RunAlreadyRunning,
    #[error("record not found: {0}")]
    NotFound(String),
    /// A stored row could not be decoded into its domain shape.
    #[error("stored record is malformed: {0}")]
    Malformed(String),
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Result of an insert keyed on `capture_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureInsert {
    Inserted,
    AlreadyExists,
}

/// Filters for listing cards at the read boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct CardQuery {
    pub limit: i64,
    pub category: Option<AlphaCategory>,
    pub direction: Option<Direction>,
    pub status: CardStatus,
}

impl Default for CardQuery {
    fn default() -> Self {
        Self {
            limit: 20,
            category: None,
            direction: None,
            status: CardStatus::Active,
        }
    }
}

#[async_trait]
pub trait CaptureRepo: Send + Sync {
    /// Inserts a capture in `pending` state unless its id is already stored.
    async fn insert_capture(&self, capture: &RawCapture) -> Result<CaptureInsert, StoreError>;

    async fn get_capture(&self, capture_id: Uuid) -> Result<Option<CaptureRecord>, StoreError>;

    /// Oldest-first pending captures.
    async fn list_pending_captures(&self, limit: i64) -> Result<Vec<CaptureRecord>, StoreError>;

    async fn set_capture_status(
        &self,
        capture_id: Uuid,
        status: CaptureStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError>;

    /// When the most recent capture from `source_feed` was ingested.
    async fn latest_ingest_at(&self, source_feed: &str)
        -> Result<Option<DateTime<Utc>>, StoreError>;
}

#[async_trait]
pub trait ScrubberOutputRepo: Send + Sync {
    async fn insert_scrubber_output(&self, output: &ScrubberOutput) -> Result<(), StoreError>;

    async fn list_scrubber_outputs_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ScrubberOutput>, StoreError>;
}

#[async_trait]
pub trait ClusterRepo: Send + Sync {
    async fn insert_clusters(&self, clusters: &[PatternCluster]) -> Result<(), StoreError>;

    /// Newest-first cluster history.
    async fn list_recent_clusters(&self, limit: i64) -> Result<Vec<PatternCluster>, StoreError>;
}

#[async_trait]
pub trait AlphaCardRepo: Send + Sync {
    async fn insert_alpha_card(&self, card: &AlphaCard) -> Result<(), StoreError>;

    async fn get_alpha_card(&self, id: Uuid) -> Result<Option<AlphaCard>, StoreError>;

    /// Newest-first cards matching `query`.
    async fn list_alpha_cards(&self, query: &CardQuery) -> Result<Vec<AlphaCard>, StoreError>;

    /// Moves every active card whose expiry is at or before `now` to `expired`.
    async fn expire_alpha_cards(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait PipelineRunRepo: Send + Sync {
    /// Records `run` as the running run.
    ///
    /// Must be atomic: returns [`StoreError::RunAlreadyRunning`] when another
    /// run is running, without a separate read-then-write window.
    async fn start_pipeline_run(&self, run: &PipelineRun) -> Result<(), StoreError>;

    /// Writes the terminal state of a run previously started.
    async fn finalize_pipeline_run(&self, run: &PipelineRun) -> Result<(), StoreError>;

    /// Marks every `running` run started before `started_before` as failed,
    /// appending `reason` to its errors. Returns the number of runs changed.
    async fn fail_stale_pipeline_runs(
        &self,
        started_before: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn get_pipeline_run(&self, id: Uuid) -> Result<Option<PipelineRun>, StoreError>;

    async fn list_pipeline_runs(&self, limit: i64) -> Result<Vec<PipelineRun>, StoreError>;
}

#[async_trait]
pub trait NonceLedger: Send + Sync {
    /// Atomically records `nonce`. Returns `false` when it was already seen.
    async fn record_nonce(&self, nonce: &str, seen_at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Deletes nonces recorded before `older_than`.
    async fn prune_nonces(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait ProcessedPostLedger: Send + Sync {
    /// The subset of `post_ids` already processed by an earlier capture.
    async fn filter_processed_post_ids(
        &self,
        post_ids: &[String],
    ) -> Result<HashSet<String>, StoreError>;

    /// Marks `post_ids` processed; ids already present are left as they are.
    async fn mark_posts_processed(
        &self,
        capture_id: Uuid,
        post_ids: &[String],
    ) -> Result<(), StoreError>;
}

/// Every repository the pipeline needs, behind one handle.
pub trait RefineryStore:
    CaptureRepo
    + ScrubberOutputRepo
    + ClusterRepo
    + AlphaCardRepo
    + PipelineRunRepo
    + NonceLedger
    + ProcessedPostLedger
{
}

impl<T> RefineryStore for T where
    T: CaptureRepo
        + ScrubberOutputRepo
        + ClusterRepo
        + AlphaCardRepo
        + PipelineRunRepo
        + NonceLedger
        + ProcessedPostLedger
{
}
