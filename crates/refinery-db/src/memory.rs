//! Process-local store used for development and tests.
//!
//! One mutex guards all state, so every repository call is atomic with
//! respect to every other, including the single-running-run check.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use refinery_core::{
    AlphaCard, AlphaCardRepo, CaptureInsert, CaptureRecord, CaptureRepo, CaptureStatus, CardQuery,
    CardStatus, ClusterRepo, NonceLedger, PatternCluster, PipelineRun, PipelineRunRepo,
    ProcessedPostLedger, RawCapture, RunStatus, ScrubberOutput, ScrubberOutputRepo, StoreError,
};
use uuid::Uuid;

#[derive(Debug, Default)]
struct State {
    captures: Vec<CaptureRecord>,
    outputs: Vec<ScrubberOutput>,
    /// Insertion order; newest last.
    clusters: Vec<PatternCluster>,
    cards: Vec<AlphaCard>,
    runs: Vec<PipelineRun>,
    nonces: HashMap<String, DateTime<Utc>>,
    processed_posts: HashMap<String, Uuid>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // State is only mutated by whole-value pushes and field writes, so a
        // poisoned guard still holds consistent data.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Overrides the stored ingest time of a capture.
    pub fn backdate_capture(&self, capture_id: Uuid, created_at: DateTime<Utc>) {
        let mut state = self.lock();
        if let Some(record) = state
            .captures
            .iter_mut()
            .find(|r| r.capture.capture_id == capture_id)
        {
            record.created_at = created_at;
        }
    }

    #[must_use]
    pub fn capture_count(&self) -> usize {
        self.lock().captures.len()
    }
}

#[async_trait]
impl CaptureRepo for MemoryStore {
    async fn insert_capture(&self, capture: &RawCapture) -> Result<CaptureInsert, StoreError> {
        let mut state = self.lock();
        if state
            .captures
            .iter()
            .any(|r| r.capture.capture_id == capture.capture_id)
        {
            return Ok(CaptureInsert::AlreadyExists);
        }
        state.captures.push(CaptureRecord {
            capture: capture.clone(),
            status: CaptureStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
        });
        Ok(CaptureInsert::Inserted)
    }

    async fn get_capture(&self, capture_id: Uuid) -> Result<Option<CaptureRecord>, StoreError> {
        Ok(self
            .lock()
            .captures
            .iter()
            .find(|r| r.capture.capture_id == capture_id)
            .cloned())
    }

    async fn list_pending_captures(&self, limit: i64) -> Result<Vec<CaptureRecord>, StoreError> {
        let mut pending: Vec<CaptureRecord> = self
            .lock()
            .captures
            .iter()
            .filter(|r| r.status == CaptureStatus::Pending)
            .cloned()
            .collect();
        // Stable sort keeps insertion order among equal timestamps.
        pending.sort_by_key(|r| r.created_at);
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }

    async fn set_capture_status(
        &self,
        capture_id: Uuid,
        status: CaptureStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        let record = state
            .captures
            .iter_mut()
            .find(|r| r.capture.capture_id == capture_id)
            .ok_or_else(|| StoreError::NotFound(format!("capture {capture_id}")))?;
        record.status = status;
        record.error_message = error_message.map(str::to_string);
        Ok(())
    }

    async fn latest_ingest_at(
        &self,
        source_feed: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .lock()
            .captures
            .iter()
            .filter(|r| r.capture.source_feed == source_feed)
            .map(|r| r.created_at)
            .max())
    }
}

#[async_trait]
impl ScrubberOutputRepo for MemoryStore {
    async fn insert_scrubber_output(&self, output: &ScrubberOutput) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state
            .outputs
            .iter()
            .any(|o| o.capture_id == output.capture_id)
        {
            return Err(StoreError::Backend(
                format!("scrubber output for capture {} already exists", output.capture_id).into(),
            ));
        }
        state.outputs.push(output.clone());
        Ok(())
    }

    async fn list_scrubber_outputs_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ScrubberOutput>, StoreError> {
        let mut outputs: Vec<ScrubberOutput> = self
            .lock()
            .outputs
            .iter()
            .filter(|o| o.processed_at >= since)
            .cloned()
            .collect();
        outputs.sort_by_key(|o| o.processed_at);
        Ok(outputs)
    }
}

#[async_trait]
impl ClusterRepo for MemoryStore {
    async fn insert_clusters(&self, clusters: &[PatternCluster]) -> Result<(), StoreError> {
        self.lock().clusters.extend_from_slice(clusters);
        Ok(())
    }

    async fn list_recent_clusters(&self, limit: i64) -> Result<Vec<PatternCluster>, StoreError> {
        Ok(self
            .lock()
            .clusters
            .iter()
            .rev()
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AlphaCardRepo for MemoryStore {
    async fn insert_alpha_card(&self, card: &AlphaCard) -> Result<(), StoreError> {
        let mut state = self.lock();
        if !state.clusters.iter().any(|c| c.cluster_id == card.cluster_id) {
            return Err(StoreError::NotFound(format!("cluster {}", card.cluster_id)));
        }
        state.cards.push(card.clone());
        Ok(())
    }

    async fn get_alpha_card(&self, id: Uuid) -> Result<Option<AlphaCard>, StoreError> {
        Ok(self.lock().cards.iter().find(|c| c.id == id).cloned())
    }

    async fn list_alpha_cards(&self, query: &CardQuery) -> Result<Vec<AlphaCard>, StoreError> {
        let mut cards: Vec<AlphaCard> = self
            .lock()
            .cards
            .iter()
            .filter(|c| c.status == query.status)
            .filter(|c| query.category.is_none_or(|cat| c.category == cat))
            .filter(|c| query.direction.is_none_or(|dir| c.direction == dir))
            .cloned()
            .collect();
        cards.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        cards.truncate(usize::try_from(query.limit).unwrap_or(0));
        Ok(cards)
    }

    async fn expire_alpha_cards(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut expired = 0;
        for card in &mut self.lock().cards {
            if card.status == CardStatus::Active && card.is_expired_at(now) {
                card.status = CardStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

#[async_trait]
impl PipelineRunRepo for MemoryStore {
    async fn start_pipeline_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.runs.iter().any(|r| r.status == RunStatus::Running) {
            return Err(StoreError::RunAlreadyRunning);
        }
        state.runs.push(run.clone());
        Ok(())
    }

    async fn finalize_pipeline_run(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let mut state = self.lock();
        let stored = state
            .runs
            .iter_mut()
            .find(|r| r.id == run.id && r.status == RunStatus::Running)
            .ok_or_else(|| StoreError::NotFound(format!("running pipeline run {}", run.id)))?;
        *stored = run.clone();
        Ok(())
    }

    async fn fail_stale_pipeline_runs(
        &self,
        started_before: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock();
        let mut failed = 0;
        for run in state
            .runs
            .iter_mut()
            .filter(|r| r.status == RunStatus::Running && r.started_at < started_before)
        {
            run.status = RunStatus::Failed;
            run.completed_at = Some(now);
            run.errors.push(reason.to_string());
            failed += 1;
        }
        Ok(failed)
    }

    async fn get_pipeline_run(&self, id: Uuid) -> Result<Option<PipelineRun>, StoreError> {
        Ok(self.lock().runs.iter().find(|r| r.id == id).cloned())
    }

    async fn list_pipeline_runs(&self, limit: i64) -> Result<Vec<PipelineRun>, StoreError> {
        let mut runs = self.lock().runs.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(runs)
    }
}

#[async_trait]
impl NonceLedger for MemoryStore {
    async fn record_nonce(&self, nonce: &str, seen_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if state.nonces.contains_key(nonce) {
            return Ok(false);
        }
        state.nonces.insert(nonce.to_string(), seen_at);
        Ok(true)
    }

    async fn prune_nonces(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.lock();
        let before = state.nonces.len();
        state.nonces.retain(|_, seen_at| *seen_at >= older_than);
        Ok((before - state.nonces.len()) as u64)
    }
}

#[async_trait]
impl ProcessedPostLedger for MemoryStore {
    async fn filter_processed_post_ids(
        &self,
        post_ids: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        let state = self.lock();
        Ok(post_ids
            .iter()
            .filter(|id| state.processed_posts.contains_key(id.as_str()))
            .cloned()
            .collect())
    }

    async fn mark_posts_processed(
        &self,
        capture_id: Uuid,
        post_ids: &[String],
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        for id in post_ids {
            state
                .processed_posts
                .entry(id.clone())
                .or_insert(capture_id);
        }
        Ok(())
    }
}
