//! Periodic housekeeping: card expiry, nonce-ledger pruning, and failing
//! runs left `running` past [`STALE_RUN_HOURS`].

use chrono::{DateTime, Duration, Utc};
use refinery_core::{AlphaCardRepo, NonceLedger, PipelineRunRepo, StoreError};
use serde::Serialize;

/// How long a nonce is remembered. Must exceed the timestamp window so a
/// replay inside that window is always caught.
pub const NONCE_RETENTION_HOURS: i64 = 24;

/// A run still `running` this long after it started is treated as dead.
pub const STALE_RUN_HOURS: i64 = 2;

pub const STALE_RUN_REASON: &str = "run abandoned while running; failed by cleanup";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub cards_expired: u64,
    pub nonces_pruned: u64,
    pub stale_runs_failed: u64,
}

/// Marks every active card with `expires_at <= now` as expired.
///
/// # Errors
///
/// Returns [`StoreError`] if the update fails.
pub async fn expire_cards<S>(store: &S, now: DateTime<Utc>) -> Result<u64, StoreError>
where
    S: AlphaCardRepo + ?Sized,
{
    store.expire_alpha_cards(now).await
}

/// Deletes nonces recorded before `older_than`.
///
/// # Errors
///
/// Returns [`StoreError`] if the delete fails.
pub async fn prune_nonces<S>(store: &S, older_than: DateTime<Utc>) -> Result<u64, StoreError>
where
    S: NonceLedger + ?Sized,
{
    store.prune_nonces(older_than).await
}

/// Fails runs started more than [`STALE_RUN_HOURS`] before `now` that never
/// left `running`, so the single-running slot does not stay held forever.
///
/// # Errors
///
/// Returns [`StoreError`] if the update fails.
pub async fn fail_stale_runs<S>(store: &S, now: DateTime<Utc>) -> Result<u64, StoreError>
where
    S: PipelineRunRepo + ?Sized,
{
    let failed = store
        .fail_stale_pipeline_runs(now - Duration::hours(STALE_RUN_HOURS), STALE_RUN_REASON, now)
        .await?;
    if failed > 0 {
        tracing::warn!(failed, "failed stale running pipeline runs");
    }
    Ok(failed)
}

/// Runs every housekeeping task as of `now`.
///
/// # Errors
///
/// Returns the first [`StoreError`] encountered.
pub async fn run_cleanup<S>(store: &S, now: DateTime<Utc>) -> Result<CleanupReport, StoreError>
where
    S: AlphaCardRepo + NonceLedger + PipelineRunRepo + ?Sized,
{
    let cards_expired = expire_cards(store, now).await?;
    let nonces_pruned = prune_nonces(store, now - Duration::hours(NONCE_RETENTION_HOURS)).await?;
    let stale_runs_failed = fail_stale_runs(store, now).await?;

    tracing::info!(cards_expired, nonces_pruned, stale_runs_failed, "cleanup finished");

    Ok(CleanupReport {
        cards_expired,
        nonces_pruned,
        stale_runs_failed,
    })
}

#[cfg(test)]
mod tests {
    use refinery_core::{
        AlphaCard, AlphaCategory, CardQuery, CardStatus, ClusterRepo, Direction, PipelineRun,
        RunStatus,
    };
    use refinery_db::MemoryStore;
    use uuid::Uuid;

    use super::*;
    use crate::ingest::MAX_TIMESTAMP_SKEW_MS;
    use crate::test_support::cluster;

    fn card(cluster_id: Uuid, created_at: DateTime<Utc>) -> AlphaCard {
        AlphaCard {
            id: Uuid::new_v4(),
            created_at,
            expires_at: created_at + Duration::hours(72),
            status: CardStatus::Active,
            title: "Bun eats into Node tooling".to_string(),
            category: AlphaCategory::EmergingTool,
            entities: vec!["bun".to_string(), "node".to_string()],
            momentum_score: 51.0,
            direction: Direction::Rising,
            signal_count: 4,
            thesis: None,
            strategy: None,
            risk_factors: None,
            evidence: None,
            friction_detail: None,
            opportunity_window: None,
            blueprint: None,
            cluster_id,
        }
    }

    #[test]
    fn retention_outlives_the_timestamp_window() {
        assert!(Duration::hours(NONCE_RETENTION_HOURS).num_milliseconds() > MAX_TIMESTAMP_SKEW_MS);
    }

    #[tokio::test]
    async fn cleanup_expires_old_cards_and_prunes_old_nonces() {
        let store = MemoryStore::new();
        let c = cluster();
        store.insert_clusters(std::slice::from_ref(&c)).await.expect("cluster");

        let now = Utc::now();
        let stale = card(c.cluster_id, now - Duration::hours(80));
        let fresh = card(c.cluster_id, now - Duration::hours(1));
        store.insert_alpha_card(&stale).await.expect("stale");
        store.insert_alpha_card(&fresh).await.expect("fresh");

        store
            .record_nonce("old", now - Duration::hours(30))
            .await
            .expect("old nonce");
        store
            .record_nonce("recent", now - Duration::minutes(2))
            .await
            .expect("recent nonce");

        let report = run_cleanup(&store, now).await.expect("cleanup");
        assert_eq!(
            report,
            CleanupReport {
                cards_expired: 1,
                nonces_pruned: 1,
                stale_runs_failed: 0,
            }
        );

        let active = store
            .list_alpha_cards(&CardQuery::default())
            .await
            .expect("active");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, fresh.id);

        // The recent nonce is still a replay; the pruned one is free again.
        assert!(!store.record_nonce("recent", now).await.expect("recent"));
        assert!(store.record_nonce("old", now).await.expect("old"));

        let second = run_cleanup(&store, now).await.expect("cleanup again");
        assert_eq!(second.cards_expired, 0);
    }

    #[tokio::test]
    async fn cleanup_fails_only_stale_running_runs() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let stuck = PipelineRun::start("scheduler", now - Duration::hours(STALE_RUN_HOURS + 1));
        store.start_pipeline_run(&stuck).await.expect("stuck run");

        let report = run_cleanup(&store, now).await.expect("cleanup");
        assert_eq!(report.stale_runs_failed, 1);

        let stored = store
            .get_pipeline_run(stuck.id)
            .await
            .expect("get")
            .expect("run");
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.completed_at, Some(now));
        assert_eq!(stored.errors, vec![STALE_RUN_REASON.to_string()]);

        // The slot is free again, and a fresh run is left alone.
        let fresh = PipelineRun::start("api", now);
        store.start_pipeline_run(&fresh).await.expect("fresh run");
        let again = run_cleanup(&store, now).await.expect("cleanup again");
        assert_eq!(again.stale_runs_failed, 0);
        let fresh_stored = store
            .get_pipeline_run(fresh.id)
            .await
            .expect("get")
            .expect("run");
        assert_eq!(fresh_stored.status, RunStatus::Running);
    }
}
