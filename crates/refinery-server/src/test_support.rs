//! Shared fixtures for router tests.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use refinery_core::{
    AlphaCard, AlphaCardRepo, AlphaCategory, Blueprint, CaptureMetadata, CardStatus, ClusterRepo,
    Direction, EvidenceQuote, MvpWeek, PatternCluster, PostRecord, RawCapture, RefineryStore,
    ALPHA_CARD_TTL_HOURS,
};
use refinery_db::MemoryStore;
use refinery_llm::{Extraction, ExtractionRequest, LlmError, StructuredExtractor};
use refinery_pipeline::{IngestVerifier, PipelineConfig};
use tower::ServiceExt;
use uuid::Uuid;

use crate::api::{build_app, default_rate_limit_state, AppState};
use crate::middleware::{PipelineAuth, ReadAuth};

pub(crate) const PIPELINE_TOKEN: &str = "pipeline-token";
pub(crate) const FREE_KEY: &str = "free-key";
pub(crate) const PRO_KEY: &str = "pro-key";
const HMAC_SECRET: &str = "ingest-secret";

/// Extractor for routes that must never reach the model.
pub(crate) struct OfflineExtractor;

#[async_trait]
impl StructuredExtractor for OfflineExtractor {
    async fn extract(&self, _request: &ExtractionRequest) -> Result<Extraction, LlmError> {
        Err(LlmError::InvalidConfig("model calls are disabled in tests".to_string()))
    }
}

pub(crate) struct TestApp {
    pub app: Router,
    pub store: Arc<MemoryStore>,
    pub verifier: IngestVerifier,
}

pub(crate) fn test_app() -> TestApp {
    test_app_with(ReadAuth::new(
        &[FREE_KEY.to_string()],
        &[PRO_KEY.to_string()],
    ))
}

pub(crate) fn test_app_with(read_auth: ReadAuth) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let shared: Arc<dyn RefineryStore> = store.clone();
    let verifier = IngestVerifier::new(HMAC_SECRET).expect("verifier");

    let state = AppState {
        store: shared,
        extractor: Arc::new(OfflineExtractor),
        pipeline: Arc::new(PipelineConfig::default()),
        verifier: Some(verifier.clone()),
        pool: None,
    };
    let app = build_app(
        state,
        PipelineAuth::new(Some(PIPELINE_TOKEN)),
        read_auth,
        default_rate_limit_state(),
    );

    TestApp {
        app,
        store,
        verifier,
    }
}

/// Sends `request` through a clone of `app` and parses the JSON body.
pub(crate) async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body bytes");
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).expect("json parse")
    };
    (status, json)
}

pub(crate) fn capture() -> RawCapture {
    RawCapture {
        capture_id: Uuid::new_v4(),
        source_feed: "home-timeline".to_string(),
        source_type: "x".to_string(),
        captured_at: Utc::now(),
        agent_version: "1.4.0".to_string(),
        posts: vec![PostRecord {
            post_id: "1901".to_string(),
            author_handle: "dev".to_string(),
            author_name: "Dev".to_string(),
            author_followers: 1_200,
            author_verified: false,
            content: "Switched our API from express to hono, cold starts are way faster"
                .to_string(),
            timestamp: Utc::now(),
            likes: 12,
            reposts: 2,
            replies: 1,
            quotes: 0,
            media_urls: vec![],
            is_thread: false,
            thread_position: None,
            parent_post_id: None,
            urls: vec![],
            hashtags: vec![],
        }],
        metadata: CaptureMetadata {
            scroll_depth: 8.0,
            capture_duration_ms: 4_200.0,
            total_extracted: 1,
        },
    }
}

/// A signed ingest request carrying `body`.
pub(crate) fn signed_ingest(verifier: &IngestVerifier, body: Vec<u8>, nonce: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/ingest")
        .header("content-type", "application/json")
        .header("x-refinery-signature", verifier.sign(&body))
        .header(
            "x-refinery-timestamp",
            Utc::now().timestamp_millis().to_string(),
        )
        .header("x-refinery-nonce", nonce)
        .body(Body::from(body))
        .expect("request")
}

pub(crate) fn card() -> AlphaCard {
    let created_at = Utc::now();
    AlphaCard {
        id: Uuid::new_v4(),
        created_at,
        expires_at: created_at + Duration::hours(ALPHA_CARD_TTL_HOURS),
        status: CardStatus::Active,
        title: "Edge runtimes pull APIs off express".to_string(),
        category: AlphaCategory::MomentumShift,
        entities: vec!["express".to_string(), "hono".to_string()],
        momentum_score: 51.3,
        direction: Direction::Rising,
        signal_count: 9,
        thesis: Some("Cold start cost is driving framework churn".to_string()),
        strategy: Some("Ship a migration assistant".to_string()),
        risk_factors: Some(vec!["Express 5 closes the gap".to_string()]),
        evidence: Some(vec![EvidenceQuote {
            post_id: "1901".to_string(),
            author: "@dev".to_string(),
            snippet: "cold starts are way faster".to_string(),
            relevance: 0.8,
        }]),
        friction_detail: Some("Middleware ports are manual".to_string()),
        opportunity_window: Some("6 months".to_string()),
        blueprint: Some(Blueprint {
            product_concept: "Express to Hono codemod".to_string(),
            name_ideas: vec!["Honeport".to_string()],
            mvp_weeks: vec![MvpWeek {
                week: 1,
                goal: "Route translation".to_string(),
                tasks: vec!["Parse app.use chains".to_string()],
            }],
            monetization: "$29/mo per repo".to_string(),
            tech_stack: vec!["TypeScript".to_string()],
            estimated_tam: "$25M".to_string(),
        }),
        cluster_id: Uuid::new_v4(),
    }
}

/// Stores `card` together with the cluster it belongs to.
pub(crate) async fn seed_card(store: &MemoryStore, card: &AlphaCard) {
    let cluster = PatternCluster {
        cluster_id: card.cluster_id,
        entities: card.entities.clone(),
        momentum_score: card.momentum_score,
        momentum_delta: 4.0,
        direction: card.direction,
        evidence_post_ids: vec!["1901".to_string()],
        friction_density: 0.5,
        first_seen: card.created_at,
        window_hours: 48,
    };
    store
        .insert_clusters(std::slice::from_ref(&cluster))
        .await
        .expect("insert cluster");
    store.insert_alpha_card(card).await.expect("insert card");
}
