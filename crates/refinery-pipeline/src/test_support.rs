//! Fixtures and a scripted extractor shared by the stage tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use refinery_core::{CaptureMetadata, Direction, PatternCluster, PostRecord, RawCapture};
use refinery_llm::{Extraction, ExtractionRequest, LlmError, StructuredExtractor};
use serde_json::json;
use uuid::Uuid;

type Respond = dyn Fn(&ExtractionRequest) -> Result<Extraction, LlmError> + Send + Sync;

/// Answers each request with a closure and keeps every request it saw.
pub(crate) struct ScriptedExtractor {
    respond: Box<Respond>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ExtractionRequest>>,
}

impl ScriptedExtractor {
    pub(crate) fn new<F>(respond: F) -> Self
    where
        F: Fn(&ExtractionRequest) -> Result<Extraction, LlmError> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Runs the closure without recording the call.
    pub(crate) fn respond(&self, request: &ExtractionRequest) -> Result<Extraction, LlmError> {
        (self.respond)(request)
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<ExtractionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl StructuredExtractor for ScriptedExtractor {
    async fn extract(&self, request: &ExtractionRequest) -> Result<Extraction, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        self.respond(request)
    }
}

pub(crate) fn extraction(data: serde_json::Value, tokens_used: u64) -> Extraction {
    Extraction { data, tokens_used }
}

pub(crate) fn post(id: &str, content: &str) -> PostRecord {
    PostRecord {
        post_id: id.to_string(),
        author_handle: "dev".to_string(),
        author_name: "Dev".to_string(),
        author_followers: 1200,
        author_verified: false,
        content: content.to_string(),
        timestamp: Utc::now(),
        likes: 0,
        reposts: 0,
        replies: 0,
        quotes: 0,
        media_urls: vec![],
        is_thread: false,
        thread_position: None,
        parent_post_id: None,
        urls: vec![],
        hashtags: vec![],
    }
}

pub(crate) fn capture(posts: Vec<PostRecord>) -> RawCapture {
    RawCapture {
        capture_id: Uuid::new_v4(),
        source_feed: "home-timeline".to_string(),
        source_type: "x".to_string(),
        captured_at: Utc::now(),
        agent_version: "1.4.0".to_string(),
        metadata: CaptureMetadata {
            scroll_depth: 8.0,
            capture_duration_ms: 4_000.0,
            total_extracted: u64::try_from(posts.len()).unwrap_or(u64::MAX),
        },
        posts,
    }
}

pub(crate) fn capture_from_feed(feed: &str) -> RawCapture {
    let mut c = capture(vec![post("1", "switched to rust")]);
    c.source_feed = feed.to_string();
    c
}

pub(crate) fn cluster() -> PatternCluster {
    PatternCluster {
        cluster_id: Uuid::new_v4(),
        entities: vec!["react".to_string(), "svelte".to_string()],
        momentum_score: 42.5,
        momentum_delta: 12.5,
        direction: Direction::Rising,
        evidence_post_ids: vec!["p1".to_string(), "p2".to_string(), "p3".to_string()],
        friction_density: 1.0,
        first_seen: Utc::now(),
        window_hours: 48,
    }
}

/// A complete strategist payload without the optional free-tier metrics.
pub(crate) fn strategist_draft() -> serde_json::Value {
    json!({
        "title": "Svelte 5 migration pain opens a tooling gap",
        "category": "friction_opportunity",
        "thesis": "Teams stall on runes",
        "strategy": "Ship a codemod",
        "risk_factors": ["Official codemod lands"],
        "evidence": [{ "post_id": "a1", "author": "@dev", "snippet": "forms broke", "relevance": 0.8 }],
        "friction_detail": "Store migration",
        "opportunity_window": "3-6 months",
        "blueprint": {
            "product_concept": "Runes migration linter",
            "name_ideas": ["Runeway", "Sveltify", "Storecraft"],
            "mvp_weeks": [{ "week": 1, "goal": "Parse components", "tasks": ["AST walker"] }],
            "monetization": "$19/mo per team",
            "tech_stack": ["Rust", "swc"],
            "estimated_tam": "$40M"
        }
    })
}
