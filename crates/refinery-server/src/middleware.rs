use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use refinery_core::{AccessTier, AppConfig};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::api::ApiError;

/// Newtype wrapping a request ID string, stored as a request extension.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

fn request_id_of(req: &Request) -> String {
    req.extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default()
}

/// Bearer token guarding the pipeline trigger, run history and maintenance.
#[derive(Clone)]
pub struct PipelineAuth {
    token: Option<Arc<str>>,
}

impl std::fmt::Debug for PipelineAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineAuth")
            .field("configured", &self.token.is_some())
            .finish()
    }
}

impl PipelineAuth {
    #[must_use]
    pub fn new(token: Option<&str>) -> Self {
        Self {
            token: token.map(Arc::from),
        }
    }

    /// Reads `REFINERY_PIPELINE_TOKEN` from `config`.
    ///
    /// Without a token every pipeline route answers 401; there is no
    /// development bypass.
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        if config.pipeline_token.is_none() {
            tracing::warn!("REFINERY_PIPELINE_TOKEN not set; pipeline routes will reject every request");
        }
        Self::new(config.pipeline_token.as_deref())
    }

    fn allows(&self, candidate: &str) -> bool {
        self.token
            .as_deref()
            .is_some_and(|token| bool::from(token.as_bytes().ct_eq(candidate.as_bytes())))
    }
}

/// API keys mapped to access tiers at the read boundary.
#[derive(Clone)]
pub struct ReadAuth {
    free_keys: Arc<HashSet<String>>,
    pro_keys: Arc<HashSet<String>>,
    pub enabled: bool,
}

impl std::fmt::Debug for ReadAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadAuth")
            .field("free_keys", &self.free_keys.len())
            .field("pro_keys", &self.pro_keys.len())
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl ReadAuth {
    #[must_use]
    pub fn new(free_keys: &[String], pro_keys: &[String]) -> Self {
        let free_keys: HashSet<String> = free_keys.iter().cloned().collect();
        let pro_keys: HashSet<String> = pro_keys.iter().cloned().collect();
        let enabled = !(free_keys.is_empty() && pro_keys.is_empty());

        Self {
            free_keys: Arc::new(free_keys),
            pro_keys: Arc::new(pro_keys),
            enabled,
        }
    }

    /// Builds the key table from `REFINERY_API_KEYS` (free) and
    /// `REFINERY_PRO_API_KEYS` (pro).
    ///
    /// In development, no keys at all serves every caller as free tier.
    /// Outside development, no keys fails startup.
    ///
    /// # Errors
    ///
    /// Returns an error when no keys are configured outside development.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let auth = Self::new(&config.api_keys, &config.pro_api_keys);

        if !auth.enabled {
            if config.env.is_development() {
                tracing::warn!(
                    "REFINERY_API_KEYS not set; card reads served as free tier without auth"
                );
                return Ok(auth);
            }

            anyhow::bail!(
                "REFINERY_API_KEYS or REFINERY_PRO_API_KEYS is required outside development"
            );
        }

        Ok(auth)
    }

    /// Pro keys win when a key is listed in both tables.
    fn tier_for(&self, key: &str) -> Option<AccessTier> {
        if self.pro_keys.contains(key) {
            Some(AccessTier::Pro)
        } else if self.free_keys.contains(key) {
            Some(AccessTier::Free)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
struct RateLimitWindow {
    started_at: Instant,
    count: usize,
}

/// Sliding fixed-window limiter for simple API protection.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    max_requests: usize,
    window: Duration,
    state: Arc<Mutex<RateLimitWindow>>,
}

impl RateLimitState {
    #[must_use]
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            state: Arc::new(Mutex::new(RateLimitWindow {
                started_at: Instant::now(),
                count: 0,
            })),
        }
    }
}

/// Axum middleware that extracts or generates a request ID.
///
/// If the incoming request has an `x-request-id` header, that value is used.
/// Otherwise a new `UUIDv4` is generated. The ID is:
/// - Inserted into request extensions as [`RequestId`]
/// - Set on the response as the `x-request-id` header
pub async fn request_id(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| Uuid::new_v4().to_string(), String::from);

    req.extensions_mut().insert(RequestId(id.clone()));

    let mut res = next.run(req).await;

    if let Ok(val) = HeaderValue::from_str(&id) {
        res.headers_mut().insert("x-request-id", val);
    }

    res
}

/// Middleware enforcing the pipeline bearer token.
pub async fn require_pipeline_token(
    State(auth): State<PipelineAuth>,
    req: Request,
    next: Next,
) -> Response {
    match extract_bearer_token(req.headers().get(AUTHORIZATION)) {
        Some(token) if auth.allows(token) => next.run(req).await,
        _ => ApiError::new(
            request_id_of(&req),
            "unauthorized",
            "missing or invalid pipeline token",
        )
        .into_response(),
    }
}

/// Middleware resolving the caller's [`AccessTier`] from its bearer key and
/// storing it as a request extension.
pub async fn resolve_access_tier(
    State(auth): State<ReadAuth>,
    mut req: Request,
    next: Next,
) -> Response {
    if !auth.enabled {
        req.extensions_mut().insert(AccessTier::Free);
        return next.run(req).await;
    }

    let tier = extract_bearer_token(req.headers().get(AUTHORIZATION))
        .and_then(|key| auth.tier_for(key));

    match tier {
        Some(tier) => {
            req.extensions_mut().insert(tier);
            next.run(req).await
        }
        None => ApiError::new(
            request_id_of(&req),
            "unauthorized",
            "missing or invalid API key",
        )
        .into_response(),
    }
}

/// Middleware enforcing a fixed request-per-window limit.
pub async fn enforce_rate_limit(
    State(rate_limit): State<RateLimitState>,
    req: Request,
    next: Next,
) -> Response {
    let mut window = rate_limit.state.lock().await;
    let elapsed = window.started_at.elapsed();

    if elapsed >= rate_limit.window {
        window.started_at = Instant::now();
        window.count = 0;
    }

    if window.count >= rate_limit.max_requests {
        drop(window);
        return ApiError::new(request_id_of(&req), "rate_limited", "rate limit exceeded")
            .into_response();
    }

    window.count += 1;
    drop(window);

    next.run(req).await
}

fn extract_bearer_token(value: Option<&HeaderValue>) -> Option<&str> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|s| !s.trim().is_empty())
}
