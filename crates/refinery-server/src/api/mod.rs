mod alphas;
mod ingest;
mod maintenance;
mod pipeline_runs;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, HeaderName, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use refinery_core::{RefineryStore, StoreError};
use refinery_llm::StructuredExtractor;
use refinery_pipeline::{IngestVerifier, PipelineConfig};
use serde::Serialize;
use sqlx::PgPool;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

use crate::middleware::{
    enforce_rate_limit, request_id, require_pipeline_token, resolve_access_tier, PipelineAuth,
    RateLimitState, ReadAuth, RequestId,
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RefineryStore>,
    pub extractor: Arc<dyn StructuredExtractor>,
    pub pipeline: Arc<PipelineConfig>,
    /// `None` when no ingest secret is configured; ingest then answers 503.
    pub verifier: Option<IngestVerifier>,
    /// Set for the Postgres backend so health checks can ping it.
    pub pool: Option<PgPool>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub data: T,
    pub meta: ResponseMeta,
}

#[derive(Debug, Serialize)]
pub struct ResponseMeta {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: ErrorBody,
    pub meta: ResponseMeta,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct HealthData {
    status: &'static str,
    database: &'static str,
}

impl ResponseMeta {
    pub(super) fn new(request_id: String) -> Self {
        Self {
            request_id,
            timestamp: Utc::now(),
        }
    }
}

impl<T: Serialize> ApiResponse<T> {
    pub(super) fn new(data: T, request_id: String) -> Json<Self> {
        Json(Self {
            data,
            meta: ResponseMeta::new(request_id),
        })
    }
}

impl ApiError {
    pub fn new(
        request_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
            },
            meta: ResponseMeta::new(request_id.into()),
        }
    }

    fn status(&self) -> StatusCode {
        match self.error.code.as_str() {
            "not_found" => StatusCode::NOT_FOUND,
            "unauthorized" | "invalid_signature" | "stale_or_future_timestamp" => {
                StatusCode::UNAUTHORIZED
            }
            "bad_request" | "validation_error" => StatusCode::BAD_REQUEST,
            "conflict" | "pipeline_already_running" => StatusCode::CONFLICT,
            "rate_limited" | "replay_detected" => StatusCode::TOO_MANY_REQUESTS,
            "service_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status(), Json(self)).into_response()
    }
}

pub(super) fn normalize_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(50).clamp(1, 200)
}

pub(super) fn map_store_error(request_id: String, error: &StoreError) -> ApiError {
    tracing::error!(error = %error, "store operation failed");
    ApiError::new(request_id, "internal_error", "storage operation failed")
}

fn build_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-request-id"),
            HeaderName::from_static(ingest::SIGNATURE_HEADER),
            HeaderName::from_static(ingest::TIMESTAMP_HEADER),
            HeaderName::from_static(ingest::NONCE_HEADER),
        ])
}

fn pipeline_router(auth: PipelineAuth, rate_limit: RateLimitState) -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/pipeline/runs",
            get(pipeline_runs::list_pipeline_runs).post(pipeline_runs::trigger_pipeline_run),
        )
        .route(
            "/api/v1/pipeline/runs/{run_id}",
            get(pipeline_runs::get_pipeline_run),
        )
        .route(
            "/api/v1/maintenance/cleanup",
            post(maintenance::run_maintenance_cleanup),
        )
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn_with_state(
                    rate_limit,
                    enforce_rate_limit,
                ))
                .layer(axum::middleware::from_fn_with_state(
                    auth,
                    require_pipeline_token,
                )),
        )
}

fn read_router(auth: ReadAuth, rate_limit: RateLimitState) -> Router<AppState> {
    Router::new()
        .route("/api/v1/alphas", get(alphas::list_alpha_cards))
        .route("/api/v1/alphas/{card_id}", get(alphas::get_alpha_card))
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn_with_state(
                    rate_limit,
                    enforce_rate_limit,
                ))
                .layer(axum::middleware::from_fn_with_state(
                    auth,
                    resolve_access_tier,
                )),
        )
}

pub fn build_app(
    state: AppState,
    pipeline_auth: PipelineAuth,
    read_auth: ReadAuth,
    rate_limit: RateLimitState,
) -> Router {
    // Ingest authenticates each request by signature, so it sits outside the
    // bearer-token routers.
    let public_routes = Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/ingest", post(ingest::ingest_capture));

    Router::new()
        .merge(public_routes)
        .merge(pipeline_router(pipeline_auth, rate_limit.clone()))
        .merge(read_router(read_auth, rate_limit))
        .layer(
            ServiceBuilder::new()
                .layer(build_cors())
                .layer(axum::middleware::from_fn(request_id)),
        )
        .with_state(state)
}

async fn health(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
) -> impl IntoResponse {
    let Some(pool) = &state.pool else {
        return (
            StatusCode::OK,
            ApiResponse::new(
                HealthData {
                    status: "ok",
                    database: "memory",
                },
                req_id.0,
            ),
        );
    };

    match refinery_db::health_check(pool).await {
        Ok(()) => (
            StatusCode::OK,
            ApiResponse::new(
                HealthData {
                    status: "ok",
                    database: "ok",
                },
                req_id.0,
            ),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "health check: database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                ApiResponse::new(
                    HealthData {
                        status: "degraded",
                        database: "unavailable",
                    },
                    req_id.0,
                ),
            )
        }
    }
}

pub fn default_rate_limit_state() -> RateLimitState {
    RateLimitState::new(120, Duration::from_secs(60))
}
