use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use refinery_core::PipelineRun;
use refinery_pipeline::{run_pipeline, PipelineError};
use serde::Deserialize;
use uuid::Uuid;

use crate::middleware::RequestId;

use super::{map_store_error, normalize_limit, ApiError, ApiResponse, AppState};

#[derive(Debug, Deserialize)]
pub(super) struct PipelineRunsQuery {
    pub limit: Option<i64>,
}

/// Runs the pipeline to completion and returns the finalized run record.
pub(super) async fn trigger_pipeline_run(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
) -> Result<Json<ApiResponse<PipelineRun>>, ApiError> {
    match run_pipeline(&*state.store, &*state.extractor, &state.pipeline, "api").await {
        Ok(run) => Ok(ApiResponse::new(run, req_id.0)),
        Err(PipelineError::AlreadyRunning) => {
            tracing::info!("pipeline trigger rejected: a run is already in flight");
            Err(ApiError::new(
                req_id.0,
                "pipeline_already_running",
                "a pipeline run is already in progress",
            ))
        }
        Err(PipelineError::Store(e)) => {
            tracing::error!(error = %e, "pipeline run could not be recorded");
            Err(ApiError::new(
                req_id.0,
                "internal_error",
                "pipeline run failed",
            ))
        }
    }
}

pub(super) async fn list_pipeline_runs(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Query(query): Query<PipelineRunsQuery>,
) -> Result<Json<ApiResponse<Vec<PipelineRun>>>, ApiError> {
    let runs = state
        .store
        .list_pipeline_runs(normalize_limit(query.limit))
        .await
        .map_err(|e| map_store_error(req_id.0.clone(), &e))?;

    Ok(ApiResponse::new(runs, req_id.0))
}

pub(super) async fn get_pipeline_run(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path(run_id): Path<String>,
) -> Result<Json<ApiResponse<PipelineRun>>, ApiError> {
    let id = Uuid::parse_str(&run_id).map_err(|_| {
        ApiError::new(
            req_id.0.clone(),
            "validation_error",
            format!("'{run_id}' is not a valid run id"),
        )
    })?;

    let run = state
        .store
        .get_pipeline_run(id)
        .await
        .map_err(|e| map_store_error(req_id.0.clone(), &e))?
        .ok_or_else(|| ApiError::new(req_id.0.clone(), "not_found", "pipeline run not found"))?;

    Ok(ApiResponse::new(run, req_id.0))
}
