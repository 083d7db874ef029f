use axum::{extract::State, Extension, Json};
use chrono::Utc;
use refinery_pipeline::{run_cleanup, CleanupReport};

use crate::middleware::RequestId;

use super::{map_store_error, ApiError, ApiResponse, AppState};

/// Expires stale cards and prunes the nonce ledger.
pub(super) async fn run_maintenance_cleanup(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
) -> Result<Json<ApiResponse<CleanupReport>>, ApiError> {
    let report = run_cleanup(&*state.store, Utc::now())
        .await
        .map_err(|e| map_store_error(req_id.0.clone(), &e))?;

    Ok(ApiResponse::new(report, req_id.0))
}
