use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Extension, Json,
};
use chrono::Utc;
use refinery_core::{CaptureInsert, RawCapture, Validate};
use refinery_pipeline::{IngestRequest, VerifyError};
use serde::Serialize;
use uuid::Uuid;

use crate::middleware::RequestId;

use super::{map_store_error, ApiError, ApiResponse, AppState};

pub(super) const SIGNATURE_HEADER: &str = "x-refinery-signature";
pub(super) const TIMESTAMP_HEADER: &str = "x-refinery-timestamp";
pub(super) const NONCE_HEADER: &str = "x-refinery-nonce";

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub(super) enum IngestStatus {
    Accepted,
    AlreadyIngested,
}

#[derive(Debug, Serialize)]
pub(super) struct IngestReceipt {
    status: IngestStatus,
    capture_id: Uuid,
}

struct AuthHeaders<'a> {
    signature: &'a str,
    timestamp_ms: i64,
    nonce: &'a str,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn auth_headers(headers: &HeaderMap) -> Result<AuthHeaders<'_>, String> {
    let signature =
        header(headers, SIGNATURE_HEADER).ok_or_else(|| format!("missing {SIGNATURE_HEADER}"))?;
    let timestamp_ms = header(headers, TIMESTAMP_HEADER)
        .ok_or_else(|| format!("missing {TIMESTAMP_HEADER}"))?
        .parse::<i64>()
        .map_err(|_| format!("{TIMESTAMP_HEADER} must be epoch milliseconds"))?;
    let nonce = header(headers, NONCE_HEADER).ok_or_else(|| format!("missing {NONCE_HEADER}"))?;

    Ok(AuthHeaders {
        signature,
        timestamp_ms,
        nonce,
    })
}

/// Accepts one signed capture batch and stores it as pending.
///
/// The payload is parsed and validated before authentication because the
/// per-feed rate limit needs `source_feed` from the body; the signature still
/// covers the exact bytes received.
pub(super) async fn ingest_capture(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<IngestReceipt>>, ApiError> {
    let auth = auth_headers(&headers)
        .map_err(|message| ApiError::new(req_id.0.clone(), "bad_request", message))?;

    let capture: RawCapture = serde_json::from_slice(&body).map_err(|e| {
        ApiError::new(
            req_id.0.clone(),
            "validation_error",
            format!("invalid capture payload: {e}"),
        )
    })?;
    capture
        .validate()
        .map_err(|e| ApiError::new(req_id.0.clone(), "validation_error", e.to_string()))?;

    let Some(verifier) = &state.verifier else {
        tracing::error!("ingest rejected: REFINERY_INGEST_HMAC_SECRET is not configured");
        return Err(ApiError::new(
            req_id.0,
            "service_unavailable",
            "ingest is not configured",
        ));
    };

    let request = IngestRequest {
        body: &body,
        signature: auth.signature,
        timestamp_ms: auth.timestamp_ms,
        nonce: auth.nonce,
        source_feed: &capture.source_feed,
    };

    match verifier.verify(&*state.store, &request, Utc::now()).await {
        Ok(()) => {}
        Err(VerifyError::Rejected(rejection)) => {
            tracing::warn!(
                source_feed = %capture.source_feed,
                reason = rejection.code(),
                "ingest rejected"
            );
            return Err(ApiError::new(
                req_id.0,
                rejection.code(),
                rejection.to_string(),
            ));
        }
        Err(VerifyError::Store(e)) => return Err(map_store_error(req_id.0, &e)),
    }

    let status = match state
        .store
        .insert_capture(&capture)
        .await
        .map_err(|e| map_store_error(req_id.0.clone(), &e))?
    {
        CaptureInsert::Inserted => {
            tracing::info!(
                capture_id = %capture.capture_id,
                source_feed = %capture.source_feed,
                posts = capture.posts.len(),
                "capture ingested"
            );
            IngestStatus::Accepted
        }
        CaptureInsert::AlreadyExists => {
            tracing::info!(capture_id = %capture.capture_id, "capture already ingested");
            IngestStatus::AlreadyIngested
        }
    };

    Ok(ApiResponse::new(
        IngestReceipt {
            status,
            capture_id: capture.capture_id,
        },
        req_id.0,
    ))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Duration;
    use refinery_core::CaptureRepo;

    use crate::test_support::{capture, send, signed_ingest, test_app, TestApp};

    #[tokio::test]
    async fn signed_capture_is_stored_as_pending() {
        let TestApp {
            app,
            store,
            verifier,
        } = test_app();
        let raw = capture();
        let body = serde_json::to_vec(&raw).expect("serialize");

        let (status, json) = send(&app, signed_ingest(&verifier, body, "nonce-1")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["status"], "accepted");
        assert_eq!(json["data"]["capture_id"], raw.capture_id.to_string());
        let stored = store
            .get_capture(raw.capture_id)
            .await
            .expect("lookup")
            .expect("stored");
        assert_eq!(stored.status, refinery_core::CaptureStatus::Pending);
    }

    #[tokio::test]
    async fn second_ingest_of_same_capture_reports_already_ingested() {
        let TestApp {
            app,
            store,
            verifier,
        } = test_app();
        let raw = capture();
        let body = serde_json::to_vec(&raw).expect("serialize");

        let (first, _) = send(&app, signed_ingest(&verifier, body.clone(), "nonce-a")).await;
        assert_eq!(first, StatusCode::OK);

        // Step past the per-feed rate limit.
        store.backdate_capture(raw.capture_id, chrono::Utc::now() - Duration::minutes(2));

        let (second, json) = send(&app, signed_ingest(&verifier, body, "nonce-b")).await;

        assert_eq!(second, StatusCode::OK);
        assert_eq!(json["data"]["status"], "already_ingested");
        assert_eq!(store.capture_count(), 1);
    }

    #[tokio::test]
    async fn tampered_body_is_rejected_with_401() {
        let TestApp { app, verifier, .. } = test_app();
        let body = serde_json::to_vec(&capture()).expect("serialize");
        let mut request = signed_ingest(&verifier, body.clone(), "nonce-1");

        let mut tampered: serde_json::Value = serde_json::from_slice(&body).expect("json");
        tampered["agent_version"] = serde_json::json!("9.9.9");
        *request.body_mut() = Body::from(serde_json::to_vec(&tampered).expect("serialize"));

        let (status, json) = send(&app, request).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"]["code"], "invalid_signature");
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected_with_401() {
        let TestApp { app, verifier, .. } = test_app();
        let body = serde_json::to_vec(&capture()).expect("serialize");
        let mut request = signed_ingest(&verifier, body, "nonce-1");
        let stale = (chrono::Utc::now() - Duration::minutes(10)).timestamp_millis();
        request.headers_mut().insert(
            "x-refinery-timestamp",
            stale.to_string().parse().expect("header value"),
        );

        let (status, json) = send(&app, request).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"]["code"], "stale_or_future_timestamp");
    }

    #[tokio::test]
    async fn replayed_nonce_is_rejected_with_429() {
        let TestApp { app, verifier, .. } = test_app();
        let body = serde_json::to_vec(&capture()).expect("serialize");

        let (first, _) = send(&app, signed_ingest(&verifier, body.clone(), "nonce-1")).await;
        assert_eq!(first, StatusCode::OK);

        let (second, json) = send(&app, signed_ingest(&verifier, body, "nonce-1")).await;

        assert_eq!(second, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json["error"]["code"], "replay_detected");
    }

    #[tokio::test]
    async fn rapid_second_capture_from_same_feed_is_rate_limited() {
        let TestApp { app, verifier, .. } = test_app();
        let first = serde_json::to_vec(&capture()).expect("serialize");
        let second = serde_json::to_vec(&capture()).expect("serialize");

        let (status, _) = send(&app, signed_ingest(&verifier, first, "nonce-1")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, json) = send(&app, signed_ingest(&verifier, second, "nonce-2")).await;

        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json["error"]["code"], "rate_limited");
    }

    #[tokio::test]
    async fn missing_auth_headers_are_a_bad_request() {
        let TestApp { app, .. } = test_app();
        let body = serde_json::to_vec(&capture()).expect("serialize");

        let (status, json) = send(
            &app,
            Request::builder()
                .method("POST")
                .uri("/api/v1/ingest")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .expect("request"),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn malformed_json_is_a_validation_error() {
        let TestApp { app, verifier, .. } = test_app();

        let (status, json) = send(
            &app,
            signed_ingest(&verifier, b"{\"capture_id\": 12".to_vec(), "nonce-1"),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "validation_error");
    }

    #[tokio::test]
    async fn oversized_batch_is_a_validation_error() {
        let TestApp {
            app,
            store,
            verifier,
        } = test_app();
        let mut raw = capture();
        let template = raw.posts[0].clone();
        raw.posts = (0..=refinery_core::MAX_POSTS_PER_CAPTURE)
            .map(|i| refinery_core::PostRecord {
                post_id: format!("p{i}"),
                ..template.clone()
            })
            .collect();
        let body = serde_json::to_vec(&raw).expect("serialize");

        let (status, json) = send(&app, signed_ingest(&verifier, body, "nonce-1")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "validation_error");
        assert_eq!(store.capture_count(), 0);
    }
}
