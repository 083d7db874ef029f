use std::str::FromStr;

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use refinery_core::{
    gate_alpha_card, AccessTier, AlphaCard, AlphaCategory, CardQuery, CardStatus, Direction,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::middleware::RequestId;

use super::{map_store_error, ApiError, ApiResponse, AppState};

const DEFAULT_CARD_LIMIT: i64 = 20;
const MAX_CARD_LIMIT: i64 = 50;

#[derive(Debug, Deserialize)]
pub(super) struct AlphaCardsQuery {
    pub limit: Option<i64>,
    pub category: Option<String>,
    pub direction: Option<String>,
    pub status: Option<String>,
}

fn parse_filter<T>(request_id: &str, field: &str, raw: Option<&str>) -> Result<Option<T>, ApiError>
where
    T: FromStr<Err = refinery_core::ValidationError>,
{
    raw.filter(|v| !v.is_empty())
        .map(|v| {
            v.parse::<T>().map_err(|_| {
                ApiError::new(
                    request_id,
                    "validation_error",
                    format!("unknown {field} '{v}'"),
                )
            })
        })
        .transpose()
}

impl AlphaCardsQuery {
    fn to_card_query(&self, request_id: &str) -> Result<CardQuery, ApiError> {
        Ok(CardQuery {
            limit: self
                .limit
                .unwrap_or(DEFAULT_CARD_LIMIT)
                .clamp(1, MAX_CARD_LIMIT),
            category: parse_filter::<AlphaCategory>(
                request_id,
                "category",
                self.category.as_deref(),
            )?,
            direction: parse_filter::<Direction>(
                request_id,
                "direction",
                self.direction.as_deref(),
            )?,
            status: parse_filter::<CardStatus>(request_id, "status", self.status.as_deref())?
                .unwrap_or(CardStatus::Active),
        })
    }
}

/// Newest-first cards, gated to the caller's tier.
pub(super) async fn list_alpha_cards(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Extension(tier): Extension<AccessTier>,
    Query(query): Query<AlphaCardsQuery>,
) -> Result<Json<ApiResponse<Vec<AlphaCard>>>, ApiError> {
    let card_query = query.to_card_query(&req_id.0)?;

    let cards = state
        .store
        .list_alpha_cards(&card_query)
        .await
        .map_err(|e| map_store_error(req_id.0.clone(), &e))?;

    let data = cards
        .iter()
        .map(|card| gate_alpha_card(card, tier))
        .collect();

    Ok(ApiResponse::new(data, req_id.0))
}

pub(super) async fn get_alpha_card(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Extension(tier): Extension<AccessTier>,
    Path(card_id): Path<String>,
) -> Result<Json<ApiResponse<AlphaCard>>, ApiError> {
    let id = Uuid::parse_str(&card_id).map_err(|_| {
        ApiError::new(
            req_id.0.clone(),
            "validation_error",
            format!("'{card_id}' is not a valid card id"),
        )
    })?;

    let card = state
        .store
        .get_alpha_card(id)
        .await
        .map_err(|e| map_store_error(req_id.0.clone(), &e))?
        .ok_or_else(|| ApiError::new(req_id.0.clone(), "not_found", "alpha card not found"))?;

    Ok(ApiResponse::new(gate_alpha_card(&card, tier), req_id.0))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use refinery_core::{AlphaCategory, CardStatus, PRO_FIELDS};

    use crate::middleware::ReadAuth;
    use crate::test_support::{
        card, seed_card, send, test_app, test_app_with, TestApp, FREE_KEY, PRO_KEY,
    };

    fn get(uri: &str, key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(key) = key {
            builder = builder.header("authorization", format!("Bearer {key}"));
        }
        builder.body(Body::empty()).expect("request")
    }

    #[tokio::test]
    async fn free_key_sees_pro_fields_nulled() {
        let TestApp { app, store, .. } = test_app();
        let stored = card();
        seed_card(&store, &stored).await;

        let (status, json) = send(&app, get("/api/v1/alphas", Some(FREE_KEY))).await;

        assert_eq!(status, StatusCode::OK);
        let first = &json["data"][0];
        assert_eq!(first["id"], stored.id.to_string());
        assert_eq!(first["title"], stored.title.as_str());
        for field in PRO_FIELDS {
            assert!(first[field].is_null(), "{field} should be gated");
        }
    }

    #[tokio::test]
    async fn pro_key_sees_full_card() {
        let TestApp { app, store, .. } = test_app();
        let stored = card();
        seed_card(&store, &stored).await;

        let (status, json) = send(
            &app,
            get(&format!("/api/v1/alphas/{}", stored.id), Some(PRO_KEY)),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let expected = serde_json::to_value(&stored).expect("serialize");
        assert_eq!(json["data"], expected);
    }

    #[tokio::test]
    async fn unknown_key_is_unauthorized() {
        let TestApp { app, .. } = test_app();

        let (status, _) = send(&app, get("/api/v1/alphas", Some("stolen"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&app, get("/api/v1/alphas", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn no_configured_keys_serves_free_tier() {
        let TestApp { app, store, .. } = test_app_with(ReadAuth::new(&[], &[]));
        seed_card(&store, &card()).await;

        let (status, json) = send(&app, get("/api/v1/alphas", None)).await;

        assert_eq!(status, StatusCode::OK);
        assert!(json["data"][0]["thesis"].is_null());
        assert!(json["data"][0]["blueprint"].is_null());
    }

    #[tokio::test]
    async fn filters_by_category_and_status() {
        let TestApp { app, store, .. } = test_app();
        let shift = card();
        let mut friction = card();
        friction.category = AlphaCategory::FrictionOpportunity;
        let mut expired = card();
        expired.status = CardStatus::Expired;
        for c in [&shift, &friction, &expired] {
            seed_card(&store, c).await;
        }

        let (_, json) = send(
            &app,
            get("/api/v1/alphas?category=friction_opportunity", Some(PRO_KEY)),
        )
        .await;
        let ids: Vec<&str> = json["data"]
            .as_array()
            .expect("data array")
            .iter()
            .filter_map(|c| c["id"].as_str())
            .collect();
        let friction_id = friction.id.to_string();
        assert_eq!(ids, vec![friction_id.as_str()]);

        let (_, json) = send(&app, get("/api/v1/alphas?status=expired", Some(PRO_KEY))).await;
        assert_eq!(json["data"].as_array().map(Vec::len), Some(1));
        assert_eq!(json["data"][0]["id"], expired.id.to_string());
    }

    #[tokio::test]
    async fn unknown_filter_value_is_a_validation_error() {
        let TestApp { app, .. } = test_app();

        let (status, json) = send(&app, get("/api/v1/alphas?direction=sideways", Some(FREE_KEY))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "validation_error");
    }

    #[tokio::test]
    async fn missing_card_is_not_found() {
        let TestApp { app, .. } = test_app();

        let (status, json) = send(
            &app,
            get(
                &format!("/api/v1/alphas/{}", uuid::Uuid::new_v4()),
                Some(FREE_KEY),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "not_found");
    }
}
