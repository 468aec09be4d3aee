//! End-to-end HTTP coverage for `/records` (SPEC_FULL.md §8 B1, B4, B5).

use std::sync::Arc;

use http_body_util::BodyExt;
use logline_config::{Environment, Settings};
use logline_daemon::{routes::build_router, state::AppState};
use tower::ServiceExt;

fn settings(store_connection: String) -> Settings {
    Settings {
        store_connection,
        boot_function_id: None,
        app_user_id: None,
        app_tenant_id: None,
        signing_key_hex: None,
        environment: Environment::NonProduction,
        allowed_origins: vec![],
        manifest_cache_ttl_ms: 300_000,
        credentials_cache_ttl_ms: 900_000,
    }
}

#[tokio::test]
async fn posting_then_listing_a_record_round_trips() {
    let Ok(pool) = logline_testkit::db_pool().await else { return };
    let store_connection = std::env::var("LOGLINE_DATABASE_URL").unwrap();
    let state = Arc::new(AppState::new(pool, settings(store_connection)));
    let router = build_router(state);

    let body = serde_json::json!({
        "entity_type": "function",
        "this": "fixture",
        "code": "1",
        "visibility": "private",
    });
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/records")
        .header("content-type", "application/json")
        .header("x-user-id", "http-test-user")
        .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::CREATED);

    let request = axum::http::Request::builder()
        .method("GET")
        .uri("/records?entity_type=function&owner_id=http-test-user")
        .header("x-user-id", "http-test-user")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let spans: Vec<serde_json::Value> = serde_json::from_slice(&bytes).unwrap();
    assert!(spans.iter().any(|s| s["this"] == "fixture"));
}

#[tokio::test]
async fn limit_over_100_is_rejected_as_validation() {
    let Ok(pool) = logline_testkit::db_pool().await else { return };
    let store_connection = std::env::var("LOGLINE_DATABASE_URL").unwrap();
    let state = Arc::new(AppState::new(pool, settings(store_connection)));
    let router = build_router(state);

    let request = axum::http::Request::builder()
        .method("GET")
        .uri("/records?limit=101")
        .header("x-user-id", "http-test-user")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn posting_without_an_identity_header_is_rejected() {
    let Ok(pool) = logline_testkit::db_pool().await else { return };
    let store_connection = std::env::var("LOGLINE_DATABASE_URL").unwrap();
    let state = Arc::new(AppState::new(pool, settings(store_connection)));
    let router = build_router(state);

    // `owner_id` is derived from X-User-Id by the handler, never read from
    // the body, so I6 is enforced by construction — the only way this
    // surface can reject a write is a missing identity header.
    let body = serde_json::json!({ "entity_type": "function" });
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/records")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);
}
