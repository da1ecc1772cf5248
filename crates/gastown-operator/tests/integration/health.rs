/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
};
use chrono::Utc;
use gastown_operator::health::{configure_health_routes, HealthState};
use gastown_operator::tools::ToolHealth;
use std::sync::Arc;
use tower::ServiceExt;

async fn get(state: HealthState, uri: &str) -> (StatusCode, String) {
    let response = configure_health_routes(state)
        .oneshot(Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn test_healthz_endpoint() {
    let (status, body) = get(HealthState::new(Arc::new(ToolHealth::new())), "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn test_readyz_with_no_tool_calls() {
    let (status, body) = get(HealthState::new(Arc::new(ToolHealth::new())), "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Ready");
}

#[tokio::test]
async fn test_readyz_fails_after_recent_tool_failure() {
    let tools = Arc::new(ToolHealth::new());
    tools.record(false);
    let (status, _) = get(HealthState::new(tools), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_readyz_ignores_stale_failure() {
    let tools = Arc::new(ToolHealth::new());
    tools.record_at(Utc::now() - chrono::Duration::minutes(10), false);
    let (status, _) = get(HealthState::new(tools), "/readyz").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_health_endpoint_json() {
    let tools = Arc::new(ToolHealth::new());
    tools.record(true);
    let (status, body) = get(HealthState::new(tools), "/health").await;
    assert_eq!(status, StatusCode::OK);

    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["tools"]["ready"], true);
    assert_eq!(json["tools"]["last_call_healthy"], true);
    assert!(json["uptime_seconds"].is_u64());
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_metrics_endpoint() {
    gastown_operator::metrics::init();
    let response = configure_health_routes(HealthState::new(Arc::new(ToolHealth::new())))
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap().to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}
