/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Health Check Module
//!
//! HTTP endpoints for Kubernetes probes and Prometheus scraping.
//!
//! ## Endpoints
//!
//! - `GET /healthz`: liveness; 200 while the process is serving
//! - `GET /readyz`: 200 unless the most recent external tool call failed
//!   within the last five minutes
//! - `GET /health`: JSON status with tool health, uptime and version
//! - `GET /metrics`: Prometheus text exposition

use crate::metrics;
use crate::tools::{ToolHealth, HEALTH_STALENESS};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use gastown_utils::telemetry::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use std::time::SystemTime;

/// Shared state for health endpoints
#[derive(Clone)]
pub struct HealthState {
    pub tools: Arc<ToolHealth>,
    pub start_time: SystemTime,
}

impl HealthState {
    pub fn new(tools: Arc<ToolHealth>) -> Self {
        Self {
            tools,
            start_time: SystemTime::now(),
        }
    }
}

/// Health status response structure
#[derive(Serialize)]
struct HealthStatus {
    status: String,
    tools: ToolStatus,
    uptime_seconds: u64,
    version: String,
    timestamp: String,
}

#[derive(Serialize)]
struct ToolStatus {
    ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_call_healthy: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_call_at: Option<String>,
    staleness_seconds: u64,
}

/// Configures and returns the health check router
pub fn configure_health_routes(state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Binds the health server and serves it until the process exits.
pub async fn serve(state: HealthState, port: u16) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Health server listening on port {}", port);
    axum::serve(listener, configure_health_routes(state)).await
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness follows the last tool observation while it is fresh.
async fn readyz(State(state): State<HealthState>) -> impl IntoResponse {
    if state.tools.is_ready() {
        (StatusCode::OK, "Ready")
    } else {
        warn!("Readiness check failed: last external tool call failed");
        (StatusCode::SERVICE_UNAVAILABLE, "External tools failing")
    }
}

async fn health(State(state): State<HealthState>) -> impl IntoResponse {
    let ready = state.tools.is_ready();
    let last = state.tools.last_observation();
    let uptime = state
        .start_time
        .elapsed()
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let body = HealthStatus {
        status: if ready { "healthy" } else { "degraded" }.to_string(),
        tools: ToolStatus {
            ready,
            last_call_healthy: last.map(|(_, healthy)| healthy),
            last_call_at: last.map(|(at, _)| at.to_rfc3339()),
            staleness_seconds: HEALTH_STALENESS.as_secs(),
        },
        uptime_seconds: uptime,
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

/// Prometheus metrics endpoint
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        metrics::encode_metrics(),
    )
}
