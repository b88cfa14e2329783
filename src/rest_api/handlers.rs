//! HTTP handlers for the probe and metrics endpoints

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use tracing::{error, instrument};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Liveness and readiness probe
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Prometheus text exposition of the operator registry
pub async fn metrics() -> impl IntoResponse {
    use prometheus_client::encoding::text::encode;

    let mut buffer = String::new();
    match encode(&mut buffer, &crate::controller::metrics::REGISTRY) {
        Ok(()) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buffer,
        ),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                String::new(),
            )
        }
    }
}
