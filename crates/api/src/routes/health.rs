use axum::{routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

pub fn router() -> Router {
    Router::new().route("/health", get(health_check))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "loki-suite",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now().to_rfc3339(),
    })
}
