//! HTTP API surface
//!
//! ## Responsibilities
//!
//! - Route table and middleware wiring
//! - One-shot frame analysis, stats readout, video job endpoints
//! - Admin endpoints behind token auth

mod routes;

pub use routes::create_router;

use crate::models::HealthResponse;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;

/// Liveness endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now().timestamp(),
        service: "ridelens-gateway".to_string(),
    })
}
