//! API routes

use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use tokio::time::Instant;

use crate::auth::RequireAdmin;
use crate::data_url::decode_data_url;
use crate::error::{Error, Result};
use crate::models::FrameRequest;
use crate::rate_limiter::rate_limit_middleware;
use crate::session_manager::ws_handler;
use crate::state::AppState;

/// Upload ceiling for video jobs
const MAX_VIDEO_SIZE: usize = 100 * 1024 * 1024;
/// Body limit for the upload route; leaves room for multipart framing
const UPLOAD_BODY_LIMIT: usize = MAX_VIDEO_SIZE + 1024 * 1024;

const VIDEO_EXTENSIONS: [&str; 5] = [".mp4", ".avi", ".mov", ".mkv", ".webm"];

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let streaming = Router::new()
        .route("/ws", get(ws_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

    let protected = Router::new()
        .route("/analyze-frame", post(analyze_frame))
        .route(
            "/upload-video",
            post(upload_video).layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT)),
        )
        .route("/video-job/{job_id}", get(video_job_status))
        .route("/stats", get(get_stats))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

    let admin = Router::new()
        .route("/stats", get(admin_stats))
        .route("/cache-stats", get(admin_cache_stats));

    let api_v1 = Router::new()
        .route("/health", get(super::health_check))
        .merge(protected)
        .nest("/admin", admin);

    Router::new()
        .route("/health", get(super::health_check))
        .merge(streaming)
        .nest("/api/v1", api_v1)
        .with_state(state)
}

// ========================================
// Frame Analysis
// ========================================

#[derive(Debug, Deserialize)]
struct FrameUploadRequest {
    image_data: String,
    #[serde(default)]
    timestamp: i64,
}

async fn analyze_frame(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<FrameUploadRequest>,
) -> Result<impl IntoResponse> {
    let started = Instant::now();
    {
        let mut stats = state.system_stats.write().await;
        stats.total_frames += 1;
    }

    let image_data = match decode_data_url(&request.image_data) {
        Ok(data) if !data.is_empty() => data,
        Ok(_) | Err(_) => {
            let mut stats = state.system_stats.write().await;
            stats.processed_error += 1;
            return Err(Error::Validation("Invalid image data".to_string()));
        }
    };

    let frame_request = FrameRequest::new(image_data, request.timestamp, addr.ip().to_string());

    let result = match state.processor.process_frame(frame_request).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(error = %e, client_id = %addr.ip(), "Frame processing failed");
            let mut stats = state.system_stats.write().await;
            stats.processed_error += 1;
            return Err(e);
        }
    };

    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    {
        let mut stats = state.system_stats.write().await;
        stats.record_latency(elapsed_ms);
        stats.processed_ok += 1;
    }

    Ok(Json(json!({
        "analysis": result,
        "processing_time_ms": elapsed_ms as u64,
        "timestamp": Utc::now().timestamp(),
    })))
}

// ========================================
// Statistics
// ========================================

async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(stats_payload(&state).await)
}

async fn admin_stats(
    RequireAdmin(user): RequireAdmin,
    State(state): State<AppState>,
) -> impl IntoResponse {
    tracing::debug!(subject = %user.subject, "Admin stats request");
    Json(stats_payload(&state).await)
}

async fn stats_payload(state: &AppState) -> serde_json::Value {
    let system = {
        let mut stats = state.system_stats.write().await;
        stats.last_updated = Utc::now();
        stats.clone()
    };
    let processor = state.processor.stats().await;

    let (success_rate, error_rate) = if system.total_frames > 0 {
        (
            system.processed_ok as f64 / system.total_frames as f64 * 100.0,
            system.processed_error as f64 / system.total_frames as f64 * 100.0,
        )
    } else {
        (0.0, 0.0)
    };
    let uptime_seconds = (Utc::now() - processor.start_time).num_seconds().max(0);

    json!({
        "system": system,
        "processor": processor,
        "metrics": {
            "success_rate": success_rate,
            "error_rate": error_rate,
            "uptime_seconds": uptime_seconds,
        },
    })
}

async fn admin_cache_stats(
    RequireAdmin(user): RequireAdmin,
    State(state): State<AppState>,
) -> Result<impl IntoResponse> {
    tracing::debug!(subject = %user.subject, "Admin cache stats request");
    let stats = state.processor.cache_stats().await?;
    Ok(Json(stats))
}

// ========================================
// Video Jobs
// ========================================

async fn upload_video(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Validation(format!("Invalid multipart body: {}", e)))?
    {
        if field.name() != Some("video") {
            continue;
        }

        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| Error::Validation("Missing filename".to_string()))?;
        if !is_valid_video_file(&filename) {
            return Err(Error::Validation("Invalid file type".to_string()));
        }

        let data = field
            .bytes()
            .await
            .map_err(|e| Error::Validation(format!("Failed to read uploaded file: {}", e)))?;
        if data.len() > MAX_VIDEO_SIZE {
            return Err(Error::Validation("File too large (max 100MB)".to_string()));
        }

        let job_id = state
            .processor
            .create_video_job(data.to_vec(), &filename, &addr.ip().to_string())
            .await;

        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "job_id": job_id,
                "message": "Video upload successful, processing started",
                "status": "processing",
            })),
        ));
    }

    Err(Error::Validation("No file uploaded".to_string()))
}

async fn video_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse> {
    match state.processor.job_status(&job_id).await {
        Some(job) => Ok(Json(job)),
        None => Err(Error::NotFound("Job not found".to_string())),
    }
}

fn is_valid_video_file(filename: &str) -> bool {
    let filename = filename.to_lowercase();
    VIDEO_EXTENSIONS.iter().any(|ext| filename.ends_with(ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_extension_validation() {
        assert!(is_valid_video_file("ride.mp4"));
        assert!(is_valid_video_file("RIDE.MOV"));
        assert!(is_valid_video_file("commute.webm"));
        assert!(!is_valid_video_file("notes.txt"));
        assert!(!is_valid_video_file("ride.mp4.exe"));
        assert!(!is_valid_video_file("mp4"));
    }
}
