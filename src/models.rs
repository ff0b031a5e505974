//! Shared models and types
//!
//! This module contains types shared across multiple modules
//! to avoid circular dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One frame submitted for analysis. Created per ingress, immutable
/// thereafter.
#[derive(Debug, Clone)]
pub struct FrameRequest {
    /// Raw JPEG bytes (already decoded from the data URL)
    pub image_data: Vec<u8>,
    /// Client capture timestamp in milliseconds
    pub timestamp: i64,
    /// Opaque client identity (typically the remote address)
    pub client_id: String,
    /// Free-form attributes
    pub metadata: HashMap<String, serde_json::Value>,
}

impl FrameRequest {
    pub fn new(image_data: Vec<u8>, timestamp: i64, client_id: impl Into<String>) -> Self {
        Self {
            image_data,
            timestamp,
            client_id: client_id.into(),
            metadata: HashMap::new(),
        }
    }
}

/// Structured analysis for one frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub overall_score: i32,
    pub posture_score: i32,
    pub lane_score: i32,
    pub speed_score: i32,

    #[serde(default)]
    pub annotations: Vec<Annotation>,

    #[serde(default)]
    pub feedback: Vec<Feedback>,

    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    /// Model-side processing time in milliseconds
    #[serde(default)]
    pub processing_time: f64,

    #[serde(default)]
    pub model_version: String,

    /// Result timestamp in seconds
    pub timestamp: i64,
}

/// Visual annotation attached to a result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Annotation {
    BoundingBox {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        label: String,
        confidence: f64,
    },
    Keypoint {
        x: f64,
        y: f64,
        label: String,
        confidence: f64,
    },
}

/// Feedback severity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    Info,
    Success,
    Warning,
    Error,
}

/// A short textual message derived deterministically from scores
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feedback {
    #[serde(rename = "type")]
    pub kind: FeedbackKind,
    pub message: String,
    pub score: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

impl Feedback {
    pub fn new(kind: FeedbackKind, message: impl Into<String>, score: i32) -> Self {
        Self {
            kind,
            message: message.into(),
            score,
            category: None,
            priority: None,
        }
    }
}

/// Gateway-side request counters for the stats endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub total_frames: u64,
    pub processed_ok: u64,
    pub processed_error: u64,
    pub avg_process_time_ms: f64,
    pub last_updated: DateTime<Utc>,
    pub active_clients: u64,
}

impl Default for SystemStats {
    fn default() -> Self {
        Self {
            total_frames: 0,
            processed_ok: 0,
            processed_error: 0,
            avg_process_time_ms: 0.0,
            last_updated: Utc::now(),
            active_clients: 0,
        }
    }
}

impl SystemStats {
    /// Fold one observed latency into the moving average
    pub fn record_latency(&mut self, elapsed_ms: f64) {
        if self.avg_process_time_ms == 0.0 {
            self.avg_process_time_ms = elapsed_ms;
        } else {
            let alpha = 0.1;
            self.avg_process_time_ms = alpha * elapsed_ms + (1.0 - alpha) * self.avg_process_time_ms;
        }
    }
}

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: i64,
    pub service: String,
}
