//! Inference service client
//!
//! ## Responsibilities
//!
//! - Send frame analysis requests to the external inference service
//! - Retry transport-level failures with linear backoff
//! - Translate the wire response into the internal result type
//! - Periodic health checks

use crate::error::{Error, Result};
use crate::models::{AnalysisResult, Annotation, FrameRequest};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Duration;

/// Inference client configuration
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub base_url: String,
    /// Deadline for one whole analyze attempt sequence
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub health_check_interval: Duration,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

/// Wire request for POST /analyze
#[derive(Debug, Serialize)]
struct AnalyzeRequest {
    /// Base64-encoded JPEG bytes
    image_data: String,
    timestamp: i64,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    config: serde_json::Map<String, serde_json::Value>,
}

/// Wire response from POST /analyze
#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    #[serde(default)]
    overall_score: i32,
    #[serde(default)]
    posture_score: i32,
    #[serde(default)]
    lane_score: i32,
    #[serde(default)]
    speed_score: i32,

    #[serde(default)]
    detections: Vec<ObjectDetection>,

    #[serde(default)]
    pose_keypoints: Vec<PoseKeypoint>,

    #[serde(default)]
    scene_analysis: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    processing_time: f64,

    #[serde(default)]
    model_version: String,
}

#[derive(Debug, Deserialize)]
struct ObjectDetection {
    class: String,
    confidence: f64,
    bounding_box: WireBBox,
}

#[derive(Debug, Deserialize)]
struct WireBBox {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

#[derive(Debug, Deserialize)]
struct PoseKeypoint {
    name: String,
    x: f64,
    y: f64,
    confidence: f64,
    #[serde(default)]
    visible: bool,
}

/// HTTP client to the external inference service
pub struct InferenceClient {
    client: reqwest::Client,
    config: InferenceConfig,
}

impl InferenceClient {
    /// Create a new inference client
    pub fn new(config: InferenceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent("ridelens-gateway/0.3")
            .build()
            .map_err(Error::Http)?;

        Ok(Self { client, config })
    }

    /// Analyze one frame. The whole attempt sequence (including retries and
    /// backoff) is bounded by the configured timeout. Transport errors and
    /// non-2xx responses are retried; a malformed payload is a hard error.
    /// A JSON `null` body yields `Ok(None)`.
    pub async fn analyze(&self, request: &FrameRequest) -> Result<Option<AnalysisResult>> {
        let mut config = serde_json::Map::new();
        config.insert(
            "client_id".to_string(),
            serde_json::Value::String(request.client_id.clone()),
        );

        let wire_request = AnalyzeRequest {
            image_data: base64::engine::general_purpose::STANDARD.encode(&request.image_data),
            timestamp: request.timestamp,
            config,
        };

        tokio::time::timeout(self.config.timeout, self.analyze_with_retry(&wire_request))
            .await
            .map_err(|_| Error::Timeout("inference request deadline exceeded".to_string()))?
    }

    async fn analyze_with_retry(
        &self,
        wire_request: &AnalyzeRequest,
    ) -> Result<Option<AnalysisResult>> {
        let url = format!("{}/analyze", self.config.base_url);
        let mut last_error: Option<Error> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tracing::warn!(
                    attempt = attempt,
                    error = %last_error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                    "Retrying inference request"
                );
                tokio::time::sleep(self.config.retry_delay * attempt).await;
            }

            let response = match self.client.post(&url).json(wire_request).send().await {
                Ok(response) => response,
                Err(e) => {
                    last_error = Some(Error::Http(e));
                    continue;
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                last_error = Some(Error::Inference(format!(
                    "inference service error (status {}): {}",
                    status, body
                )));
                continue;
            }

            // Malformed payloads are not retried.
            let payload: Option<AnalyzeResponse> = response
                .json()
                .await
                .map_err(|e| Error::Inference(format!("failed to decode response: {}", e)))?;

            return Ok(payload.map(translate_response));
        }

        Err(last_error.unwrap_or_else(|| {
            Error::Inference("inference request failed without attempts".to_string())
        }))
    }

    /// Check service health: GET /health must return 2xx.
    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/health", self.config.base_url);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(Error::Inference(format!(
                "inference service unhealthy (status {})",
                response.status()
            )));
        }
        Ok(())
    }

    /// Fetch model metadata: GET /models/info.
    pub async fn model_info(&self) -> Result<serde_json::Value> {
        let url = format!("{}/models/info", self.config.base_url);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(Error::Inference(format!(
                "model info request failed (status {})",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }

    /// Push a configuration map to the inference service: PUT /config.
    pub async fn update_config(&self, config: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        let url = format!("{}/config", self.config.base_url);
        let response = self.client.put(&url).json(config).send().await?;

        if !response.status().is_success() {
            return Err(Error::Inference(format!(
                "config update failed (status {})",
                response.status()
            )));
        }

        tracing::info!("Inference service configuration updated");
        Ok(())
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Start the periodic health check task. Failures are logged; the client
    /// is never disabled.
    pub fn spawn_health_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let client = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(client.config.health_check_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match client.health().await {
                            Ok(()) => tracing::debug!("Inference service health check passed"),
                            Err(e) => tracing::error!(error = %e, "Inference service health check failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Inference health check task stopped");
                        break;
                    }
                }
            }
        });
    }
}

/// Translate a wire response into the internal result type. Scores are
/// clamped to [0,100]; only visible keypoints above the confidence floor are
/// kept; scene fields land in metadata.
fn translate_response(wire: AnalyzeResponse) -> AnalysisResult {
    let mut annotations = Vec::new();

    for detection in wire.detections {
        annotations.push(Annotation::BoundingBox {
            x: detection.bounding_box.x,
            y: detection.bounding_box.y,
            width: detection.bounding_box.width,
            height: detection.bounding_box.height,
            label: detection.class,
            confidence: detection.confidence,
        });
    }

    for keypoint in wire.pose_keypoints {
        if keypoint.visible && keypoint.confidence > 0.5 {
            annotations.push(Annotation::Keypoint {
                x: keypoint.x,
                y: keypoint.y,
                label: keypoint.name,
                confidence: keypoint.confidence,
            });
        }
    }

    AnalysisResult {
        overall_score: wire.overall_score.clamp(0, 100),
        posture_score: wire.posture_score.clamp(0, 100),
        lane_score: wire.lane_score.clamp(0, 100),
        speed_score: wire.speed_score.clamp(0, 100),
        annotations,
        feedback: Vec::new(),
        metadata: wire.scene_analysis,
        processing_time: wire.processing_time,
        model_version: wire.model_version,
        timestamp: chrono::Utc::now().timestamp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_response() -> AnalyzeResponse {
        serde_json::from_value(serde_json::json!({
            "overall_score": 88,
            "posture_score": 120,
            "lane_score": -5,
            "speed_score": 70,
            "detections": [
                {
                    "class": "motorcycle",
                    "confidence": 0.97,
                    "bounding_box": {"x": 10.0, "y": 20.0, "width": 30.0, "height": 40.0}
                }
            ],
            "pose_keypoints": [
                {"name": "left_wrist", "x": 1.0, "y": 2.0, "confidence": 0.9, "visible": true},
                {"name": "right_wrist", "x": 3.0, "y": 4.0, "confidence": 0.4, "visible": true},
                {"name": "left_knee", "x": 5.0, "y": 6.0, "confidence": 0.9, "visible": false}
            ],
            "scene_analysis": {"road_type": "highway", "lane_count": 3},
            "processing_time": 42.5,
            "model_version": "v2.1"
        }))
        .unwrap()
    }

    #[test]
    fn test_translate_clamps_scores() {
        let result = translate_response(wire_response());
        assert_eq!(result.overall_score, 88);
        assert_eq!(result.posture_score, 100);
        assert_eq!(result.lane_score, 0);
        assert_eq!(result.speed_score, 70);
    }

    #[test]
    fn test_translate_filters_keypoints() {
        let result = translate_response(wire_response());

        let keypoints: Vec<_> = result
            .annotations
            .iter()
            .filter(|a| matches!(a, Annotation::Keypoint { .. }))
            .collect();
        assert_eq!(keypoints.len(), 1);
        assert!(matches!(
            keypoints[0],
            Annotation::Keypoint { label, .. } if label.as_str() == "left_wrist"
        ));

        let boxes: Vec<_> = result
            .annotations
            .iter()
            .filter(|a| matches!(a, Annotation::BoundingBox { .. }))
            .collect();
        assert_eq!(boxes.len(), 1);
    }

    #[test]
    fn test_translate_scene_into_metadata() {
        let result = translate_response(wire_response());
        assert_eq!(result.metadata["road_type"], "highway");
        assert_eq!(result.metadata["lane_count"], 3);
        assert_eq!(result.model_version, "v2.1");
        assert_eq!(result.processing_time, 42.5);
    }

    #[test]
    fn test_null_body_decodes_to_none() {
        let payload: Option<AnalyzeResponse> = serde_json::from_str("null").unwrap();
        assert!(payload.is_none());
    }
}
