//! Frame processor
//!
//! ## Responsibilities
//!
//! - Frame fingerprinting and near-duplicate suppression
//! - Result cache lookup and write-back
//! - Dispatch to the work queue with a bounded wait
//! - Feedback synthesis from scores
//! - Video job lifecycle (stub worker)
//! - Processing statistics

use crate::cache::{cache_key, CacheStats, CacheValue, MemoryCache};
use crate::error::{Error, Result};
use crate::inference_client::InferenceClient;
use crate::models::{AnalysisResult, Feedback, FeedbackKind, FrameRequest};
use crate::work_queue::{Handler, ProcessingQueue, QueueItem};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tokio::time::{Duration, Instant};

/// How long a frame fingerprint suppresses near-duplicates
const SIMILARITY_TTL: Duration = Duration::from_secs(5 * 60);

/// EWMA weight for the latency estimator
const LATENCY_ALPHA: f64 = 0.1;

/// Processor configuration
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub max_queue_size: usize,
    pub max_workers: usize,
    pub processing_timeout_secs: u64,
    pub skip_similar_frames: bool,
    pub similarity_threshold: f64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            max_workers: 4,
            processing_timeout_secs: 30,
            skip_similar_frames: true,
            similarity_threshold: 0.95,
        }
    }
}

/// Processing statistics
#[derive(Debug, Clone, Serialize)]
pub struct ProcessorStats {
    pub start_time: DateTime<Utc>,
    pub total_processed: u64,
    pub successfully_processed: u64,
    pub failed_processed: u64,
    pub average_latency_ms: f64,
    pub queue_size: usize,
    pub active_workers: usize,
}

/// Video job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

/// Background video analysis job, retained in memory for the process
/// lifetime
#[derive(Debug, Clone, Serialize)]
pub struct VideoJob {
    pub id: String,
    pub filename: String,
    pub status: JobStatus,
    pub progress: f64,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<AnalysisResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Central orchestrator between ingress and the inference service
pub struct FrameProcessor {
    inference: Arc<InferenceClient>,
    cache: Arc<MemoryCache>,
    queue: ProcessingQueue,
    config: RwLock<ProcessorConfig>,
    stats: RwLock<ProcessorStats>,
    jobs: Arc<RwLock<HashMap<String, VideoJob>>>,
    shut_down: AtomicBool,
}

impl FrameProcessor {
    /// Create a processor with default settings.
    pub fn new(inference: Arc<InferenceClient>, cache: Arc<MemoryCache>) -> Arc<Self> {
        Self::with_settings(inference, cache, ProcessorConfig::default())
    }

    /// Create a processor with explicit settings.
    pub fn with_settings(
        inference: Arc<InferenceClient>,
        cache: Arc<MemoryCache>,
        config: ProcessorConfig,
    ) -> Arc<Self> {
        let handler = Self::worker_handler(inference.clone());
        let queue = ProcessingQueue::new(config.max_queue_size, config.max_workers, handler);

        let stats = ProcessorStats {
            start_time: Utc::now(),
            total_processed: 0,
            successfully_processed: 0,
            failed_processed: 0,
            average_latency_ms: 0.0,
            queue_size: 0,
            active_workers: config.max_workers,
        };

        Arc::new(Self {
            inference,
            cache,
            queue,
            config: RwLock::new(config),
            stats: RwLock::new(stats),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Worker handler: one inference round-trip plus feedback synthesis.
    /// A null analysis becomes the neutral default.
    fn worker_handler(inference: Arc<InferenceClient>) -> Handler {
        Arc::new(move |request: FrameRequest| {
            let inference = inference.clone();
            async move {
                match inference.analyze(&request).await? {
                    Some(mut analysis) => {
                        analysis.feedback = synthesize_feedback(&analysis);
                        Ok(analysis)
                    }
                    None => Ok(neutral_result()),
                }
            }
            .boxed()
        })
    }

    /// Process one frame synchronously: cache hit, near-duplicate synthetic,
    /// or a bounded wait on the work queue.
    pub async fn process_frame(&self, request: FrameRequest) -> Result<AnalysisResult> {
        let started = Instant::now();
        {
            let mut stats = self.stats.write().await;
            stats.total_processed += 1;
        }

        let frame_hash = format!("{:x}", md5::compute(&request.image_data));
        let result_key = cache_key(&["frame", &frame_hash, &request.client_id]);

        match self.cache.get(&result_key).await {
            Ok(Some(CacheValue::Json(value))) => {
                match serde_json::from_value::<AnalysisResult>(value) {
                    Ok(result) => {
                        tracing::debug!(key = %result_key, "Cache hit for frame");
                        let mut stats = self.stats.write().await;
                        stats.successfully_processed += 1;
                        return Ok(result);
                    }
                    Err(e) => tracing::warn!(error = %e, "Discarding malformed cached result"),
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Cache lookup failed"),
        }

        let config = self.config.read().await.clone();
        if config.skip_similar_frames && self.is_similar_frame(&frame_hash).await {
            tracing::debug!("Skipping similar frame");
            return Ok(synthetic_cached_result());
        }

        let priority = calculate_priority(&request);
        let (sink, result_rx) = oneshot::channel();
        let item = QueueItem {
            request,
            sink,
            enqueued_at: Instant::now(),
            priority,
        };

        if !self.queue.enqueue(item) {
            let mut stats = self.stats.write().await;
            stats.failed_processed += 1;
            return Err(Error::QueueFull(
                "processing queue full, try again later".to_string(),
            ));
        }

        let deadline = Duration::from_secs(config.processing_timeout_secs);
        match tokio::time::timeout(deadline, result_rx).await {
            Ok(Ok(Ok(result))) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                {
                    let mut stats = self.stats.write().await;
                    if stats.average_latency_ms == 0.0 {
                        stats.average_latency_ms = elapsed_ms;
                    } else {
                        stats.average_latency_ms = LATENCY_ALPHA * elapsed_ms
                            + (1.0 - LATENCY_ALPHA) * stats.average_latency_ms;
                    }
                    stats.successfully_processed += 1;
                }

                match serde_json::to_value(&result) {
                    Ok(value) => {
                        let cache = self.cache.clone();
                        tokio::spawn(async move {
                            if let Err(e) = cache.set(&result_key, CacheValue::Json(value)).await {
                                tracing::warn!(error = %e, "Failed to cache result");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize result for cache"),
                }

                Ok(result)
            }
            Ok(Ok(Err(e))) => {
                let mut stats = self.stats.write().await;
                stats.failed_processed += 1;
                Err(e)
            }
            Ok(Err(_closed)) => {
                let mut stats = self.stats.write().await;
                stats.failed_processed += 1;
                Err(Error::Internal("result sink dropped".to_string()))
            }
            Err(_elapsed) => {
                let mut stats = self.stats.write().await;
                stats.failed_processed += 1;
                Err(Error::Timeout("processing timeout".to_string()))
            }
        }
    }

    /// Check the similarity fingerprint; an unseen hash is recorded in the
    /// background.
    async fn is_similar_frame(&self, frame_hash: &str) -> bool {
        let sim_key = cache_key(&["similarity", frame_hash]);
        match self.cache.exists(&sim_key).await {
            Ok(true) => true,
            Ok(false) => {
                let cache = self.cache.clone();
                tokio::spawn(async move {
                    let marker = CacheValue::Json(serde_json::Value::Bool(true));
                    if let Err(e) = cache.set_with_ttl(&sim_key, marker, SIMILARITY_TTL).await {
                        tracing::warn!(error = %e, "Failed to record frame fingerprint");
                    }
                });
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to check frame similarity");
                false
            }
        }
    }

    /// Start a background video job and return its id. The worker is a stub:
    /// frame extraction and aggregation are future work.
    pub async fn create_video_job(
        &self,
        video_data: Vec<u8>,
        filename: &str,
        client_id: &str,
    ) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let job_id = format!(
            "{:x}",
            md5::compute(format!("{}-{}-{}", filename, client_id, nanos).as_bytes())
        );

        let job = VideoJob {
            id: job_id.clone(),
            filename: filename.to_string(),
            status: JobStatus::Processing,
            progress: 0.0,
            start_time: Utc::now(),
            results: None,
            error: None,
        };

        {
            let mut jobs = self.jobs.write().await;
            jobs.insert(job_id.clone(), job);
        }

        let jobs = self.jobs.clone();
        let worker_job_id = job_id.clone();
        tokio::spawn(async move {
            tracing::info!(
                job_id = %worker_job_id,
                size = video_data.len(),
                "Video processing started"
            );

            // TODO(video): extract frames and feed them through the queue;
            // until then the job completes after a fixed delay.
            tokio::time::sleep(Duration::from_secs(2)).await;

            let mut jobs = jobs.write().await;
            if let Some(job) = jobs.get_mut(&worker_job_id) {
                job.status = JobStatus::Completed;
                job.progress = 100.0;
            }
        });

        job_id
    }

    /// Look up a video job by id.
    pub async fn job_status(&self, job_id: &str) -> Option<VideoJob> {
        let jobs = self.jobs.read().await;
        jobs.get(job_id).cloned()
    }

    /// Apply a configuration map. Integer fields are coerced from any JSON
    /// number.
    pub async fn update_config(&self, map: &serde_json::Map<String, serde_json::Value>) {
        let mut config = self.config.write().await;

        if let Some(v) = map.get("max_queue_size").and_then(as_usize) {
            config.max_queue_size = v;
        }
        if let Some(v) = map.get("max_workers").and_then(as_usize) {
            config.max_workers = v;
        }
        if let Some(v) = map.get("processing_timeout").and_then(as_usize) {
            config.processing_timeout_secs = v as u64;
        }

        tracing::info!(config = ?*config, "Configuration updated");
    }

    /// Get a snapshot of processing statistics
    pub async fn stats(&self) -> ProcessorStats {
        let queue_stats = self.queue.stats();
        let mut stats = self.stats.read().await.clone();
        stats.queue_size = queue_stats.size;
        stats.active_workers = queue_stats.workers;
        stats
    }

    /// Get cache statistics
    pub async fn cache_stats(&self) -> Result<CacheStats> {
        self.cache.stats().await
    }

    pub fn inference_client(&self) -> &Arc<InferenceClient> {
        &self.inference
    }

    /// Drain the queue and close the cache. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!("Shutting down frame processor");
        let queue_result = self.queue.shutdown(Duration::from_secs(30)).await;
        self.cache.close();
        queue_result?;

        tracing::info!("Frame processor shutdown complete");
        Ok(())
    }
}

fn as_usize(value: &serde_json::Value) -> Option<usize> {
    value
        .as_u64()
        .or_else(|| value.as_f64().map(|f| f as u64))
        .map(|v| v as usize)
}

/// Queue priority: recency and an identified client raise it.
fn calculate_priority(request: &FrameRequest) -> i32 {
    let mut priority = 1;

    if !request.client_id.is_empty() {
        priority += 1;
    }

    let age_ms = Utc::now().timestamp_millis() - request.timestamp;
    if age_ms < 1_000 {
        priority += 2;
    } else if age_ms < 5_000 {
        priority += 1;
    }

    priority
}

/// Derive feedback items from scores. Rules are independent and evaluated in
/// a fixed order.
pub fn synthesize_feedback(analysis: &AnalysisResult) -> Vec<Feedback> {
    let mut feedback = Vec::new();

    if analysis.posture_score < 70 {
        feedback.push(Feedback::new(
            FeedbackKind::Warning,
            "Improve your riding posture - keep your back straight and relax your shoulders",
            analysis.posture_score,
        ));
    } else if analysis.posture_score > 85 {
        feedback.push(Feedback::new(
            FeedbackKind::Success,
            "Excellent riding posture!",
            analysis.posture_score,
        ));
    }

    if analysis.lane_score < 60 {
        feedback.push(Feedback::new(
            FeedbackKind::Error,
            "Maintain better lane position - you're drifting",
            analysis.lane_score,
        ));
    }

    if analysis.speed_score < 65 {
        feedback.push(Feedback::new(
            FeedbackKind::Warning,
            "Adjust your speed for current road conditions",
            analysis.speed_score,
        ));
    }

    if analysis.overall_score > 80 {
        feedback.push(Feedback::new(
            FeedbackKind::Success,
            "Great riding! Keep up the good work",
            analysis.overall_score,
        ));
    }

    feedback
}

/// Neutral result substituted for a null analysis
fn neutral_result() -> AnalysisResult {
    AnalysisResult {
        overall_score: 50,
        posture_score: 50,
        lane_score: 50,
        speed_score: 50,
        annotations: Vec::new(),
        feedback: Vec::new(),
        metadata: serde_json::Map::new(),
        processing_time: 0.0,
        model_version: String::new(),
        timestamp: Utc::now().timestamp(),
    }
}

/// Synthetic result returned for near-duplicate frames
fn synthetic_cached_result() -> AnalysisResult {
    AnalysisResult {
        overall_score: 75,
        posture_score: 80,
        lane_score: 70,
        speed_score: 75,
        annotations: Vec::new(),
        feedback: vec![Feedback::new(
            FeedbackKind::Info,
            "Using cached result for similar frame",
            75,
        )],
        metadata: serde_json::Map::new(),
        processing_time: 0.0,
        model_version: String::new(),
        timestamp: Utc::now().timestamp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference_client::InferenceConfig;

    fn analysis(overall: i32, posture: i32, lane: i32, speed: i32) -> AnalysisResult {
        AnalysisResult {
            overall_score: overall,
            posture_score: posture,
            lane_score: lane,
            speed_score: speed,
            annotations: Vec::new(),
            feedback: Vec::new(),
            metadata: serde_json::Map::new(),
            processing_time: 0.0,
            model_version: String::new(),
            timestamp: 0,
        }
    }

    fn test_processor() -> Arc<FrameProcessor> {
        let inference =
            Arc::new(InferenceClient::new(InferenceConfig::default()).expect("client"));
        let cache = MemoryCache::new(100, Duration::from_secs(300));
        FrameProcessor::new(inference, cache)
    }

    #[test]
    fn test_feedback_low_posture_warning() {
        let feedback = synthesize_feedback(&analysis(50, 60, 70, 70));
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[0].kind, FeedbackKind::Warning);
        assert!(feedback[0].message.contains("posture"));
        assert_eq!(feedback[0].score, 60);
    }

    #[test]
    fn test_feedback_excellent_posture_success() {
        let feedback = synthesize_feedback(&analysis(50, 90, 70, 70));
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[0].kind, FeedbackKind::Success);
        assert_eq!(feedback[0].message, "Excellent riding posture!");
    }

    #[test]
    fn test_feedback_mid_posture_silent() {
        // 70..=85 triggers neither posture rule.
        let feedback = synthesize_feedback(&analysis(50, 75, 70, 70));
        assert!(feedback.is_empty());
    }

    #[test]
    fn test_feedback_all_rules_fire_in_order() {
        let feedback = synthesize_feedback(&analysis(85, 60, 50, 50));
        let kinds: Vec<FeedbackKind> = feedback.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![
                FeedbackKind::Warning, // posture
                FeedbackKind::Error,   // lane
                FeedbackKind::Warning, // speed
                FeedbackKind::Success, // overall
            ]
        );
        assert_eq!(feedback[3].message, "Great riding! Keep up the good work");
    }

    #[test]
    fn test_feedback_great_riding_only() {
        let feedback = synthesize_feedback(&analysis(90, 80, 90, 90));
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[0].message, "Great riding! Keep up the good work");
        assert_eq!(feedback[0].score, 90);
    }

    #[test]
    fn test_synthetic_result_shape() {
        let result = synthetic_cached_result();
        assert_eq!(
            (
                result.overall_score,
                result.posture_score,
                result.lane_score,
                result.speed_score
            ),
            (75, 80, 70, 75)
        );
        assert_eq!(result.feedback.len(), 1);
        assert_eq!(result.feedback[0].kind, FeedbackKind::Info);
    }

    #[test]
    fn test_priority_recency_and_identity() {
        let fresh = FrameRequest::new(vec![1], Utc::now().timestamp_millis(), "client-a");
        assert_eq!(calculate_priority(&fresh), 4);

        let fresh_anonymous = FrameRequest::new(vec![1], Utc::now().timestamp_millis(), "");
        assert_eq!(calculate_priority(&fresh_anonymous), 3);

        let aged = FrameRequest::new(vec![1], Utc::now().timestamp_millis() - 3_000, "client-a");
        assert_eq!(calculate_priority(&aged), 3);

        let stale = FrameRequest::new(vec![1], Utc::now().timestamp_millis() - 60_000, "client-a");
        assert_eq!(calculate_priority(&stale), 2);
    }

    #[tokio::test]
    async fn test_update_config_coerces_numbers() {
        let processor = test_processor();

        let map = serde_json::json!({
            "max_queue_size": 64,
            "max_workers": 2.0,
            "processing_timeout": 15,
            "unrelated": "ignored"
        });
        processor
            .update_config(map.as_object().unwrap())
            .await;

        let config = processor.config.read().await;
        assert_eq!(config.max_queue_size, 64);
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.processing_timeout_secs, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_job_lifecycle() {
        let processor = test_processor();

        let job_id = processor
            .create_video_job(vec![0u8; 16], "ride.mp4", "client-a")
            .await;
        assert_eq!(job_id.len(), 32);

        let job = processor.job_status(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.progress, 0.0);
        assert_eq!(job.filename, "ride.mp4");

        tokio::time::sleep(Duration::from_secs(3)).await;

        let job = processor.job_status(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100.0);

        assert!(processor.job_status("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let processor = test_processor();
        assert!(processor.shutdown().await.is_ok());
        assert!(processor.shutdown().await.is_ok());
    }
}
