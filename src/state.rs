//! Application configuration and shared state

use crate::auth::JwtConfig;
use crate::frame_processor::{FrameProcessor, ProcessorConfig};
use crate::inference_client::InferenceConfig;
use crate::models::SystemStats;
use crate::rate_limiter::RateLimiter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// HTTP server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    /// Streaming session silence budget; refreshed on each pong
    pub session_read_deadline: Duration,
    /// Protocol ping cadence on streaming sessions
    pub session_ping_interval: Duration,
}

/// Security and admission settings
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub jwt_secret: String,
    pub allowed_origins: Vec<String>,
    pub rate_limit_rps: u32,
    pub rate_limit_burst: u32,
    pub max_request_size: usize,
    pub request_timeout: Duration,
}

/// Result cache settings
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_size: usize,
}

/// Application configuration, loaded from the environment
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub inference: InferenceConfig,
    pub security: SecurityConfig,
    pub cache: CacheConfig,
    pub processor: ProcessorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: get_env("SERVER_HOST", "0.0.0.0"),
                port: get_env_parsed("SERVER_PORT", 8080),
                read_timeout: Duration::from_secs(get_env_parsed("SERVER_READ_TIMEOUT_SECS", 15)),
                write_timeout: Duration::from_secs(get_env_parsed("SERVER_WRITE_TIMEOUT_SECS", 15)),
                idle_timeout: Duration::from_secs(get_env_parsed("SERVER_IDLE_TIMEOUT_SECS", 60)),
                session_read_deadline: Duration::from_secs(get_env_parsed(
                    "SESSION_READ_DEADLINE_SECS",
                    60,
                )),
                session_ping_interval: Duration::from_secs(get_env_parsed(
                    "SESSION_PING_INTERVAL_SECS",
                    54,
                )),
            },
            inference: InferenceConfig {
                base_url: get_env("INFERENCE_BASE_URL", "http://localhost:5000"),
                timeout: Duration::from_secs(get_env_parsed("INFERENCE_TIMEOUT_SECS", 30)),
                max_retries: get_env_parsed("INFERENCE_MAX_RETRIES", 3),
                retry_delay: Duration::from_millis(get_env_parsed("INFERENCE_RETRY_DELAY_MS", 1000)),
                health_check_interval: Duration::from_secs(get_env_parsed(
                    "INFERENCE_HEALTH_CHECK_INTERVAL_SECS",
                    30,
                )),
            },
            security: SecurityConfig {
                jwt_secret: get_env("JWT_SECRET", ""),
                allowed_origins: get_env_list("ALLOWED_ORIGINS", &["*"]),
                rate_limit_rps: get_env_parsed("RATE_LIMIT_RPS", 100),
                rate_limit_burst: get_env_parsed("RATE_LIMIT_BURST", 200),
                max_request_size: get_env_parsed("MAX_REQUEST_SIZE", 10 * 1024 * 1024),
                request_timeout: Duration::from_secs(get_env_parsed("REQUEST_TIMEOUT_SECS", 30)),
            },
            cache: CacheConfig {
                ttl: Duration::from_secs(get_env_parsed("CACHE_TTL_SECS", 300)),
                max_size: get_env_parsed("CACHE_MAX_SIZE", 1000),
            },
            processor: ProcessorConfig {
                max_queue_size: get_env_parsed("PROCESSOR_QUEUE_SIZE", 100),
                max_workers: get_env_parsed("PROCESSOR_WORKERS", 4),
                processing_timeout_secs: get_env_parsed("PROCESSING_TIMEOUT_SECS", 30),
                skip_similar_frames: get_env_parsed("SKIP_SIMILAR_FRAMES", true),
                similarity_threshold: get_env_parsed("SIMILARITY_THRESHOLD", 0.95),
            },
        }
    }
}

impl AppConfig {
    /// Check the configuration; collects every violation before failing.
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server port must be non-zero".to_string());
        }
        if self.inference.base_url.is_empty() {
            errors.push("inference base URL is required".to_string());
        }
        if self.security.max_request_size == 0 {
            errors.push("max request size must be positive".to_string());
        }
        if self.security.rate_limit_burst == 0 {
            errors.push("rate limit burst must be positive".to_string());
        }
        if self.processor.max_workers == 0 {
            errors.push("processor worker count must be positive".to_string());
        }
        if self.security.jwt_secret.is_empty() {
            tracing::warn!("JWT secret not set; admin endpoints will reject all tokens");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(format!(
                "configuration validation failed: {}",
                errors.join(", ")
            ))
        }
    }
}

fn get_env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn get_env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value.split(',').map(|s| s.trim().to_string()).collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// Frame processor (queue + cache + inference)
    pub processor: Arc<FrameProcessor>,
    /// Rate limiter
    pub rate_limiter: Arc<RateLimiter>,
    /// Gateway-side request counters
    pub system_stats: Arc<RwLock<SystemStats>>,
    /// JWT configuration for admin endpoints
    pub jwt: JwtConfig,
}
