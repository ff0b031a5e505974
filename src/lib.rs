//! RideLens Gateway Library
//!
//! Real-time riding-frame analysis gateway.
//!
//! ## Architecture
//!
//! 1. Cache - content-addressed result store (TTL + LRU)
//! 2. InferenceClient - external analyzer adapter with retries
//! 3. WorkQueue - bounded FIFO with a fixed worker pool
//! 4. FrameProcessor - dedup, dispatch, feedback synthesis, video jobs
//! 5. RateLimiter - per-client token buckets
//! 6. SessionManager - WebSocket streaming sessions
//! 7. WebAPI - one-shot and admin HTTP endpoints
//!
//! The gateway performs no ML computation; analysis comes from an external
//! inference service and is cached, deduplicated, and fanned back out to
//! clients.

pub mod auth;
pub mod cache;
pub mod data_url;
pub mod error;
pub mod frame_processor;
pub mod inference_client;
pub mod models;
pub mod rate_limiter;
pub mod session_manager;
pub mod state;
pub mod web_api;
pub mod work_queue;

pub use error::{Error, Result};
pub use state::AppState;
