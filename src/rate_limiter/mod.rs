//! Token-bucket admission control
//!
//! ## Responsibilities
//!
//! - Per-client token buckets with burst capacity
//! - Background reaper for idle buckets
//! - Axum middleware returning 429 with a retry-after advisory
//!
//! The limiter is keyed by client identity (remote address) and does not
//! coordinate across processes.

use crate::error::Error;
use crate::state::AppState;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::{Duration, Instant};

/// Reaper wake-up interval
const REAP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Idle age after which a bucket is dropped
const MAX_IDLE: Duration = Duration::from_secs(10 * 60);

/// One client's bucket
struct ClientBucket {
    tokens: u32,
    last_refill: Instant,
}

impl ClientBucket {
    fn spend(&mut self, rps: u32, burst: u32) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);

        let refill = (elapsed.as_secs_f64() * rps as f64) as u32;
        self.tokens = (self.tokens + refill).min(burst);
        self.last_refill = now;

        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

/// Token-bucket rate limiter
pub struct RateLimiter {
    clients: RwLock<HashMap<String, Arc<Mutex<ClientBucket>>>>,
    default_rps: u32,
    default_burst: u32,
    shutdown_tx: broadcast::Sender<()>,
}

impl RateLimiter {
    /// Create the limiter and start its reaper task.
    pub fn new(default_rps: u32, default_burst: u32) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let limiter = Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            default_rps,
            default_burst,
            shutdown_tx,
        });

        let reaper = limiter.clone();
        let mut shutdown_rx = reaper.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        reaper.remove_idle(MAX_IDLE).await;
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Rate limiter reaper stopped");
                        break;
                    }
                }
            }
        });

        limiter
    }

    /// Check admission for a client under the default rate.
    pub async fn allow(&self, client_id: &str) -> bool {
        self.allow_with(client_id, self.default_rps, self.default_burst)
            .await
    }

    /// Check admission for a client under an explicit rate.
    pub async fn allow_with(&self, client_id: &str, rps: u32, burst: u32) -> bool {
        let bucket = {
            let clients = self.clients.read().await;
            clients.get(client_id).cloned()
        };

        let bucket = match bucket {
            Some(bucket) => bucket,
            None => {
                let mut clients = self.clients.write().await;
                clients
                    .entry(client_id.to_string())
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(ClientBucket {
                            tokens: burst,
                            last_refill: Instant::now(),
                        }))
                    })
                    .clone()
            }
        };

        let mut bucket = bucket.lock().await;
        bucket.spend(rps, burst)
    }

    /// Drop buckets idle longer than `max_idle`.
    pub async fn remove_idle(&self, max_idle: Duration) {
        let now = Instant::now();
        let mut clients = self.clients.write().await;
        let before = clients.len();

        let mut stale = Vec::new();
        for (client_id, bucket) in clients.iter() {
            let bucket = bucket.lock().await;
            if now.duration_since(bucket.last_refill) > max_idle {
                stale.push(client_id.clone());
            }
        }
        for client_id in stale {
            clients.remove(&client_id);
        }

        let removed = before - clients.len();
        if removed > 0 {
            tracing::debug!(removed = removed, "Reaped idle rate-limit buckets");
        }
    }

    /// Number of tracked clients
    pub async fn active_clients(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Stop the reaper task.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Axum middleware: admit or refuse by remote address.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let client_id = addr.ip().to_string();

    if !state.rate_limiter.allow(&client_id).await {
        tracing::warn!(
            client_id = %client_id,
            path = %request.uri().path(),
            "Rate limit exceeded"
        );
        return Error::RateLimited.into_response();
    }

    next.run(request).await
}
