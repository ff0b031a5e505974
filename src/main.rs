//! RideLens Gateway
//!
//! Main entry point for the frame-analysis gateway.

use ridelens_gateway::{
    auth::JwtConfig,
    cache::MemoryCache,
    frame_processor::FrameProcessor,
    inference_client::InferenceClient,
    models::SystemStats,
    rate_limiter::RateLimiter,
    state::{AppConfig, AppState},
    web_api,
};
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ridelens_gateway=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting RideLens Gateway v{}", env!("CARGO_PKG_VERSION"));

    // Load and validate configuration
    let config = AppConfig::default();
    config.validate().map_err(|e| anyhow::anyhow!(e))?;
    tracing::info!(
        inference_url = %config.inference.base_url,
        cache_max_size = config.cache.max_size,
        workers = config.processor.max_workers,
        "Configuration loaded"
    );

    // Root cancellation for background sweeps
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Initialize components
    let cache = MemoryCache::new(config.cache.max_size, config.cache.ttl);

    let inference = Arc::new(InferenceClient::new(config.inference.clone())?);
    if let Err(e) = inference.health().await {
        tracing::warn!(error = %e, "Inference service not available at startup");
    }
    inference.clone().spawn_health_loop(shutdown_tx.subscribe());

    let processor = FrameProcessor::with_settings(inference, cache, config.processor.clone());
    tracing::info!("Frame processor initialized");

    let rate_limiter = RateLimiter::new(
        config.security.rate_limit_rps,
        config.security.rate_limit_burst,
    );

    // Create application state
    let state = AppState {
        processor: processor.clone(),
        rate_limiter: rate_limiter.clone(),
        system_stats: Arc::new(RwLock::new(SystemStats::default())),
        jwt: JwtConfig {
            secret: config.security.jwt_secret.clone(),
        },
        config: config.clone(),
    };

    // Create router
    let app = web_api::create_router(state)
        .layer(cors_layer(&config.security.allowed_origins))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(config.security.max_request_size));

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Shutting down server...");

    let _ = shutdown_tx.send(());
    if let Err(e) = processor.shutdown().await {
        tracing::error!(error = %e, "Failed to shut down frame processor");
    }
    rate_limiter.shutdown();

    tracing::info!("Server exited");
    Ok(())
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.iter().any(|origin| origin == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
