use std::sync::Arc;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use carrier_verify::app_state::{AppState, ServiceSettings};
use carrier_verify::config::AppConfig;
use carrier_verify::db;
use carrier_verify::routes;
use carrier_verify::services::{
    broadcaster::ProgressBroadcaster,
    dedup::SubjectLocks,
    executor::JobExecutor,
    gateway::Gateway,
    queue::JobQueue,
    rate_limit::{RateLimiter, RedisRateLimiter, SlidingWindowLimiter},
    store::{JobStore, MemoryJobStore},
    verifier::{HttpVerifier, Verifier},
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing carrier-verify server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_histogram!(
        "verification_processing_seconds",
        "Time to run a carrier verification job"
    );
    metrics::describe_counter!(
        "verification_jobs_total",
        "Total verification jobs created"
    );
    metrics::describe_counter!(
        "verification_jobs_completed",
        "Total verification jobs completed"
    );
    metrics::describe_counter!(
        "verification_jobs_failed",
        "Total verification jobs that failed"
    );
    metrics::describe_counter!(
        "verification_submissions_conflicted",
        "Submissions refused because the subject already had an active job"
    );
    metrics::describe_counter!(
        "verification_submissions_rate_limited",
        "Submissions refused by the per-subject rate limit"
    );
    metrics::describe_gauge!(
        "verification_queue_depth",
        "Current number of pending jobs in the queue"
    );

    let store: Arc<dyn JobStore> = match &config.database_url {
        Some(database_url) => {
            let key = config
                .encryption_key
                .as_deref()
                .expect("ENCRYPTION_KEY is required when DATABASE_URL is set");

            // Subjects are sealed with AES-256-GCM before they reach the database
            tracing::info!("Connecting to PostgreSQL job store");
            Arc::new(
                db::connect_job_store(database_url, key)
                    .await
                    .expect("Failed to initialize PostgreSQL job store"),
            )
        }
        None => {
            tracing::warn!("DATABASE_URL not set; jobs are kept in memory only");
            Arc::new(MemoryJobStore::new())
        }
    };

    let limiter: Arc<dyn RateLimiter> = match &config.redis_url {
        Some(redis_url) => {
            tracing::info!("Connecting to Redis rate limiter");
            Arc::new(
                RedisRateLimiter::new(redis_url, config.rate_limit_policy())
                    .expect("Failed to initialize rate limiter"),
            )
        }
        None => Arc::new(SlidingWindowLimiter::new(config.rate_limit_policy())),
    };

    // Initialize verification automation client
    tracing::info!(verifier_url = %config.verifier_url, "Initializing verifier client");
    let verifier: Arc<dyn Verifier> = Arc::new(
        HttpVerifier::new(&config.verifier_url, config.verifier_api_token.clone())
            .expect("Failed to initialize verifier client"),
    );

    let queue = Arc::new(JobQueue::new());
    let locks = Arc::new(SubjectLocks::new());
    let broadcaster = Arc::new(ProgressBroadcaster::new());

    let executor = Arc::new(JobExecutor::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&locks),
        Arc::clone(&broadcaster),
        Arc::clone(&verifier),
        config.job_timeout(),
    ));
    executor
        .recover()
        .await
        .expect("Failed to start verification worker (is another instance running?)");
    executor.spawn();

    let gateway = Arc::new(Gateway::new(
        store,
        locks,
        queue,
        limiter,
        broadcaster,
        verifier,
    ));
    let state = AppState::new(gateway, ServiceSettings::from_config(&config));

    // Build API routes
    let app = routes::api_router(state)
        // Prometheus metrics endpoint (separate state)
        .merge(
            Router::new().route(
                "/metrics",
                get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
            ),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(10 * 1024 * 1024)); // 10 MB limit

    tracing::info!("Starting carrier-verify on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Server error");
}
