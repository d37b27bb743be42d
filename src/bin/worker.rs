use axum::{routing::get, routing::post, Router};
use bulk_mail_jobs::{
    app_state::AppState,
    config::AppConfig,
    db::{self, cache_queries::PgVerificationCache, queries::PgJobStore},
    routes,
    services::{
        batch::BatchProcessor,
        generator::PatternGenerator,
        handlers::{
            generate::GenerateHandler, scrape::ScrapeHandler, verify::VerifyHandler,
            HandlerRegistry,
        },
        queue::{JobQueue, RedisQueue},
        scraper::HttpSiteScraper,
        store::JobStore,
        supervisor::RestartSupervisor,
        verifier::HttpVerifier,
        worker_pool::{CancellationRegistry, WorkerPool},
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting bulk mail job worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, config.worker_concurrency)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool.clone()));

    tracing::info!("Connecting to Redis job queue");
    let queue: Arc<dyn JobQueue> = Arc::new(
        RedisQueue::new(&config.redis_url, &config.queue_prefix, config.retry_policy())
            .expect("Failed to initialize job queue")
            .with_retention(config.queue_retention()),
    );

    tracing::info!("Initializing job handlers");
    let verifier = HttpVerifier::new(
        &config.verifier_url,
        &config.verifier_api_key,
        config.verifier_bulk,
        Duration::from_secs(config.verifier_timeout_secs),
    )
    .expect("Failed to initialize verification client");
    let scraper = HttpSiteScraper::new(
        &config.scrape_user_agent,
        Duration::from_secs(config.scrape_timeout_secs),
    )
    .expect("Failed to initialize scraper");

    let registry = HandlerRegistry::new()
        .with(Arc::new(BatchProcessor::new(
            GenerateHandler::new(Arc::new(PatternGenerator::new())),
            store.clone(),
        )))
        .with(Arc::new(BatchProcessor::new(
            VerifyHandler::new(Arc::new(verifier), Arc::new(PgVerificationCache::new(db_pool)))
                .with_delay(Duration::from_millis(config.verify_delay_ms)),
            store.clone(),
        )))
        .with(Arc::new(BatchProcessor::new(
            ScrapeHandler::new(Arc::new(scraper))
                .with_delay(Duration::from_millis(config.scrape_delay_ms)),
            store.clone(),
        )));

    let pool = Arc::new(WorkerPool::new(
        queue.clone(),
        store.clone(),
        Arc::new(registry),
        Arc::new(CancellationRegistry::new()),
        config.pool_config(),
    ));
    let state = AppState::new(store, queue, pool.clone());

    let shutdown = CancellationToken::new();
    let supervisor = RestartSupervisor::new(pool.clone(), config.restart_policy());
    let supervisor_shutdown = shutdown.clone();
    let supervisor_task = tokio::spawn(supervisor.run(supervisor_shutdown));

    pool.start().await;

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/workers/status", get(routes::workers::worker_status))
        .route("/workers/start", post(routes::workers::start_workers))
        .route("/workers/stop", post(routes::workers::stop_workers))
        .with_state(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");
    tracing::info!("Ops server listening on {}", config.bind_addr);

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    let exit_code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            0
        }
        outcome = supervisor_task => match outcome {
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Worker pool gave up");
                1
            }
            Ok(Ok(())) => 0,
            Err(e) => {
                tracing::error!(error = %e, "Supervisor task panicked");
                1
            }
        },
    };

    shutdown.cancel();
    pool.stop().await;
    if let Ok(Err(e)) = server.await {
        tracing::error!(error = %e, "Ops server error");
    }

    tracing::info!(exit_code, "Worker exited");
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}
