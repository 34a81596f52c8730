use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use upload_scheduler::{
    config::AppConfig,
    db::{self, JobStore, PgJobStore},
    services::{
        detector::Detector,
        dispatcher::{recover_orphans, Dispatcher},
        pipeline::Pipeline,
        source::FsSourceResolver,
        uploader::HttpUploader,
    },
    shutdown,
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

    tracing::info!("Starting upload scheduler worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let scheduler = config
        .scheduler()
        .expect("Invalid scheduler configuration");

    let metrics_addr: SocketAddr = config
        .worker_metrics_addr
        .parse()
        .expect("WORKER_METRICS_ADDR must be a socket address");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");
    describe_metrics();

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db_pool));

    // Single scheduler process: anything still mid-flight belongs to a dead run.
    let recovered = recover_orphans(store.as_ref())
        .await
        .expect("Failed to recover orphaned jobs");
    if recovered > 0 {
        tracing::warn!(recovered, "Orphaned jobs moved to failed");
    }

    let uploader = HttpUploader::new(
        &config.upload_endpoint,
        &config.upload_api_token,
        Duration::from_secs(config.upload_timeout_secs),
    )
    .expect("Failed to initialize upload client");

    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        Arc::new(FsSourceResolver),
        Arc::new(uploader),
        scheduler.retry,
    ));
    let dispatcher = Dispatcher::spawn(scheduler.capacity, store.clone(), pipeline);
    let detector = Detector::new(store, dispatcher.handle(), &scheduler);

    let token = shutdown::install_shutdown_handler();
    let detector_token = token.child_token();
    let detector_task = tokio::spawn(async move { detector.run(detector_token).await });

    tracing::info!(
        capacity = scheduler.capacity,
        poll_interval_secs = scheduler.poll_interval.as_secs(),
        "Worker ready"
    );

    token.cancelled().await;

    if let Err(e) = detector_task.await {
        tracing::error!(error = %e, "Detector task ended abnormally");
    }

    let pool = dispatcher.stats();
    tracing::info!(in_flight = pool.in_flight, ready = pool.ready, "Draining worker pool");
    let report = dispatcher.shutdown().await;

    tracing::info!(released = report.released, "Worker stopped");
}

fn describe_metrics() {
    metrics::describe_counter!(
        "detector_jobs_promoted_total",
        "Due jobs moved from pending to queued"
    );
    metrics::describe_gauge!(
        "dispatcher_ready_queue_depth",
        "Queued jobs waiting for a worker slot"
    );
    metrics::describe_gauge!("dispatcher_in_flight", "Jobs currently held by a worker");
    metrics::describe_histogram!(
        "pipeline_job_seconds",
        "Wall time of one pipeline run"
    );
    metrics::describe_counter!(
        "pipeline_jobs_completed_total",
        "Jobs that reached completed"
    );
    metrics::describe_counter!(
        "pipeline_jobs_failed_total",
        "Jobs that reached failed, by kind and stage"
    );
    metrics::describe_counter!(
        "pipeline_jobs_abandoned_total",
        "Runs stopped because another actor changed the job"
    );
    metrics::describe_counter!(
        "pipeline_upload_retries_total",
        "Upload attempts retried after a transient failure"
    );
}
