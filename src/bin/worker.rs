use batch_fetch_queue::{
    config::AppConfig,
    runtime::{self, Background},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

#[tokio::main]
async fn main() {
    runtime::init_tracing();

    tracing::info!("Starting batch-fetch-queue worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    if config.database_url.is_none() {
        tracing::warn!("Worker started without DATABASE_URL; it will only see its own in-memory jobs");
    }

    let metrics_addr: SocketAddr = config
        .worker_metrics_addr
        .parse()
        .expect("Invalid WORKER_METRICS_ADDR");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");

    metrics::describe_histogram!(
        "job_processing_seconds",
        "Time spent on one processing attempt of a job"
    );
    metrics::describe_counter!("jobs_completed_total", "Jobs completed with at least one available item");
    metrics::describe_counter!("jobs_failed_total", "Jobs that ended in the failed state");
    metrics::describe_counter!("jobs_retried_total", "Attempts deferred after a transient failure");
    metrics::describe_counter!("jobs_dead_lettered_total", "Jobs failed after exhausting retries");
    metrics::describe_counter!("items_checked_total", "Item checks by outcome");
    metrics::describe_counter!("jobs_swept_total", "Terminal jobs removed by retention");

    let store = runtime::connect_store(&config)
        .await
        .expect("Failed to open job store");

    let checker = runtime::build_checker(&config).expect("Failed to initialize item checker");

    tracing::info!(workers = config.worker_count, "Worker ready, starting job processing loop");

    let background = Background::spawn(store, checker, &config, "worker");

    runtime::shutdown_signal().await;
    background.shutdown().await;

    tracing::info!("Worker shut down cleanly");
}
