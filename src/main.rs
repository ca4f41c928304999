use batch_fetch_queue::{
    app_state::AppState,
    config::AppConfig,
    routes::{self, metrics::MetricsState},
    runtime::{self, Background},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    runtime::init_tracing();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing batch-fetch-queue server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("jobs_submitted_total", "Total jobs accepted for processing");
    metrics::describe_gauge!("job_queue_depth", "Jobs currently waiting to be claimed");

    let store = runtime::connect_store(&config)
        .await
        .expect("Failed to open job store");

    // An in-memory store is only visible to workers in this process.
    let background = if config.embedded_workers || config.database_url.is_none() {
        let checker = runtime::build_checker(&config).expect("Failed to initialize item checker");
        Some(Background::spawn(store.clone(), checker, &config, "api-worker"))
    } else {
        None
    };

    let state = AppState::new(store.clone(), config.item_id_bounds());
    let metrics_state = MetricsState {
        handle: prometheus_handle,
        store,
    };
    let app = routes::router(state, Some(metrics_state));

    tracing::info!("Starting batch-fetch-queue on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(runtime::shutdown_signal())
        .await
        .expect("Server error");

    if let Some(background) = background {
        background.shutdown().await;
    }
}
