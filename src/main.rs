use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use nutricycle_gateway::app_state::AppState;
use nutricycle_gateway::config::AppConfig;
use nutricycle_gateway::routes;
use nutricycle_gateway::services::{classifier::HttpClassifier, transcode::FfmpegLauncher};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing nutricycle-gateway");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    describe_metrics();

    tracing::info!(url = %config.classifier_url, "Using classifier");
    let classifier =
        HttpClassifier::new(&config.classifier_url).expect("Failed to initialize classifier client");
    let launcher = FfmpegLauncher::new(&config.ffmpeg_bin);

    let bind_addr = config.bind_addr.clone();
    let reap_interval = config.hls_reap_interval();
    let state = AppState::new(config, Arc::new(classifier), Arc::new(launcher))
        .await
        .expect("Failed to initialize application state");

    let shutdown = CancellationToken::new();
    let reaper = state
        .transcoder
        .clone()
        .spawn_reaper(reap_interval, shutdown.clone());

    let transcoder = state.transcoder.clone();
    let app = routes::router(state, prometheus_handle);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");
    tracing::info!("Server listening on {}", bind_addr);

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
        }
        signal.cancel();
    });

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned())
    .await
    .expect("Server error");

    shutdown.cancel();
    let _ = reaper.await;
    transcoder.stop_all().await;
    tracing::info!("Gateway stopped");
}

fn describe_metrics() {
    metrics::describe_counter!("detect_jobs_total", "Detect jobs accepted into the queue");
    metrics::describe_counter!("detect_jobs_completed", "Detect jobs that returned a classification");
    metrics::describe_counter!("detect_jobs_failed", "Detect jobs that failed or timed out");
    metrics::describe_counter!("detect_jobs_rejected", "Uploads shed because the detect queue was full");
    metrics::describe_gauge!("detect_queue_depth", "Jobs waiting for a worker");
    metrics::describe_gauge!("detect_jobs_active", "Jobs currently calling the classifier");
    metrics::describe_histogram!("detect_job_seconds", "Classifier call duration per job");
    metrics::describe_counter!("registry_persist_failures", "Failed writes of the device registry document");
    metrics::describe_gauge!("transcode_sessions_active", "Live HLS transcode sessions");
    metrics::describe_counter!("proxy_connections_total", "Stream proxy connections opened");
}
