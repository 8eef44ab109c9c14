use anyhow::Result;
use axum::Router;
use chunk_recorder::{
    config::{AppConfig, RunMode},
    routes,
    services::{
        local_store::LocalStore,
        part_uploader::UploaderFactory,
        recorder::RecordingOrchestrator,
        remote::{HttpPartTransport, HttpUploadBroker},
        tracks::{ChannelTrackSource, PushCapture},
    },
    state::AppState,
};
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting chunk-recorder with config: {:?}", cfg);

    // --- Open the local store (applies the schema) ---
    let store = LocalStore::connect(&cfg.database_url).await?;

    if mode == RunMode::Migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Remote side ---
    let broker = Arc::new(HttpUploadBroker::new(
        cfg.broker_url.clone(),
        cfg.broker_token.clone(),
    )?);
    let transport = Arc::new(HttpPartTransport::default());
    let factory = UploaderFactory::new(broker, transport, cfg.retry_policy());

    // --- Orchestrator (recovers orphaned sessions before the queue starts) ---
    let source = Arc::new(ChannelTrackSource::new());
    let capture = PushCapture::new();
    let recorder = RecordingOrchestrator::open(
        store,
        factory,
        source.clone(),
        Arc::new(capture.clone()),
        cfg.recorder_config(),
    )
    .await;

    if mode == RunMode::Drain {
        let report = recorder.drain_all().await;
        recorder.cleanup().await;
        tracing::info!(
            uploaded = report.uploaded,
            failed = report.failed,
            orphaned = report.orphaned,
            "Drain complete."
        );
        return Ok(());
    }

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_slice_bytes)
        .with_state(AppState::new(recorder.clone(), source, capture));

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    recorder.cleanup().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("Could not listen for Ctrl-C: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested, stopping recorder");
}
