use std::sync::Arc;

use anyhow::Context;
use faceswap_service::api;
use faceswap_service::config::ServiceConfig;
use faceswap_service::jobs::spawn_janitor;
use faceswap_service::processor::{FaceFusionProcessor, ImageProcessor, Launcher};
use faceswap_service::service::SwapService;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; real environment variables still apply.
    let _ = dotenvy::dotenv();

    let config = ServiceConfig::from_env().context("invalid configuration")?;

    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("creating log dir {}", config.log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "faceswap-service.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    eprintln!("🎭 Face-swap service v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Listening: http://{}{}", config.bind_addr(), config.route_prefix);
    eprintln!(
        "   Slots: {}  Queue: {}  Backend: {}",
        config.worker_slots, config.max_queue_depth, config.execution_provider
    );

    // ── Processor ────────────────────────────────────────────────────────
    let mut processor = FaceFusionProcessor::new(&config.python_bin, &config.facefusion_script);
    if let Some(address) = &config.ray_address {
        eprintln!("   Ray cluster: {address}");
        processor = processor.with_launcher(Launcher::Ray {
            address: address.clone(),
        });
    }
    let processor: Arc<dyn ImageProcessor> = Arc::new(processor);

    // ── Service + janitor ────────────────────────────────────────────────
    let service = Arc::new(
        SwapService::start(config.clone(), processor)
            .await
            .context("starting swap service")?,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let janitor_handle = spawn_janitor(
        Arc::new(service.janitor()),
        config.janitor_interval,
        shutdown_rx,
    );

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api::router(Arc::clone(&service));
    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("binding {}", config.bind_addr()))?;
    tracing::info!(addr = %config.bind_addr(), prefix = %config.route_prefix, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    service.shutdown();
    let _ = shutdown_tx.send(true);
    let _ = janitor_handle.await;
    tracing::info!("Face-swap service stopped");
    Ok(())
}
