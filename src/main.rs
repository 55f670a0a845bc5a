//! Batch Job Supervisor Service
//!
//! Serves the batch HTTP API: CSV uploads become jobs, each job runs one
//! external worker process, and job state is tracked in memory with a
//! per-job directory on disk.
//!
//! ## Architecture
//!
//! - **Registry**: in-memory job table, authoritative while the process lives
//! - **Store**: `<JOBS_DIR>/<job id>/{urls.csv,config.json,progress.json,batch.log}`
//! - **Launcher**: `tokio::process` worker spawning with streamed output
//! - **Telemetry**: OpenTelemetry OTLP export
//!
//! ## Configuration
//!
//! See [`batch_supervisor::config`] for the environment variables, plus:
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP collector endpoint
//! - `RUST_LOG`: Log level (default: info)

use anyhow::{Context, Result};
use batch_supervisor::{api, config::SupervisorConfig, supervisor::BatchSupervisor, telemetry};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    install_panic_hook();

    // Initialize OpenTelemetry
    if let Err(e) = telemetry::init_telemetry() {
        warn!("Failed to initialize telemetry: {}", e);
    }

    info!("Starting batch supervisor");

    let config = SupervisorConfig::from_env();
    info!(
        "Configuration: bind_addr={}, jobs_dir={}, worker={:?} {}, url_marker={}",
        config.bind_addr,
        config.jobs_dir.display(),
        config.worker_program,
        config.worker_script.display(),
        config.url_marker
    );

    std::fs::create_dir_all(&config.jobs_dir).with_context(|| {
        format!(
            "Failed to create jobs directory {}",
            config.jobs_dir.display()
        )
    })?;
    if !config.worker_script.exists() {
        warn!(
            "Worker script {} does not exist; job starts will fail",
            config.worker_script.display()
        );
    }

    let supervisor = Arc::new(BatchSupervisor::new(&config));
    let shutdown = CancellationToken::new();

    let heartbeat = tokio::spawn(heartbeat_loop(
        supervisor.clone(),
        config.heartbeat_interval,
        shutdown.clone(),
    ));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("Listening on {}", config.bind_addr);

    let app = api::app(supervisor.clone(), config.max_upload_bytes);
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    // Wait for shutdown signal
    info!("Supervisor ready, press Ctrl+C to shutdown");
    signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;

    info!("Received shutdown signal, draining HTTP connections...");
    shutdown.cancel();

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("HTTP server error: {}", e),
        Err(e) => error!("HTTP server task failed: {}", e),
    }
    let _ = heartbeat.await;

    let active = supervisor.registry().active_count();
    if active > 0 {
        warn!(
            "{} batch worker(s) still running; they will not be tracked after exit",
            active
        );
    }

    info!("Batch supervisor shutdown complete");
    Ok(())
}

/// Periodically records a heartbeat with the number of live jobs.
async fn heartbeat_loop(
    supervisor: Arc<BatchSupervisor>,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                telemetry::record_supervisor_heartbeat(supervisor.registry().active_count());
            }
        }
    }
}

/// Routes panics from any task through tracing before the default hook runs.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!("Unhandled panic: {}", panic_info);
        default_hook(panic_info);
    }));
}
