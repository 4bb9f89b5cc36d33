//! continuum-worker – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Connect to the task store.
//! 4. Connect to the container runtime and ensure the sandbox network.
//! 5. Pre-pull the sandbox image (best effort).
//! 6. Start the container idle reaper and the status HTTP server.
//! 7. Subscribe to task notifications and run the worker loop until a
//!    shutdown signal arrives, then tear everything down in order.

mod config;
mod error;
mod middleware;
mod routes;
mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use continuum_core::{
    ensure_sandbox_network, PatternScreener, PgStore, SandboxManager, Worker, WorkerStats,
};

use crate::config::Config;
use crate::state::AppState;

/// Grace given to the status server after the worker loop has stopped.
const HTTP_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env().context("configuration")?;

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cfg.log_level.parse().unwrap_or_default()),
        )
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "continuum-worker starting");

    // ── 3. Task store ──────────────────────────────────────────────────────────
    let store = PgStore::connect(&cfg.database_url())
        .await
        .context("failed to connect to the task store")?;
    info!(host = %cfg.db_host, database = %cfg.db_name, "task store ready");

    // ── 4. Worker identity & shutdown signal ───────────────────────────────────
    let worker_id = Uuid::new_v4();
    info!(worker_id = %worker_id, "assigned worker id");

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    // ── 5. Container runtime ───────────────────────────────────────────────────
    let docker = Docker::connect_with_local_defaults()
        .context("failed to connect to the container runtime")?;
    let network_id = ensure_sandbox_network(&docker)
        .await
        .context("failed to set up the sandbox network")?;
    info!(
        network = %&network_id[..network_id.len().min(12)],
        "sandbox network ready"
    );

    pull_sandbox_image(&docker, &cfg.container_image).await;

    // ── 6. Stats, sandbox manager, status server ───────────────────────────────
    let stats = Arc::new(WorkerStats::new(worker_id));
    let sandbox = Arc::new(SandboxManager::new(docker, cfg.sandbox_config()));
    let reaper = Arc::clone(&sandbox).spawn_reaper(cancel.clone());

    let app_state = Arc::new(AppState {
        store: store.clone(),
        stats: Arc::clone(&stats),
    });
    let http = spawn_status_server(cfg.api_port, app_state, cancel.clone()).await?;

    // ── 7. Worker loop ─────────────────────────────────────────────────────────
    let notifications = store
        .subscribe_changes(cancel.clone())
        .await
        .context("failed to subscribe to task notifications")?;

    let worker = Worker::new(
        worker_id,
        store,
        Arc::clone(&sandbox),
        PatternScreener::with_default_rules(),
        Arc::clone(&stats),
        cfg.priority_band(),
        cfg.polling_interval,
    );
    worker.run(notifications, cancel.clone()).await;

    // ── 8. Graceful teardown ───────────────────────────────────────────────────
    sandbox.dispose().await;
    let _ = reaper.await;
    if tokio::time::timeout(HTTP_SHUTDOWN_GRACE, http).await.is_err() {
        warn!("status server did not stop within its grace period");
    }
    info!("worker exited cleanly");
    Ok(())
}

/// Cancel the token on the first SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        cancel.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Best-effort image pre-pull; execution can still succeed against a local
/// copy if the registry is unreachable.
async fn pull_sandbox_image(docker: &Docker, image: &str) {
    info!(image = %image, "ensuring sandbox image is available");
    let mut progress = docker.create_image(
        Some(CreateImageOptions {
            from_image: image.to_owned(),
            ..Default::default()
        }),
        None,
        None,
    );
    while let Some(step) = progress.next().await {
        if let Err(e) = step {
            warn!(image = %image, error = %e, "image pull failed; continuing with local images");
            return;
        }
    }
    info!(image = %image, "sandbox image ready");
}

async fn spawn_status_server(
    port: u16,
    state: Arc<AppState>,
    cancel: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let app = routes::build(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind status API port {port}"))?;
    info!(port, "status server listening");
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            warn!(error = %e, "status server exited with error");
        }
    }))
}
