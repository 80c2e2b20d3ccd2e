mod config;
mod credentials;
mod engine;
mod error;
mod formats;
mod orchestrator;
mod routes;
mod sweeper;

use std::{sync::Arc, time::SystemTime};

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::Config,
    credentials::CredentialStore,
    engine::YtDlp,
    error::ApiError,
    orchestrator::{CredentialSignal, Downloader},
    routes::{AppState, build_cors_layer, router},
    sweeper::{spawn_sweeper, sweep_once},
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "ytdlp_backend=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env();

    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create download directory {:?}: {error}",
                config.download_dir
            ))
        })?;

    let credentials = CredentialStore::new(&config.cookie_file);
    if credentials.exists().await {
        info!("Found stored cookies at {:?}", credentials.path());
    } else {
        warn!("No cookies stored yet. Sign-in gated videos will ask for /upload-cookies.");
    }

    let downloader = Downloader::new(
        Arc::new(YtDlp::new(&config.yt_dlp_bin)),
        credentials.clone(),
        config.download_dir.clone(),
        CredentialSignal::new(&config.credential_keywords),
        config.expiry_label(),
    );

    let startup_sweep = sweep_once(&config.download_dir, config.file_expiry, SystemTime::now()).await;
    if startup_sweep.removed > 0 {
        info!("Removed {} expired file(s) left from a previous run", startup_sweep.removed);
    }

    let shutdown = CancellationToken::new();
    let sweeper = spawn_sweeper(
        config.download_dir.clone(),
        config.sweep_interval,
        config.file_expiry,
        shutdown.clone(),
    );

    let state = AppState {
        downloader: Arc::new(downloader),
        credentials,
        download_dir: config.download_dir.clone(),
    };
    let app = router(state, build_cors_layer(&config.allowed_origins)?);

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
    })?;

    info!(
        "Backend ready on http://{} (files kept for {}, swept every {}s)",
        config.bind_addr,
        config.expiry_label(),
        config.sweep_interval.as_secs()
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")));

    shutdown.cancel();
    if let Err(error) = sweeper.await {
        warn!("Retention sweeper ended abnormally: {error}");
    }

    served
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for Ctrl-C: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!("Could not listen for SIGTERM: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = shutdown.cancelled() => {}
    }

    info!("Shutting down");
    shutdown.cancel();
}
