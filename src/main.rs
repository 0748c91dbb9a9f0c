mod app;
mod auth;
mod config;
mod error;
mod extractor;
mod handlers;
mod workspace;

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};

use crate::{
    app::{AppState, router},
    config::{Config, ConfigError},
    extractor::YtDlp,
};

const STALE_JOB_SECONDS: u64 = 2 * 60 * 60;

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("could not create work directory {path}: {source}")]
    WorkDir {
        path: String,
        source: std::io::Error,
    },

    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("HTTP server error: {0}")]
    Serve(std::io::Error),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "ytdlp_audio_service=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let config = Config::from_env()?;

    workspace::prepare_root(&config.work_dir)
        .await
        .map_err(|source| StartupError::WorkDir {
            path: config.work_dir.display().to_string(),
            source,
        })?;
    workspace::sweep_stale(&config.work_dir, Duration::from_secs(STALE_JOB_SECONDS)).await;

    let yt_dlp = YtDlp::new(config.yt_dlp_path.clone(), config.download_timeout);
    match yt_dlp.version().await {
        Some(version) => info!("Using yt-dlp {version} from {:?}", config.yt_dlp_path),
        None => warn!(
            "yt-dlp could not be run from {:?}; downloads will fail until it is installed",
            config.yt_dlp_path
        ),
    }

    if config.api_key.is_some() {
        info!("Bearer authentication enabled for /download");
    } else {
        warn!("API_KEY not set: /download accepts unauthenticated requests");
    }

    let addr = config.bind_addr.clone();
    let app = router(AppState::new(config, Arc::new(yt_dlp)));

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: addr.clone(),
            source,
        })?;

    info!("Audio service listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(StartupError::Serve)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                warn!("Failed to install SIGTERM handler: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutting down");
}
