mod api;
mod config;
mod engine;
mod error;
mod history;
mod rate_limit;
mod sweeper;
mod tracker;
mod validation;
mod worker;

use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    api::{AppState, build_cors_layer, build_router},
    config::AppConfig,
    engine::YtDlpEngine,
    error::ApiError,
    sweeper::Sweeper,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "anyvideo_backend=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = AppConfig::from_env();

    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "No se pudo crear la carpeta de descargas {:?}: {error}",
                config.download_dir
            ))
        })?;

    if !config.trust_proxy_headers {
        warn!("TRUST_PROXY_HEADERS=false: se usara la IP del socket para limitar solicitudes.");
    }

    let cors = build_cors_layer(&config.allowed_origins)?;
    let engine = Arc::new(YtDlpEngine::new(
        config.yt_dlp_bin.clone(),
        config.yt_dlp_timeout,
    ));
    let state = AppState::new(&config, engine);

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!(
            "No se pudo iniciar el puerto {}: {error}",
            config.bind_addr
        ))
    })?;

    let sweeper = Sweeper::spawn(
        state.tracker.clone(),
        config.download_dir.clone(),
        config.session_retention,
        config.cleanup_interval,
    );
    let app = build_router(state, cors);

    info!(
        "Backend listo en http://{} (descargas en {:?}, max {} simultaneas)",
        config.bind_addr, config.download_dir, config.max_concurrent_downloads
    );

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|error| ApiError::internal(format!("Error del servidor HTTP: {error}")));

    sweeper.shutdown().await;
    info!("Backend detenido");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!("No se pudo escuchar Ctrl+C: {error}");
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
                warn!("No se pudo escuchar SIGTERM: {error}");
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

    info!("Senal de apagado recibida");
}
