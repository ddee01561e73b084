mod net;
mod routes;

use std::path::PathBuf;
use std::sync::Arc;

use frame_feed_common::config::Config;
use frame_feed_common::frame::EncodingParams;
use frame_feed_pipeline::{BroadcastSettings, CameraSource, Feed, FrameBroadcaster, JpegEncoder};
use tracing::{error, info};

use crate::routes::AppState;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    let camera = match CameraSource::from_config(&config.camera) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to set up camera: {e}");
            std::process::exit(1);
        }
    };
    let params = EncodingParams::from_config(&config);
    info!(
        backend = %config.camera.backend,
        index = config.camera.index,
        resolution = %config.camera.resolution(),
        fps = config.camera.fps,
        quality = params.quality,
        "starting frame feed"
    );

    let feed = match FrameBroadcaster::spawn(
        Arc::new(camera),
        JpegEncoder::new(&params),
        BroadcastSettings::from_config(&config),
    ) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Failed to start broadcaster thread: {e}");
            std::process::exit(1);
        }
    };

    let server_ip = net::local_ip().to_string();
    let state = Arc::new(AppState::new(feed.clone(), &config, server_ip.clone()));
    let app = routes::router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });
    info!(
        addr,
        url = %format!("http://{server_ip}:{}", config.server.port),
        "frame feed server listening"
    );

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(feed.clone()))
        .await
    {
        error!(error = %e, "server error");
    }

    // Viewers are gone; wait for the broadcaster to release the camera.
    if let Err(e) = tokio::task::spawn_blocking(move || feed.shutdown()).await {
        error!(error = %e, "broadcaster shutdown failed");
    }
    info!("frame feed server stopped");
}

/// Resolves on Ctrl-C after telling the feed to stop, so open streams end
/// and graceful shutdown can complete.
async fn shutdown_signal(feed: Feed) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
    feed.stop();
}
