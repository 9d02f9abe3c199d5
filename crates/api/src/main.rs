use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kiln_provider::ProviderApi;
use kiln_relay::driver::FfmpegDriver;
use kiln_relay::StreamSupervisor;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiln_api::config::ServerConfig;
use kiln_api::router::build_app_router;
use kiln_api::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let (json_layer, text_layer) = if json_logs {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "kiln_api=debug,kiln_relay=debug,kiln_provider=debug,tower_http=debug".into()
            }),
        )
        .with(json_layer)
        .with(text_layer)
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");
    if config.provider.api_key.is_empty() {
        tracing::warn!("PROVIDER_API_KEY is not set; generation endpoints will reject requests");
    }

    let shutdown = CancellationToken::new();

    // --- Generation provider ---
    let provider = ProviderApi::new(
        config.provider.base_url.clone(),
        Duration::from_secs(config.provider.request_timeout_secs),
    )
    .expect("Failed to build provider HTTP client");
    tracing::info!(base_url = %provider.base_url(), "Generation provider client created");

    // --- Stream supervisor ---
    let supervisor = StreamSupervisor::start(
        config.relay.clone(),
        Arc::new(FfmpegDriver),
        shutdown.child_token(),
    )
    .await
    .expect("Failed to start stream supervisor");
    tracing::info!(
        streams_root = %config.relay.streams_root.display(),
        transcoder = %config.relay.transcoder_bin,
        "Stream supervisor started",
    );

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        supervisor: Arc::clone(&supervisor),
        provider: Arc::new(provider),
        poll_config: config.poll,
        shutdown: shutdown.clone(),
    };

    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Unblock in-flight readiness and poll waits so draining finishes.
            signal_token.cancel();
        })
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");
    shutdown.cancel();

    if tokio::time::timeout(Duration::from_secs(10), supervisor.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Stream supervisor did not shut down within 10s");
    }

    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
