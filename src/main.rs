// Main entry point - Dependency injection and server setup
mod application;
mod domain;
mod infrastructure;
mod presentation;

use std::{net::SocketAddr, sync::Arc};
use axum::{
    Router,
    routing::{get, post},
};
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::application::connection_manager::ConnectionManager;
use crate::application::history_engine::{HistoryBuffer, HistoryEngine};
use crate::application::supervisor::spawn_reconnect_supervisor;
use crate::infrastructure::config::{load_channel_table, load_service_config};
use crate::infrastructure::mqtt_transport::MqttTransport;
use crate::presentation::app_state::AppState;
use crate::presentation::handlers::{
    get_channel_history, get_diagnostics, get_history, get_latest, get_status, health_check,
    list_channels, publish, stream_events,
};

const LIVE_STREAM_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let service_config = load_service_config()?;
    let channels = load_channel_table()?;

    // Connection manager over the MQTT transport (infrastructure layer)
    let transport = Arc::new(MqttTransport::new(&service_config.bus));
    let manager = ConnectionManager::new(service_config.bus.clone(), channels.topics(), transport);

    // History engine (application layer)
    let buffer = HistoryBuffer::initialize(&channels.topics(), service_config.history.capacity, None);
    let history = Arc::new(HistoryEngine::attach(&manager, buffer));

    // Relay every event to live stream clients
    let (live, _) = broadcast::channel(LIVE_STREAM_CAPACITY);
    let relay = live.clone();
    let live_relay = manager.on_message(move |event| {
        // No receivers is fine
        let _ = relay.send(event.clone());
    });

    let supervisor = service_config
        .bus
        .reconnect_interval()
        .map(|interval| spawn_reconnect_supervisor(manager.clone(), interval));

    // Initial connect; failures are picked up by the supervisor
    let initial = manager.clone();
    tokio::spawn(async move {
        match initial.connect().await {
            Ok(status) => tracing::info!(
                "Message bus connected via {}",
                status.last_tried_url.unwrap_or_default()
            ),
            Err(e) => tracing::warn!("Initial connect failed: {}", e),
        }
    });

    // Create application state
    let state = Arc::new(AppState {
        manager: manager.clone(),
        history: history.clone(),
        channels,
        live,
    });

    // Build router (presentation layer)
    let router = Router::new()
        .route("/healthz", get(health_check))
        .route("/status", get(get_status))
        .route("/channels", get(list_channels))
        .route("/history", get(get_history))
        .route("/history/*channel", get(get_channel_history))
        .route("/latest", get(get_latest))
        .route("/publish/*channel", post(publish))
        .route("/stream", get(stream_events))
        .route("/diagnostics", get(get_diagnostics))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr: SocketAddr = service_config.server.bind.parse()?;
    tracing::info!("Starting well-telemetry service on {}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Orderly teardown: stop retrying, release the last consumer
    if let Some(supervisor) = supervisor {
        supervisor.abort();
    }
    live_relay.unsubscribe();
    history.teardown();
    manager.flush().await;
    tracing::info!("Shut down");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
