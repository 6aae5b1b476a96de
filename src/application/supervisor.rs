// Reconnect supervisor - Re-invokes connect() after the bus goes away
use crate::application::connection_manager::ConnectionManager;
use crate::domain::event::TelemetryEvent;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Watch for disconnect status events and retry `connect()` after `interval`
/// while at least one consumer is attached. Abort the handle to stop.
pub fn spawn_reconnect_supervisor(manager: ConnectionManager, interval: Duration) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = manager.on_message(move |event| {
        if let TelemetryEvent::Status(update) = event {
            if update.is_disconnect() {
                let _ = tx.send(());
            }
        }
    });

    tokio::spawn(async move {
        let _subscription = subscription;
        while rx.recv().await.is_some() {
            tokio::time::sleep(interval).await;
            // Coalesce disconnects that piled up while waiting
            while rx.try_recv().is_ok() {}

            if manager.is_connected() || manager.consumer_count() == 0 {
                continue;
            }

            tracing::info!("Reconnecting to message bus");
            if let Err(e) = manager.connect().await {
                tracing::warn!("Reconnect failed: {}", e);
            }
        }
    })
}
