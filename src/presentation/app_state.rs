// Application state for HTTP handlers
use crate::application::connection_manager::ConnectionManager;
use crate::application::history_engine::HistoryEngine;
use crate::domain::channel::ChannelTable;
use crate::domain::event::TelemetryEvent;
use std::sync::Arc;
use tokio::sync::broadcast;

pub struct AppState {
    pub manager: ConnectionManager,
    pub history: Arc<HistoryEngine>,
    pub channels: ChannelTable,
    pub live: broadcast::Sender<TelemetryEvent>,
}
