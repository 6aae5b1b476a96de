// Events fanned out by the connection manager
use super::status::StatusUpdate;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TelemetryEvent {
    Message {
        channel: String,
        payload: String,
        timestamp: i64,
    },
    Status(StatusUpdate),
}

impl TelemetryEvent {
    pub fn message(channel: impl Into<String>, payload: impl Into<String>, timestamp: i64) -> Self {
        TelemetryEvent::Message {
            channel: channel.into(),
            payload: payload.into(),
            timestamp,
        }
    }
}
