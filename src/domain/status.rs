// Connection status domain model
use serde::Serialize;
use thiserror::Error;

/// Failure of one candidate endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("connection to {url} failed: {message}")]
pub struct EndpointError {
    pub url: String,
    pub code: Option<i32>,
    pub message: String,
}

impl EndpointError {
    pub fn new(url: impl Into<String>, code: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub is_connected: bool,
    pub client_id: Option<String>,
    pub last_error: Option<EndpointError>,
    pub last_tried_url: Option<String>,
    pub reason: Option<String>,
}

impl ConnectionStatus {
    /// Overlay the fields present in `update`; absent fields keep their value.
    pub fn merge(&mut self, update: &StatusUpdate) {
        if let Some(is_connected) = update.is_connected {
            self.is_connected = is_connected;
        }
        if let Some(client_id) = &update.client_id {
            self.client_id = Some(client_id.clone());
        }
        if let Some(last_error) = &update.last_error {
            self.last_error = last_error.clone();
        }
        if let Some(url) = &update.last_tried_url {
            self.last_tried_url = Some(url.clone());
        }
        if let Some(reason) = &update.reason {
            self.reason = Some(reason.clone());
        }
    }
}

/// Partial status carried by a status event.
///
/// `last_error` is doubly optional: `None` leaves the stored error alone,
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_connected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<Option<EndpointError>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tried_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StatusUpdate {
    pub fn connected(url: &str, client_id: &str) -> Self {
        Self {
            is_connected: Some(true),
            client_id: Some(client_id.to_string()),
            last_error: Some(None),
            last_tried_url: Some(url.to_string()),
            reason: None,
        }
    }

    pub fn exhausted(error: EndpointError) -> Self {
        Self {
            is_connected: Some(false),
            last_tried_url: Some(error.url.clone()),
            last_error: Some(Some(error)),
            ..Self::default()
        }
    }

    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self {
            is_connected: Some(false),
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn is_disconnect(&self) -> bool {
        self.is_connected == Some(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_status() -> ConnectionStatus {
        let mut status = ConnectionStatus::default();
        status.merge(&StatusUpdate::exhausted(EndpointError::new(
            "ws://bus:8081/ws",
            Some(7),
            "AMQJS0007E Socket error",
        )));
        status
    }

    #[test]
    fn test_partial_update_preserves_other_fields() {
        let mut status = failed_status();
        status.merge(&StatusUpdate {
            reason: Some("lost".to_string()),
            ..StatusUpdate::default()
        });

        assert!(!status.is_connected);
        assert_eq!(status.last_tried_url.as_deref(), Some("ws://bus:8081/ws"));
        assert_eq!(status.last_error.as_ref().map(|e| e.code), Some(Some(7)));
        assert_eq!(status.reason.as_deref(), Some("lost"));
    }

    #[test]
    fn test_disconnect_keeps_last_error() {
        let mut status = failed_status();
        status.merge(&StatusUpdate::disconnected("lost"));
        assert!(status.last_error.is_some());
    }

    #[test]
    fn test_connected_clears_error_explicitly() {
        let mut status = failed_status();
        status.merge(&StatusUpdate::connected("ws://bus:8081/mqtt", "dash_1"));
        assert!(status.is_connected);
        assert_eq!(status.last_error, None);
        assert_eq!(status.last_tried_url.as_deref(), Some("ws://bus:8081/mqtt"));
        assert_eq!(status.client_id.as_deref(), Some("dash_1"));
    }

    #[test]
    fn test_update_serializes_only_present_fields() {
        let json = serde_json::to_value(StatusUpdate::disconnected("lost")).unwrap();
        assert_eq!(json, serde_json::json!({"is_connected": false, "reason": "lost"}));
    }
}
