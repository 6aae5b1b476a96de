// Transport trait for message-bus access
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;

/// Delivery guarantee requested for subscriptions and publishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum QosLevel {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QosLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(format!("invalid QoS level {other}, expected 0, 1 or 2")),
        }
    }
}

/// One candidate endpoint, e.g. `ws://34.30.17.212:8081/mqtt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Endpoint {
    pub fn new(scheme: &str, host: &str, port: u16, path: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            path: path.to_string(),
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("handshake refused (code {code}): {message}")]
    Refused { code: i32, message: String },
    #[error("handshake timed out after {0}s")]
    Timeout(u64),
    #[error("transport error: {0}")]
    Io(String),
    #[error("link closed")]
    Closed,
}

impl TransportError {
    pub fn code(&self) -> Option<i32> {
        match self {
            TransportError::Refused { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Raw traffic coming off an open link.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message { topic: String, payload: Bytes },
    ConnectionLost { reason: String },
}

/// An established handshake: the link used to talk to the bus plus the
/// stream of inbound traffic. The stream ends after `ConnectionLost`.
pub struct Session {
    pub link: Box<dyn BusLink>,
    pub events: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Perform the handshake against one endpoint
    async fn open(&self, endpoint: &Endpoint, client_id: &str) -> Result<Session, TransportError>;
}

#[async_trait]
pub trait BusLink: Send + Sync {
    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), TransportError>;

    /// Queue a publish without waiting for it to leave
    fn publish(&self, topic: &str, payload: Bytes, qos: QosLevel) -> Result<(), TransportError>;

    /// Close the link; no further events are produced
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url() {
        let endpoint = Endpoint::new("ws", "34.30.17.212", 8081, "/mqtt/");
        assert_eq!(endpoint.url(), "ws://34.30.17.212:8081/mqtt/");
    }

    #[test]
    fn test_qos_from_number() {
        assert_eq!(QosLevel::try_from(0), Ok(QosLevel::AtMostOnce));
        assert_eq!(QosLevel::try_from(2), Ok(QosLevel::ExactlyOnce));
        assert!(QosLevel::try_from(3).is_err());
    }
}
