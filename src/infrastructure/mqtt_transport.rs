// MQTT transport implementation
use crate::application::transport::{
    BusLink, BusTransport, Endpoint, QosLevel, Session, TransportError, TransportEvent,
};
use crate::infrastructure::config::BusSettings;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, Transport,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const REQUEST_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct MqttTransport {
    keep_alive: Duration,
}

impl MqttTransport {
    pub fn new(settings: &BusSettings) -> Self {
        Self {
            keep_alive: settings.keep_alive(),
        }
    }

    fn options(&self, endpoint: &Endpoint, client_id: &str) -> MqttOptions {
        let mut options = match endpoint.scheme.as_str() {
            // Websocket brokers take the full URL as the host
            "ws" => {
                let mut options = MqttOptions::new(client_id, endpoint.url(), endpoint.port);
                options.set_transport(Transport::Ws);
                options
            }
            _ => MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port),
        };
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options
    }
}

fn refused(code: ConnectReturnCode) -> TransportError {
    TransportError::Refused {
        code: code as i32,
        message: format!("{:?}", code),
    }
}

fn to_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Poll until the broker answers the CONNECT
async fn handshake(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(refused(code)),
                };
            }
            Ok(_) => continue,
            Err(ConnectionError::ConnectionRefused(code)) => return Err(refused(code)),
            Err(e) => return Err(TransportError::Io(e.to_string())),
        }
    }
}

/// Drive the event loop after the handshake, forwarding publishes
async fn forward_events(mut eventloop: EventLoop, tx: mpsc::Sender<TransportEvent>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let event = TransportEvent::Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                let _ = tx
                    .send(TransportEvent::ConnectionLost {
                        reason: e.to_string(),
                    })
                    .await;
                break;
            }
        }
    }
}

#[async_trait]
impl BusTransport for MqttTransport {
    async fn open(&self, endpoint: &Endpoint, client_id: &str) -> Result<Session, TransportError> {
        let (client, mut eventloop) =
            AsyncClient::new(self.options(endpoint, client_id), REQUEST_CAPACITY);

        handshake(&mut eventloop).await?;
        tracing::debug!("Handshake with {} complete", endpoint.url());

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let task = tokio::spawn(forward_events(eventloop, tx));

        Ok(Session {
            link: Box::new(MqttLink { client, task }),
            events: rx,
        })
    }
}

struct MqttLink {
    client: AsyncClient,
    task: JoinHandle<()>,
}

#[async_trait]
impl BusLink for MqttLink {
    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), TransportError> {
        self.client.subscribe(topic, to_qos(qos)).await.map_err(|e| {
            tracing::debug!("Subscribe to {} rejected: {}", topic, e);
            TransportError::Closed
        })
    }

    fn publish(&self, topic: &str, payload: Bytes, qos: QosLevel) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, to_qos(qos), false, payload.to_vec())
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    fn close(&self) {
        if let Err(e) = self.client.try_disconnect() {
            tracing::debug!("Disconnect request not queued: {}", e);
        }
        self.task.abort();
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}
