// Scripted in-memory transport for manager and engine tests
use crate::application::transport::{
    BusLink, BusTransport, Endpoint, QosLevel, Session, TransportError, TransportEvent,
};
use crate::domain::event::TelemetryEvent;
use crate::infrastructure::config::BusSettings;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};

#[derive(Debug, Clone)]
pub enum Outcome {
    Accept,
    /// Accept, with a connection loss already waiting in the session
    AcceptThenLose(&'static str),
    /// Accept once the gate is notified
    Gated(Arc<Notify>),
    Refuse(i32, &'static str),
    Hang,
}

#[derive(Default)]
pub struct LinkRecord {
    pub subscribed: Mutex<Vec<(String, QosLevel)>>,
    pub published: Mutex<Vec<(String, Bytes)>>,
    pub closed: AtomicBool,
}

struct FakeLink {
    record: Arc<LinkRecord>,
}

#[async_trait]
impl BusLink for FakeLink {
    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), TransportError> {
        self.record
            .subscribed
            .lock()
            .unwrap()
            .push((topic.to_string(), qos));
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Bytes, _qos: QosLevel) -> Result<(), TransportError> {
        if self.record.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.record
            .published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    fn close(&self) {
        self.record.closed.store(true, Ordering::SeqCst);
    }
}

/// Transport whose handshake result is scripted per endpoint URL.
/// Unscripted URLs are refused.
#[derive(Default)]
pub struct ScriptedTransport {
    outcomes: Mutex<HashMap<String, Outcome>>,
    pub attempts: Mutex<Vec<(String, String)>>,
    sessions: Mutex<Vec<(Arc<LinkRecord>, mpsc::Sender<TransportEvent>)>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, url: &str, outcome: Outcome) {
        self.outcomes.lock().unwrap().insert(url.to_string(), outcome);
    }

    pub fn attempted_urls(&self) -> Vec<String> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Record of the most recently opened link
    pub fn last_link(&self) -> Arc<LinkRecord> {
        self.sessions.lock().unwrap().last().unwrap().0.clone()
    }

    /// Push inbound traffic into the most recently opened session
    pub async fn inject(&self, event: TransportEvent) {
        let sender = self.sessions.lock().unwrap().last().unwrap().1.clone();
        // The session may already be closed
        let _ = sender.send(event).await;
    }

    fn accept(&self) -> Session {
        let (tx, rx) = mpsc::channel(64);
        let record = Arc::new(LinkRecord::default());
        self.sessions.lock().unwrap().push((record.clone(), tx));
        Session {
            link: Box::new(FakeLink { record }),
            events: rx,
        }
    }

    pub async fn inject_message(&self, topic: &str, payload: &str) {
        self.inject(TransportEvent::Message {
            topic: topic.to_string(),
            payload: Bytes::from(payload.to_string()),
        })
        .await;
    }
}

#[async_trait]
impl BusTransport for ScriptedTransport {
    async fn open(&self, endpoint: &Endpoint, client_id: &str) -> Result<Session, TransportError> {
        let url = endpoint.url();
        self.attempts
            .lock()
            .unwrap()
            .push((url.clone(), client_id.to_string()));
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get(&url)
            .cloned()
            .unwrap_or(Outcome::Refuse(14, "not scripted"));

        match outcome {
            Outcome::Accept => Ok(self.accept()),
            Outcome::AcceptThenLose(reason) => {
                let session = self.accept();
                self.sessions
                    .lock()
                    .unwrap()
                    .last()
                    .unwrap()
                    .1
                    .try_send(TransportEvent::ConnectionLost {
                        reason: reason.to_string(),
                    })
                    .unwrap();
                Ok(session)
            }
            Outcome::Gated(gate) => {
                gate.notified().await;
                Ok(self.accept())
            }
            Outcome::Refuse(code, message) => Err(TransportError::Refused {
                code,
                message: message.to_string(),
            }),
            Outcome::Hang => std::future::pending().await,
        }
    }
}

pub fn bus_settings(paths: &[&str]) -> BusSettings {
    BusSettings {
        host: "bus.test".to_string(),
        port: 8081,
        scheme: "ws".to_string(),
        paths: paths.iter().map(|p| p.to_string()).collect(),
        qos: QosLevel::AtMostOnce,
        client_id_prefix: "well_dashboard".to_string(),
        keep_alive_secs: 30,
        handshake_timeout_secs: 6,
        reconnect_interval_secs: 0,
        dispatch_backlog: NonZeroUsize::new(1024).unwrap(),
    }
}

pub fn url(path: &str) -> String {
    format!("ws://bus.test:8081{}", path)
}

/// Listener that records every event it sees
pub fn recorder() -> (
    Arc<Mutex<Vec<TelemetryEvent>>>,
    impl Fn(&TelemetryEvent) + Send + Sync + 'static,
) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    (log, move |event: &TelemetryEvent| {
        sink.lock().unwrap().push(event.clone())
    })
}
