// Connection manager - Supervises the single message-bus connection and fans out events
use crate::application::listeners::{ListenerRegistry, Subscription};
use crate::application::transport::{
    BusLink, BusTransport, Endpoint, Session, TransportError, TransportEvent,
};
use crate::domain::event::TelemetryEvent;
use crate::domain::status::{ConnectionStatus, EndpointError, StatusUpdate};
use crate::infrastructure::config::BusSettings;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;

pub const CLIENT_DISCONNECT_REASON: &str = "disconnected by client";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectError {
    #[error("no candidate endpoints configured")]
    NoEndpoints,
    #[error("all candidate endpoints failed, last: {0}")]
    Exhausted(EndpointError),
    #[error("connect cancelled by disconnect")]
    Cancelled,
}

/// Bus traffic is tagged with the session it arrived on and holds a backlog
/// slot until delivered.
struct Origin {
    session: u64,
    _slot: OwnedSemaphorePermit,
}

enum Dispatch {
    Event {
        event: TelemetryEvent,
        origin: Option<Origin>,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct State {
    status: ConnectionStatus,
    link: Option<Box<dyn BusLink>>,
    pump: Option<JoinHandle<()>>,
    /// Bumped by every `disconnect()`, connected or not
    cancel_epoch: u64,
}

struct Inner {
    settings: BusSettings,
    channels: Vec<String>,
    transport: Arc<dyn BusTransport>,
    listeners: Arc<ListenerRegistry>,
    state: Mutex<State>,
    session: Arc<AtomicU64>,
    queue: mpsc::UnboundedSender<Dispatch>,
    backlog: Arc<Semaphore>,
    connect_gate: tokio::sync::Mutex<()>,
    consumers: AtomicUsize,
}

/// Process-wide handle to the bus connection. Clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Must be called inside a tokio runtime; spawns the dispatch task.
    pub fn new(settings: BusSettings, channels: Vec<String>, transport: Arc<dyn BusTransport>) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let listeners = Arc::new(ListenerRegistry::new());
        let session = Arc::new(AtomicU64::new(0));
        let backlog = Arc::new(Semaphore::new(settings.dispatch_backlog.get()));

        tokio::spawn(run_dispatcher(rx, listeners.clone(), session.clone()));

        Self {
            inner: Arc::new(Inner {
                settings,
                channels,
                transport,
                listeners,
                state: Mutex::new(State::default()),
                session,
                queue,
                backlog,
                connect_gate: tokio::sync::Mutex::new(()),
                consumers: AtomicUsize::new(0),
            }),
        }
    }

    /// Connect to the first candidate endpoint that accepts the handshake.
    ///
    /// Resolves immediately when already connected. Candidates are tried in
    /// order, each bounded by the handshake timeout; only exhaustion of the
    /// whole list is reported, with the last candidate's error. A
    /// `disconnect()` issued while candidates are still being tried cancels
    /// the attempt and closes any link it opened.
    pub async fn connect(&self) -> Result<ConnectionStatus, ConnectError> {
        let _gate = self.inner.connect_gate.lock().await;
        if self.is_connected() {
            return Ok(self.status());
        }
        let epoch = self.inner.lock_state().cancel_epoch;

        let mut last_error = None;
        for endpoint in self.inner.settings.endpoints() {
            let url = endpoint.url();
            let client_id = format!(
                "{}_{}",
                self.inner.settings.client_id_prefix,
                chrono::Utc::now().timestamp_millis()
            );
            {
                let mut state = self.inner.lock_state();
                if state.cancel_epoch != epoch {
                    return Err(ConnectError::Cancelled);
                }
                state.status.last_tried_url = Some(url.clone());
            }

            tracing::info!("Connecting to {} as {}", url, client_id);
            match self.open_candidate(&endpoint, &client_id).await {
                Ok(session) => return self.install(session, &url, &client_id, epoch),
                Err(e) => {
                    tracing::warn!("Candidate endpoint {} failed: {}", url, e);
                    last_error = Some(EndpointError::new(url, e.code(), e.to_string()));
                }
            }
        }

        let Some(error) = last_error else {
            self.inner
                .publish_status(StatusUpdate::disconnected(ConnectError::NoEndpoints.to_string()));
            return Err(ConnectError::NoEndpoints);
        };

        tracing::warn!("All candidate endpoints failed, last tried {}", error.url);
        self.inner.publish_status(StatusUpdate::exhausted(error.clone()));
        Err(ConnectError::Exhausted(error))
    }

    async fn open_candidate(&self, endpoint: &Endpoint, client_id: &str) -> Result<Session, TransportError> {
        let timeout = self.inner.settings.handshake_timeout();
        let session = tokio::time::timeout(timeout, self.inner.transport.open(endpoint, client_id))
            .await
            .map_err(|_| TransportError::Timeout(timeout.as_secs()))??;

        for topic in &self.inner.channels {
            if let Err(e) = session.link.subscribe(topic, self.inner.settings.qos).await {
                session.link.close();
                return Err(e);
            }
        }
        Ok(session)
    }

    /// Publish a freshly opened session. The state lock is held until the
    /// link, the connected status and the pump are all in place, so a loss
    /// reported by the pump is always ordered after the connect.
    fn install(
        &self,
        session: Session,
        url: &str,
        client_id: &str,
        epoch: u64,
    ) -> Result<ConnectionStatus, ConnectError> {
        let Session { link, events } = session;
        let mut state = self.inner.lock_state();
        if state.cancel_epoch != epoch {
            drop(state);
            link.close();
            tracing::info!("Connect to {} cancelled before install", url);
            return Err(ConnectError::Cancelled);
        }

        let id = self.inner.session.fetch_add(1, Ordering::SeqCst) + 1;
        let update = StatusUpdate::connected(url, client_id);
        state.link = Some(link);
        state.status.merge(&update);
        self.inner.enqueue(TelemetryEvent::Status(update), None);
        state.pump = Some(tokio::spawn(run_pump(
            Arc::downgrade(&self.inner),
            self.inner.backlog.clone(),
            id,
            events,
        )));
        let status = state.status.clone();
        drop(state);

        tracing::info!(
            "Connected to {}, subscribed to {} channels",
            url,
            self.inner.channels.len()
        );
        Ok(status)
    }

    /// Close the connection, or cancel a `connect()` still trying candidates.
    /// Bus traffic not yet delivered is discarded.
    pub fn disconnect(&self) {
        let mut state = self.inner.lock_state();
        state.cancel_epoch += 1;
        let Some(link) = state.link.take() else {
            return;
        };
        self.inner.session.fetch_add(1, Ordering::SeqCst);
        link.close();
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        let update = StatusUpdate::disconnected(CLIENT_DISCONNECT_REASON);
        state.status.merge(&update);
        drop(state);

        tracing::info!("Disconnected from message bus");
        self.inner.enqueue(TelemetryEvent::Status(update), None);
    }

    /// Register a listener for every message and status event.
    pub fn on_message<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&TelemetryEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.register(Arc::new(listener))
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock_state().status.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock_state().link.is_some()
    }

    /// Fire-and-forget publish. Returns whether the message was handed to the transport.
    pub fn publish(&self, channel: &str, payload: impl Into<Bytes>) -> bool {
        let state = self.inner.lock_state();
        let Some(link) = state.link.as_ref() else {
            tracing::debug!("Dropping publish to {}: not connected", channel);
            return false;
        };
        match link.publish(channel, payload.into(), self.inner.settings.qos) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Publish to {} failed: {}", channel, e);
                false
            }
        }
    }

    /// Register a consumer of the shared connection. The connection is
    /// closed when the last attachment is released.
    pub fn attach(&self) -> Attachment {
        let count = self.inner.consumers.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!("Consumer attached ({} active)", count);
        Attachment {
            manager: self.clone(),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.count()
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.consumers.load(Ordering::SeqCst)
    }

    /// Bus messages received but not yet delivered to every listener
    pub fn queued_messages(&self) -> usize {
        self.inner.settings.dispatch_backlog.get() - self.inner.backlog.available_permits()
    }

    /// Wait until every event queued so far has been delivered
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.queue.send(Dispatch::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, event: TelemetryEvent, origin: Option<Origin>) {
        if self.queue.send(Dispatch::Event { event, origin }).is_err() {
            tracing::debug!("Dispatcher stopped, event dropped");
        }
    }

    fn publish_status(&self, update: StatusUpdate) {
        self.lock_state().status.merge(&update);
        self.enqueue(TelemetryEvent::Status(update), None);
    }

    fn connection_lost(&self, session: u64, reason: String) {
        let mut state = self.lock_state();
        if self.session.load(Ordering::SeqCst) != session {
            return;
        }
        self.session.fetch_add(1, Ordering::SeqCst);
        state.link = None;
        state.pump = None;
        let update = StatusUpdate::disconnected(reason);
        state.status.merge(&update);
        drop(state);

        tracing::warn!("Connection to message bus lost");
        self.enqueue(TelemetryEvent::Status(update), None);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(link) = state.link.take() {
            link.close();
        }
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
    }
}

/// Drains the dispatch queue; the only place listeners are invoked.
async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<Dispatch>,
    listeners: Arc<ListenerRegistry>,
    live_session: Arc<AtomicU64>,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Dispatch::Event {
                origin: Some(origin),
                ..
            } if origin.session != live_session.load(Ordering::SeqCst) => {
                tracing::trace!("Discarding message from retired session {}", origin.session);
            }
            Dispatch::Event { event, origin } => {
                listeners.dispatch(&event);
                drop(origin);
            }
            Dispatch::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Forwards one session's inbound traffic into the dispatch queue. Reading
/// pauses while the backlog is full.
async fn run_pump(
    inner: Weak<Inner>,
    backlog: Arc<Semaphore>,
    session: u64,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message { topic, payload } => {
                let Ok(slot) = backlog.clone().acquire_owned().await else {
                    break;
                };
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let payload = String::from_utf8_lossy(&payload).into_owned();
                let timestamp = chrono::Utc::now().timestamp_millis();
                let origin = Origin {
                    session,
                    _slot: slot,
                };
                inner.enqueue(TelemetryEvent::message(topic, payload, timestamp), Some(origin));
            }
            TransportEvent::ConnectionLost { reason } => {
                if let Some(inner) = inner.upgrade() {
                    inner.connection_lost(session, reason);
                }
                break;
            }
        }
    }
}

/// Reference-counted consumer handle from `ConnectionManager::attach`.
#[must_use = "dropping an Attachment releases the consumer immediately"]
pub struct Attachment {
    manager: ConnectionManager,
}

impl Attachment {
    pub fn release(self) {
        // Drop does the work
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        let previous = self.manager.inner.consumers.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!("Consumer detached ({} active)", previous - 1);
        if previous == 1 {
            self.manager.disconnect();
        }
    }
}
