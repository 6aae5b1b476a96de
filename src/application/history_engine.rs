// History engine - Bounded per-channel series fed from the connection manager
use crate::application::connection_manager::{Attachment, ConnectionManager};
use crate::application::listeners::Subscription;
use crate::domain::event::TelemetryEvent;
use crate::domain::status::ConnectionStatus;
use crate::domain::telemetry::{PayloadError, Sample, Series, SeriesView, parse_payload};
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};

/// What `on_event` did with an event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Appended { evicted: Option<Sample> },
    StatusMerged,
    DroppedMalformed(PayloadError),
    IgnoredUnknownChannel,
}

/// Per-channel history plus the derived latest-value map and merged status.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    channels: Vec<String>,
    series: HashMap<String, Series>,
    latest: HashMap<String, Sample>,
    status: ConnectionStatus,
    dropped_payloads: u64,
    ignored_messages: u64,
}

impl HistoryBuffer {
    /// One series per channel, optionally seeded with warm-up samples.
    /// Seed samples go through the normal append path.
    pub fn initialize(
        channels: &[String],
        capacity: NonZeroUsize,
        seed: Option<HashMap<String, Vec<Sample>>>,
    ) -> Self {
        let mut buffer = Self {
            channels: channels.to_vec(),
            series: channels
                .iter()
                .map(|c| (c.clone(), Series::new(capacity)))
                .collect(),
            latest: HashMap::new(),
            status: ConnectionStatus::default(),
            dropped_payloads: 0,
            ignored_messages: 0,
        };

        for (channel, samples) in seed.unwrap_or_default() {
            if !buffer.series.contains_key(&channel) {
                tracing::debug!("Ignoring seed for unknown channel {}", channel);
                continue;
            }
            for sample in samples.into_iter().filter(|s| s.value.is_finite()) {
                buffer.append(&channel, sample);
            }
        }

        buffer
    }

    pub fn on_event(&mut self, event: &TelemetryEvent) -> EventOutcome {
        match event {
            TelemetryEvent::Status(update) => {
                self.status.merge(update);
                EventOutcome::StatusMerged
            }
            TelemetryEvent::Message {
                channel,
                payload,
                timestamp,
            } => {
                if !self.series.contains_key(channel) {
                    self.ignored_messages += 1;
                    tracing::debug!("Ignoring message for unknown channel {}", channel);
                    return EventOutcome::IgnoredUnknownChannel;
                }
                match parse_payload(payload) {
                    Ok(value) => {
                        let evicted = self.append(channel, Sample::new(*timestamp, value));
                        EventOutcome::Appended { evicted }
                    }
                    Err(e) => {
                        self.dropped_payloads += 1;
                        tracing::debug!("Dropping sample for {}: {}", channel, e);
                        EventOutcome::DroppedMalformed(e)
                    }
                }
            }
        }
    }

    fn append(&mut self, channel: &str, sample: Sample) -> Option<Sample> {
        let series = self.series.get_mut(channel)?;
        let evicted = series.push(sample);
        if let Some(tail) = series.last() {
            self.latest.insert(channel.to_string(), *tail);
        }
        evicted
    }

    /// Tail sample of every non-empty series
    pub fn latest_by_channel(&self) -> BTreeMap<String, Sample> {
        self.latest
            .iter()
            .map(|(channel, sample)| (channel.clone(), *sample))
            .collect()
    }

    pub fn series(&self, channel: &str) -> Option<&Series> {
        self.series.get(channel)
    }

    pub fn series_view(&self, channel: &str, max_points: Option<usize>) -> Option<SeriesView> {
        let view = self.series.get(channel)?.view();
        Some(match max_points {
            Some(max_points) => view.downsample(max_points),
            None => view,
        })
    }

    pub fn snapshot(&self, max_points: Option<usize>) -> BTreeMap<String, SeriesView> {
        self.channels
            .iter()
            .filter_map(|c| self.series_view(c, max_points).map(|v| (c.clone(), v)))
            .collect()
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn set_status(&mut self, status: ConnectionStatus) {
        self.status = status;
    }

    pub fn dropped_payloads(&self) -> u64 {
        self.dropped_payloads
    }

    pub fn ignored_messages(&self) -> u64 {
        self.ignored_messages
    }
}

/// A `HistoryBuffer` attached to a connection manager's event stream.
pub struct HistoryEngine {
    buffer: Arc<RwLock<HistoryBuffer>>,
    subscription: Mutex<Option<Subscription>>,
    attachment: Mutex<Option<Attachment>>,
}

impl HistoryEngine {
    pub fn attach(manager: &ConnectionManager, mut buffer: HistoryBuffer) -> Self {
        buffer.set_status(manager.status());
        let buffer = Arc::new(RwLock::new(buffer));

        let sink = buffer.clone();
        let subscription = manager.on_message(move |event| {
            sink.write()
                .unwrap_or_else(PoisonError::into_inner)
                .on_event(event);
        });

        Self {
            buffer,
            subscription: Mutex::new(Some(subscription)),
            attachment: Mutex::new(Some(manager.attach())),
        }
    }

    /// Stop listening and release this consumer. Series are kept.
    pub fn teardown(&self) {
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let attachment = self
            .attachment
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(subscription) = subscription {
            tracing::info!("Detaching history engine");
            subscription.unsubscribe();
        }
        if let Some(attachment) = attachment {
            attachment.release();
        }
    }

    pub fn is_attached(&self) -> bool {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, HistoryBuffer> {
        self.buffer.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn latest_by_channel(&self) -> BTreeMap<String, Sample> {
        self.read().latest_by_channel()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.read().status().clone()
    }
}

impl Drop for HistoryEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}
