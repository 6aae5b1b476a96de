// HTTP request handlers
use crate::domain::channel::Channel;
use crate::infrastructure::chunked_stream::stream_from_broadcast;
use crate::infrastructure::http_response::{accepts_brotli, json_response};
use crate::presentation::app_state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub max_points: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct Diagnostics {
    pub attached: bool,
    pub samples: BTreeMap<String, usize>,
    pub dropped_payloads: u64,
    pub ignored_messages: u64,
    pub queued_messages: usize,
    pub consumers: usize,
    pub listeners: usize,
}

/// Wildcard captures may or may not keep the leading slash
fn topic_from_path(channel: &str) -> String {
    format!("/{}", channel.trim_start_matches('/'))
}

async fn respond<T: Serialize>(data: &T, headers: &HeaderMap) -> Response {
    match json_response(data, accepts_brotli(headers)).await {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "ok"
}

/// Connectivity as seen by the history engine
pub async fn get_status(headers: HeaderMap, State(state): State<Arc<AppState>>) -> Response {
    respond(&state.history.status(), &headers).await
}

/// Channel table in configured order
pub async fn list_channels(headers: HeaderMap, State(state): State<Arc<AppState>>) -> Response {
    let channels: Vec<&Channel> = state.channels.iter().collect();
    respond(&channels, &headers).await
}

/// Every channel's series as parallel timestamp/value arrays
pub async fn get_history(
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let snapshot = state.history.read().snapshot(query.max_points);
    respond(&snapshot, &headers).await
}

pub async fn get_channel_history(
    Path(channel): Path<String>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let topic = topic_from_path(&channel);
    let view = state.history.read().series_view(&topic, query.max_points);
    match view {
        Some(view) => respond(&view, &headers).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn get_latest(headers: HeaderMap, State(state): State<Arc<AppState>>) -> Response {
    respond(&state.history.latest_by_channel(), &headers).await
}

/// Counters for data silently absorbed by the history engine
pub async fn get_diagnostics(headers: HeaderMap, State(state): State<Arc<AppState>>) -> Response {
    let diagnostics = {
        let buffer = state.history.read();
        Diagnostics {
            attached: state.history.is_attached(),
            samples: state
                .channels
                .iter()
                .filter_map(|c| buffer.series(&c.topic).map(|s| (c.topic.clone(), s.len())))
                .collect(),
            dropped_payloads: buffer.dropped_payloads(),
            ignored_messages: buffer.ignored_messages(),
            queued_messages: state.manager.queued_messages(),
            consumers: state.manager.consumer_count(),
            listeners: state.manager.listener_count(),
        }
    };
    respond(&diagnostics, &headers).await
}

/// Publish the request body to a configured channel
pub async fn publish(
    Path(channel): Path<String>,
    State(state): State<Arc<AppState>>,
    body: String,
) -> StatusCode {
    let topic = topic_from_path(&channel);
    if !state.channels.contains(&topic) {
        return StatusCode::NOT_FOUND;
    }
    if state.manager.publish(&topic, body) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Live event stream (length-prefixed JSON frames)
pub async fn stream_events(headers: HeaderMap, State(state): State<Arc<AppState>>) -> Response {
    stream_from_broadcast(state.live.subscribe(), accepts_brotli(&headers))
        .await
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::connection_manager::ConnectionManager;
    use crate::application::history_engine::{HistoryBuffer, HistoryEngine};
    use crate::application::test_support::{Outcome, ScriptedTransport, bus_settings, url};
    use crate::domain::channel::{ChannelTable, LineStyle};
    use crate::domain::event::TelemetryEvent;
    use std::collections::HashMap;
    use std::num::NonZeroUsize;
    use tokio::sync::broadcast;

    const PCASING: &str = "/Sacha53/Pcasing";
    const TARGET_FREQ: &str = "/Sacha53/VSDTargetFreq";

    fn state(transport: Arc<ScriptedTransport>) -> Arc<AppState> {
        let channels = ChannelTable::new(vec![
            Channel::new(PCASING, "Presión Casing", "PSI", "#1f77b4"),
            Channel::new(TARGET_FREQ, "f", "Hz", "#006400").with_line_style(LineStyle::Dotted),
        ]);
        let manager = ConnectionManager::new(bus_settings(&["/mqtt"]), channels.topics(), transport);

        let mut seed = HashMap::new();
        seed.insert(
            PCASING.to_string(),
            (0..6).map(|t| crate::domain::telemetry::Sample::new(t, 100.0 + t as f64)).collect(),
        );
        let buffer = HistoryBuffer::initialize(
            &channels.topics(),
            NonZeroUsize::new(300).unwrap(),
            Some(seed),
        );
        let history = Arc::new(HistoryEngine::attach(&manager, buffer));
        let (live, _) = broadcast::channel::<TelemetryEvent>(16);

        Arc::new(AppState {
            manager,
            history,
            channels,
            live,
        })
    }

    async fn json(response: Response) -> serde_json::Value {
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn no_downsampling() -> Query<HistoryQuery> {
        Query(HistoryQuery { max_points: None })
    }

    #[test]
    fn test_topic_from_path() {
        assert_eq!(topic_from_path("Sacha53/Pcasing"), PCASING);
        assert_eq!(topic_from_path("/Sacha53/Pcasing"), PCASING);
    }

    #[tokio::test]
    async fn test_history_and_latest() {
        let state = state(ScriptedTransport::new());

        let history = json(get_history(no_downsampling(), HeaderMap::new(), State(state.clone())).await).await;
        assert_eq!(history[PCASING]["timestamps"].as_array().unwrap().len(), 6);
        assert_eq!(history[TARGET_FREQ]["values"], serde_json::json!([]));

        let latest = json(get_latest(HeaderMap::new(), State(state.clone())).await).await;
        assert_eq!(latest[PCASING], serde_json::json!({"timestamp": 5, "value": 105.0}));
        assert!(latest.get(TARGET_FREQ).is_none());
    }

    #[tokio::test]
    async fn test_channel_history_downsampled_and_unknown() {
        let state = state(ScriptedTransport::new());

        let view = json(
            get_channel_history(
                Path("Sacha53/Pcasing".to_string()),
                Query(HistoryQuery { max_points: Some(3) }),
                HeaderMap::new(),
                State(state.clone()),
            )
            .await,
        )
        .await;
        assert_eq!(view["timestamps"], serde_json::json!([1, 3, 5]));
        assert_eq!(view["values"], serde_json::json!([100.5, 102.5, 104.5]));

        let missing = get_channel_history(
            Path("Sacha53/Unknown".to_string()),
            no_downsampling(),
            HeaderMap::new(),
            State(state),
        )
        .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_and_channels() {
        let state = state(ScriptedTransport::new());

        let status = json(get_status(HeaderMap::new(), State(state.clone())).await).await;
        assert_eq!(status["is_connected"], false);

        let channels = json(list_channels(HeaderMap::new(), State(state.clone())).await).await;
        assert_eq!(channels[0]["topic"], PCASING);
        assert_eq!(channels[1]["line_style"], "dotted");

        let diagnostics = json(get_diagnostics(HeaderMap::new(), State(state)).await).await;
        assert_eq!(diagnostics["attached"], true);
        assert_eq!(diagnostics["samples"][PCASING], 6);
        assert_eq!(diagnostics["samples"][TARGET_FREQ], 0);
        assert_eq!(diagnostics["dropped_payloads"], 0);
        assert_eq!(diagnostics["queued_messages"], 0);
        assert_eq!(diagnostics["consumers"], 1);
        assert_eq!(diagnostics["listeners"], 1);
    }

    #[tokio::test]
    async fn test_publish_routes() {
        let transport = ScriptedTransport::new();
        transport.script(&url("/mqtt"), Outcome::Accept);
        let state = state(transport.clone());

        let status = publish(
            Path("Sacha53/VSDTargetFreq".to_string()),
            State(state.clone()),
            "60".to_string(),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state.manager.connect().await.unwrap();
        let status = publish(
            Path("Sacha53/VSDTargetFreq".to_string()),
            State(state.clone()),
            "60".to_string(),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(transport.last_link().published.lock().unwrap().len(), 1);

        let status = publish(Path("Other/Topic".to_string()), State(state), "1".to_string()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
