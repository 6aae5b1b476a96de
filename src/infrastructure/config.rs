use crate::application::transport::{Endpoint, QosLevel};
use crate::domain::channel::{Channel, ChannelTable};
use serde::Deserialize;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::time::Duration;

const ENV_PREFIX: &str = "WELL_TELEMETRY";

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub bus: BusSettings,
    pub history: HistorySettings,
    #[serde(default)]
    pub server: ServerSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BusSettings {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub paths: Vec<String>,
    #[serde(default)]
    pub qos: QosLevel,
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    /// Bus messages allowed to wait for delivery before inbound reads pause
    #[serde(default = "default_dispatch_backlog")]
    pub dispatch_backlog: NonZeroUsize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HistorySettings {
    pub capacity: NonZeroUsize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub channels: Vec<Channel>,
}

fn default_scheme() -> String {
    "ws".to_string()
}

fn default_client_id_prefix() -> String {
    "well_dashboard".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_handshake_timeout_secs() -> u64 {
    6
}

fn default_reconnect_interval_secs() -> u64 {
    5
}

fn default_dispatch_backlog() -> NonZeroUsize {
    NonZeroUsize::MIN.saturating_add(1023)
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

impl BusSettings {
    /// Candidate endpoints in the order they are tried
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.paths
            .iter()
            .map(|path| Endpoint::new(&self.scheme, &self.host, self.port, path))
            .collect()
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_interval(&self) -> Option<Duration> {
        (self.reconnect_interval_secs > 0).then(|| Duration::from_secs(self.reconnect_interval_secs))
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bus.paths.is_empty() {
            anyhow::bail!("bus.paths must list at least one candidate endpoint path");
        }
        if !matches!(self.bus.scheme.as_str(), "ws" | "tcp" | "mqtt") {
            anyhow::bail!("unsupported bus.scheme {:?}", self.bus.scheme);
        }
        if self.bus.handshake_timeout_secs == 0 {
            anyhow::bail!("bus.handshake_timeout_secs must be greater than zero");
        }
        Ok(())
    }
}

impl ChannelsConfig {
    pub fn into_table(self) -> anyhow::Result<ChannelTable> {
        if self.channels.is_empty() {
            anyhow::bail!("at least one channel must be configured");
        }
        let mut seen = HashSet::new();
        for channel in &self.channels {
            if !channel.topic.starts_with('/') {
                anyhow::bail!("channel topic {:?} must start with '/'", channel.topic);
            }
            if !seen.insert(channel.topic.as_str()) {
                anyhow::bail!("channel topic {:?} is configured twice", channel.topic);
            }
        }
        Ok(ChannelTable::new(self.channels))
    }
}

pub fn load_service_config() -> anyhow::Result<ServiceConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("config/bus"))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let service: ServiceConfig = settings.try_deserialize()?;
    service.validate()?;
    Ok(service)
}

pub fn load_channel_table() -> anyhow::Result<ChannelTable> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("config/channels"))
        .build()?;

    let channels: ChannelsConfig = settings.try_deserialize()?;
    channels.into_table()
}

#[cfg(test)]
pub(crate) fn parse_service_config(toml: &str) -> anyhow::Result<ServiceConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::from_str(toml, config::FileFormat::Toml))
        .build()?;
    let service: ServiceConfig = settings.try_deserialize()?;
    service.validate()?;
    Ok(service)
}
