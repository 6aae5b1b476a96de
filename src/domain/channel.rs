// Channel domain model
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineStyle {
    #[default]
    Solid,
    Dotted,
    Dashed,
}

/// A sensor stream identified by its bus topic, e.g. `/Sacha53/Pcasing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub topic: String,
    pub name: String,
    pub unit: String,
    pub color: String,
    #[serde(default)]
    pub line_style: LineStyle,
}

#[cfg(test)]
impl Channel {
    pub fn new(topic: &str, name: &str, unit: &str, color: &str) -> Self {
        Self {
            topic: topic.to_string(),
            name: name.to_string(),
            unit: unit.to_string(),
            color: color.to_string(),
            line_style: LineStyle::Solid,
        }
    }

    pub fn with_line_style(mut self, line_style: LineStyle) -> Self {
        self.line_style = line_style;
        self
    }
}

/// Static channel table. Lookups are exact topic matches; iteration follows
/// the configured order.
#[derive(Debug, Clone, Default)]
pub struct ChannelTable {
    channels: Vec<Channel>,
}

impl ChannelTable {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self { channels }
    }

    pub fn get(&self, topic: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.topic == topic)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.get(topic).is_some()
    }

    pub fn topics(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.topic.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }
}
