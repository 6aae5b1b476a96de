// Telemetry data domain models
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use thiserror::Error;

/// One observation: Unix time in milliseconds and the sensor value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PayloadError {
    #[error("empty payload")]
    Empty,
    #[error("payload {0:?} is not a number")]
    NotNumeric(String),
    #[error("payload {0:?} is not a finite number")]
    NotFinite(String),
}

/// Parse a bus payload into a finite sample value.
pub fn parse_payload(payload: &str) -> Result<f64, PayloadError> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return Err(PayloadError::Empty);
    }
    let value: f64 = trimmed
        .parse()
        .map_err(|_| PayloadError::NotNumeric(trimmed.to_string()))?;
    if !value.is_finite() {
        return Err(PayloadError::NotFinite(trimmed.to_string()));
    }
    Ok(value)
}

/// Bounded, timestamp-ordered history for one channel.
///
/// Samples only enter at the tail and only leave from the head, so the
/// length never exceeds the capacity and timestamps never decrease from
/// head to tail.
#[derive(Debug, Clone)]
pub struct Series {
    capacity: NonZeroUsize,
    samples: VecDeque<Sample>,
}

impl Series {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity.get()),
        }
    }

    /// Append at the tail, returning the evicted head sample if the series was full.
    ///
    /// A timestamp older than the current tail (wall clock stepped back) is
    /// clamped to the tail's timestamp.
    pub fn push(&mut self, sample: Sample) -> Option<Sample> {
        let sample = match self.samples.back() {
            Some(tail) if sample.timestamp < tail.timestamp => Sample::new(tail.timestamp, sample.value),
            _ => sample,
        };

        self.samples.push_back(sample);

        let mut evicted = None;
        while self.samples.len() > self.capacity.get() {
            evicted = self.samples.pop_front();
        }
        evicted
    }

    pub fn last(&self) -> Option<&Sample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn view(&self) -> SeriesView {
        let (timestamps, values) = self.samples.iter().map(|s| (s.timestamp, s.value)).unzip();
        SeriesView { timestamps, values }
    }
}

/// Series as two parallel sequences, ready for a chart surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeriesView {
    pub timestamps: Vec<i64>,
    pub values: Vec<f64>,
}

impl SeriesView {
    /// Downsample using bucket averaging
    pub fn downsample(self, max_points: usize) -> SeriesView {
        let len = self.timestamps.len();
        if max_points == 0 || len <= max_points {
            return self;
        }

        let bucket_size = (len as f64 / max_points as f64).ceil() as usize;
        let mut downsampled = SeriesView {
            timestamps: Vec::with_capacity(max_points),
            values: Vec::with_capacity(max_points),
        };

        for chunk_start in (0..len).step_by(bucket_size) {
            let chunk_end = std::cmp::min(chunk_start + bucket_size, len);
            let values = &self.values[chunk_start..chunk_end];

            if values.is_empty() {
                continue;
            }

            // Middle timestamp, mean value
            let mid_idx = chunk_start + values.len() / 2;
            let avg_value = values.iter().sum::<f64>() / values.len() as f64;

            downsampled.timestamps.push(self.timestamps[mid_idx]);
            downsampled.values.push(avg_value);
        }

        downsampled
    }
}
