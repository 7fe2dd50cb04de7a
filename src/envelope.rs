//! Standardized JSON envelope carried by every queue item payload.
//!
//! The queue engine paces and persists payloads as opaque strings; this
//! module defines the shape the surrounding processes agree on: a versioned
//! packet with a timestamped scalar, tabular, or event message plus optional
//! unit-of-measure and grouping metadata.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Envelope format version stamped on every packet.
pub const ENVELOPE_VERSION: u32 = 1;

/// Error raised when a payload cannot be parsed as an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to parse envelope payload: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Versioned packet exchanged on data topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub version: u32,
    /// Per-topic monotonic sequence stamped by the publishing proxy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<u64>,
    /// Milliseconds since the previous sample on the same topic.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "interval")]
    pub interval_ms: Option<u64>,
    pub message: EnvelopeMessage,
}

/// Payload variants: a scalar sample, a tabular batch, or an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeMessage {
    Data(DataPoint),
    Table(TableData),
    Event(EventData),
}

/// Single timestamped sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPoint {
    /// ISO-8601 UTC timestamp with millisecond precision.
    pub time: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uom: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_group: Option<String>,
}

/// Column-major tabular batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableData {
    pub time: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uom: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_group: Option<String>,
}

/// Discrete occurrence with a free-form detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    pub time: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_group: Option<String>,
}

impl Envelope {
    /// Wraps a scalar sample in a current-version packet.
    pub fn data(point: DataPoint) -> Self {
        Self::from_message(EnvelopeMessage::Data(point))
    }

    /// Wraps a tabular batch in a current-version packet.
    pub fn table(table: TableData) -> Self {
        Self::from_message(EnvelopeMessage::Table(table))
    }

    /// Wraps an event in a current-version packet.
    pub fn event(event: EventData) -> Self {
        Self::from_message(EnvelopeMessage::Event(event))
    }

    fn from_message(message: EnvelopeMessage) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            sequence_id: None,
            interval_ms: None,
            message,
        }
    }

    /// Renders the packet as its wire JSON form.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("envelope serialization must succeed")
    }

    /// Parses a wire payload back into a packet.
    pub fn parse(payload: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(payload)?)
    }
}

impl DataPoint {
    /// Sample stamped with the current time.
    pub fn now(value: impl Into<Value>) -> Self {
        Self {
            time: now_timestamp(),
            value: value.into(),
            uom: None,
            data_group: None,
        }
    }

    pub fn with_uom(mut self, uom: impl Into<String>) -> Self {
        self.uom = Some(uom.into());
        self
    }

    pub fn with_data_group(mut self, data_group: impl Into<String>) -> Self {
        self.data_group = Some(data_group.into());
        self
    }
}

/// Current time as ISO-8601 UTC with millisecond precision.
pub fn now_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Current time as milliseconds since the Unix epoch.
pub fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
