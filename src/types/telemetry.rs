//! Inbound telemetry: wire schema, decoded reading, delivery envelope.

use serde::{Deserialize, Serialize};

/// Event time in milliseconds since the unix epoch.
///
/// Wire timestamps are float seconds; everything past the decoder works in
/// integer milliseconds so window arithmetic stays exact.
pub type EventTime = i64;

/// Milliseconds per second, for wire conversions.
pub const MILLIS_PER_SEC: i64 = 1_000;

/// Latest accepted wire timestamp: 9999-12-31T23:59:59Z in unix seconds.
/// Keeps millisecond event times far below `i64::MAX` so window ends and
/// horizons never overflow.
pub const MAX_TIMESTAMP_SECS: f64 = 253_402_300_799.0;

/// Inbound message as it appears on the telemetry topic.
///
/// `reactor_id` / `power_mw` are accepted as aliases so the original
/// producer scripts can feed the engine unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    #[serde(alias = "reactor_id")]
    pub device_id: String,
    #[serde(alias = "power_mw")]
    pub value: f64,
    /// Unix seconds (fractional)
    pub timestamp: f64,
}

/// A decoded telemetry reading. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    pub device_id: String,
    pub value: f64,
    pub event_time: EventTime,
}

impl TelemetryReading {
    pub fn new(device_id: impl Into<String>, value: f64, event_time: EventTime) -> Self {
        Self {
            device_id: device_id.into(),
            value,
            event_time,
        }
    }

    /// Decode a single JSON line from the wire.
    pub fn from_json_line(line: &str) -> Result<Self, DecodeError> {
        let message: TelemetryMessage = serde_json::from_str(line)?;
        Self::try_from(message)
    }

    /// Wire representation (float seconds).
    pub fn to_message(&self) -> TelemetryMessage {
        #[allow(clippy::cast_precision_loss)]
        let timestamp = self.event_time as f64 / MILLIS_PER_SEC as f64;
        TelemetryMessage {
            device_id: self.device_id.clone(),
            value: self.value,
            timestamp,
        }
    }
}

impl TryFrom<TelemetryMessage> for TelemetryReading {
    type Error = DecodeError;

    fn try_from(message: TelemetryMessage) -> Result<Self, Self::Error> {
        if message.device_id.is_empty() {
            return Err(DecodeError::EmptyDeviceId);
        }
        if !message.value.is_finite() {
            return Err(DecodeError::NonFiniteValue(message.value));
        }
        if !message.timestamp.is_finite() || message.timestamp < 0.0 {
            return Err(DecodeError::InvalidTimestamp(message.timestamp));
        }
        if message.timestamp > MAX_TIMESTAMP_SECS {
            return Err(DecodeError::TimestampOutOfRange(message.timestamp));
        }
        if message.device_id.contains('\0') {
            return Err(DecodeError::NulInDeviceId);
        }
        #[allow(clippy::cast_possible_truncation)]
        let event_time = (message.timestamp * 1_000.0).round() as EventTime;
        Ok(Self {
            device_id: message.device_id,
            value: message.value,
            event_time,
        })
    }
}

/// Errors decoding an inbound telemetry message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed telemetry json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("device_id must not be empty")]
    EmptyDeviceId,
    #[error("value must be finite (got {0})")]
    NonFiniteValue(f64),
    #[error("timestamp must be finite and non-negative (got {0})")]
    InvalidTimestamp(f64),
    #[error("timestamp {0} is beyond year 9999")]
    TimestampOutOfRange(f64),
    #[error("device_id must not contain NUL")]
    NulInDeviceId,
}

/// A reading together with the source offset it was delivered at.
///
/// The offset is acknowledged only after the lane pipeline has finished
/// with the reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub offset: u64,
    pub reading: TelemetryReading,
}

impl Delivery {
    pub fn new(offset: u64, reading: TelemetryReading) -> Self {
        Self { offset, reading }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_float_seconds_to_millis() {
        let reading = TelemetryReading::from_json_line(
            r#"{"device_id":"Rivne-3","value":975.5,"timestamp":1700000000.1234}"#,
        )
        .unwrap();
        assert_eq!(reading.device_id, "Rivne-3");
        assert_eq!(reading.event_time, 1_700_000_000_123);
    }

    #[test]
    fn accepts_reactor_field_aliases() {
        let reading = TelemetryReading::from_json_line(
            r#"{"reactor_id":"ZAP-5","power_mw":931.0,"timestamp":12.0}"#,
        )
        .unwrap();
        assert_eq!(reading.device_id, "ZAP-5");
        assert!((reading.value - 931.0).abs() < f64::EPSILON);
        assert_eq!(reading.event_time, 12_000);
    }

    #[test]
    fn rejects_negative_timestamp_and_empty_device() {
        assert!(matches!(
            TelemetryReading::from_json_line(r#"{"device_id":"a","value":1.0,"timestamp":-1.0}"#),
            Err(DecodeError::InvalidTimestamp(_))
        ));
        assert!(matches!(
            TelemetryReading::from_json_line(r#"{"device_id":"","value":1.0,"timestamp":1.0}"#),
            Err(DecodeError::EmptyDeviceId)
        ));
        assert!(matches!(
            TelemetryReading::from_json_line("not json"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn rejects_timestamps_beyond_representable_range() {
        assert!(matches!(
            TelemetryReading::from_json_line(r#"{"device_id":"a","value":1.0,"timestamp":1e300}"#),
            Err(DecodeError::TimestampOutOfRange(_))
        ));
        let edge = TelemetryReading::from_json_line(
            r#"{"device_id":"a","value":1.0,"timestamp":253402300799.0}"#,
        )
        .unwrap();
        assert_eq!(edge.event_time, 253_402_300_799_000);
    }

    #[test]
    fn rejects_nul_in_device_id() {
        let line = r#"{"device_id":"ZAP\u00006","value":1.0,"timestamp":1.0}"#;
        assert!(matches!(
            TelemetryReading::from_json_line(line),
            Err(DecodeError::NulInDeviceId)
        ));
    }

    #[test]
    fn wire_message_uses_seconds() {
        let message = TelemetryReading::new("Rivne-4", 980.0, 1_500).to_message();
        assert!((message.timestamp - 1.5).abs() < 1e-9);
    }
}
