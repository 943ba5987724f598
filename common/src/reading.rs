use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::NodeError;

/// Identifier stamped on every published payload.
pub const DEVICE_ID: &str = "ESP32-Marbian";

/// Calibrated values straight from the sensor adapter, unit-stripped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    pub temperature: f32,
    pub pressure: f32,
    pub humidity: f32,
}

/// One publish cycle's payload. Created fresh each cycle, serialized to the
/// broker message, and discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorReading {
    pub device_id: String,
    pub temperature: String,
    pub pressure: String,
    pub humidity: String,
    pub timestamp: String,
}

impl SensorReading {
    pub fn from_sample(sample: SensorSample, timestamp: String) -> Self {
        Self {
            device_id: DEVICE_ID.to_string(),
            temperature: format_value(sample.temperature),
            pressure: format_value(sample.pressure),
            humidity: format_value(sample.humidity),
            timestamp,
        }
    }

    /// Serialized form published to the broker.
    pub fn payload(&self) -> Result<Vec<u8>, NodeError> {
        serde_json::to_vec(self)
            .map_err(|err| NodeError::Sensor(format!("failed to serialize reading: {err}")))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, NodeError> {
        serde_json::from_slice(payload)
            .map_err(|err| NodeError::Sensor(format!("failed to parse reading payload: {err}")))
    }
}

/// "Weekday DD Month YYYY HH-MM-SS", e.g. "Monday 05 January 2026 13-45-30".
pub fn format_timestamp(datetime: &NaiveDateTime) -> String {
    datetime.format("%A %d %B %Y %H-%M-%S").to_string()
}

fn format_value(value: f32) -> String {
    // Display drops the trailing ".0", so 1012.0 publishes as "1012".
    format!("{value}")
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample() -> SensorSample {
        SensorSample {
            temperature: 23.4,
            pressure: 1012.0,
            humidity: 45.0,
        }
    }

    #[test]
    fn formats_timestamp_with_weekday_and_month_names() {
        // Jan 5, 2026 is a Monday.
        let datetime = NaiveDate::from_ymd_opt(2026, 1, 5)
            .unwrap()
            .and_hms_opt(13, 45, 30)
            .unwrap();

        assert_eq!(format_timestamp(&datetime), "Monday 05 January 2026 13-45-30");
    }

    #[test]
    fn reading_strips_integral_fractions() {
        let reading = SensorReading::from_sample(sample(), "x".into());

        assert_eq!(reading.device_id, "ESP32-Marbian");
        assert_eq!(reading.temperature, "23.4");
        assert_eq!(reading.pressure, "1012");
        assert_eq!(reading.humidity, "45");
    }

    #[test]
    fn payload_round_trips() {
        let reading = SensorReading::from_sample(
            sample(),
            "Tuesday 25 November 2025 13-45-30".to_string(),
        );

        let payload = reading.payload().unwrap();
        let parsed = SensorReading::from_payload(&payload).unwrap();

        assert_eq!(parsed, reading);
    }

    #[test]
    fn payload_field_names_match_the_wire_schema() {
        let reading = SensorReading::from_sample(sample(), "ts".into());
        let value: serde_json::Value =
            serde_json::from_slice(&reading.payload().unwrap()).unwrap();

        assert_eq!(value["device_id"], "ESP32-Marbian");
        assert_eq!(value["temperature"], "23.4");
        assert_eq!(value["pressure"], "1012");
        assert_eq!(value["humidity"], "45");
        assert_eq!(value["timestamp"], "ts");
    }
}
