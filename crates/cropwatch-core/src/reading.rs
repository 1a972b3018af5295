//! Sensor readings and their kind/status vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::timefmt;

/// Sensor kinds the platform knows about. Snake-case on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Temperature,
    Humidity,
    SoilMoisture,
    SoilTemperature,
    Light,
    Ph,
    WindSpeed,
    WindDirection,
    Rainfall,
    Co2,
}

impl SensorKind {
    pub const ALL: [SensorKind; 10] = [
        SensorKind::Temperature,
        SensorKind::Humidity,
        SensorKind::SoilMoisture,
        SensorKind::SoilTemperature,
        SensorKind::Light,
        SensorKind::Ph,
        SensorKind::WindSpeed,
        SensorKind::WindDirection,
        SensorKind::Rainfall,
        SensorKind::Co2,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::Humidity => "humidity",
            SensorKind::SoilMoisture => "soil_moisture",
            SensorKind::SoilTemperature => "soil_temperature",
            SensorKind::Light => "light",
            SensorKind::Ph => "ph",
            SensorKind::WindSpeed => "wind_speed",
            SensorKind::WindDirection => "wind_direction",
            SensorKind::Rainfall => "rainfall",
            SensorKind::Co2 => "co2",
        }
    }
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Error for [`SensorKind::from_str`] on an unrecognized kind string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown sensor kind: {0}")]
pub struct UnknownSensorKind(pub String);

impl std::str::FromStr for SensorKind {
    type Err = UnknownSensorKind;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        SensorKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == raw)
            .ok_or_else(|| UnknownSensorKind(raw.to_string()))
    }
}

/// Reading status as stamped by the platform's threshold check.
///
/// The wire column is free-form; anything unrecognized decodes as `Normal`
/// so a vocabulary drift on the server never drops an otherwise valid
/// reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingStatus {
    #[default]
    Normal,
    Low,
    High,
    Warning,
    Critical,
}

impl ReadingStatus {
    /// Whether the value sits outside its configured range.
    pub fn is_out_of_range(self) -> bool {
        !matches!(self, ReadingStatus::Normal)
    }
}

impl<'de> Deserialize<'de> for ReadingStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "low" => ReadingStatus::Low,
            "high" => ReadingStatus::High,
            "warning" => ReadingStatus::Warning,
            "critical" => ReadingStatus::Critical,
            _ => ReadingStatus::Normal,
        })
    }
}

/// A reading that must not enter the live view.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidReading {
    #[error("non-finite value: {0}")]
    NonFiniteValue(f64),
    #[error("empty sensor id")]
    EmptySensorId,
}

/// One telemetry sample as broadcast on the `sensor_data` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub id: i64,
    pub sensor_id: String,
    #[serde(rename = "type")]
    pub kind: SensorKind,
    pub value: f64,
    pub unit: String,
    pub location_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub status: ReadingStatus,
    #[serde(with = "timefmt::lenient")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<i64>,
}

const SYNTHETIC_TAG: &str = "synthetic";

impl Reading {
    /// Reject samples that must not enter the live view.
    pub fn validate(&self) -> Result<(), InvalidReading> {
        if !self.value.is_finite() {
            return Err(InvalidReading::NonFiniteValue(self.value));
        }
        if self.sensor_id.is_empty() {
            return Err(InvalidReading::EmptySensorId);
        }
        Ok(())
    }

    /// Owner encoded in the sensor id naming convention
    /// (`{owner}_{kind}_{n}`), if the leading segment is numeric.
    pub fn inferred_owner(&self) -> Option<i64> {
        self.sensor_id
            .split('_')
            .next()
            .and_then(|token| token.parse().ok())
    }

    /// Tag this reading as fabricated backfill rather than measured data.
    pub fn mark_synthetic(&mut self) {
        let tags = self
            .metadata
            .get_or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        if let serde_json::Value::Object(map) = tags {
            map.insert(SYNTHETIC_TAG.to_string(), serde_json::Value::Bool(true));
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|meta| meta.get(SYNTHETIC_TAG))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}
