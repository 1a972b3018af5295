//! Alert thresholds as carried by the `thresholds_data` topic.

use serde::{Deserialize, Serialize};

use crate::reading::{ReadingStatus, SensorKind};

/// Per-kind alert range. CamelCase field names match the wire payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThreshold {
    pub id: String,
    #[serde(rename = "sensorType")]
    pub sensor_kind: SensorKind,
    pub min: f64,
    pub max: f64,
    pub unit: String,
    #[serde(rename = "isActive", default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl AlertThreshold {
    /// Client-side counterpart of the platform's threshold check: below the
    /// minimum stamps `low`, above the maximum stamps `high`, inactive
    /// thresholds never fire.
    pub fn evaluate(&self, value: f64) -> ReadingStatus {
        if !self.is_active {
            return ReadingStatus::Normal;
        }
        if value < self.min {
            ReadingStatus::Low
        } else if value > self.max {
            ReadingStatus::High
        } else {
            ReadingStatus::Normal
        }
    }
}
